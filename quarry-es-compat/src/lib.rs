//! Elasticsearch aggregation layer for quarry
//!
//! Lets Elasticsearch clients such as Kibana run aggregations against a
//! ClickHouse-family column store. A search body is compiled into SQL,
//! the statements run through a [`quarry::executor::SqlExecutor`], and the
//! flat results are rebuilt into the nested `aggregations` response.
//!
//! # Query DSL Support
//!
//! Supported query types:
//! - `match_all` / `match_none`
//! - `bool` (must, should, must_not, filter)
//! - `match` / `match_phrase`
//! - `term` / `terms`
//! - `range`
//! - `exists` / `prefix` / `wildcard` / `ids`
//! - `query_string` / `simple_query_string` through a [`query::LuceneParser`]
//!
//! Supported aggregations:
//! - bucket: `terms`, `histogram`, `date_histogram`, `range`, `date_range`,
//!   `filter`, `filters`
//! - metric: `avg`, `sum`, `min`, `max`, `value_count`, `cardinality`,
//!   `stats`, `percentiles`, `top_hits`, `top_metrics`
//! - pipeline: `cumulative_sum`, `derivative`, `min_bucket`, `max_bucket`,
//!   `avg_bucket`, `sum_bucket`, `bucket_script`

pub mod aggregations;
pub mod engine;
pub mod error;
pub mod query;
pub mod response;

pub use engine::AggregationEngine;
pub use error::EsCompatError;
pub use response::{AggregationResponse, AggregationWarning, RequestPhase};

/// Result type for ES compat operations
pub type Result<T> = std::result::Result<T, EsCompatError>;
