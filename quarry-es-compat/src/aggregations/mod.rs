//! Aggregation compilation and result reconstruction
//!
//! A request's `aggs` object flows through these modules in order:
//!
//! 1. [`compiler`] turns the DSL into a typed [`node::AggregationTree`],
//!    dropping unsupported subtrees with a warning and resolving every
//!    `buckets_path` ([`buckets_path`]) and `bucket_script` ([`script`]).
//! 2. [`planner`] lowers the tree into SQL statements, merging conditional
//!    branches into one statement where possible.
//! 3. [`reconstruct`] matches result rows back to buckets by key prefix and
//!    rebuilds the nested tree.
//! 4. [`pipeline`] evaluates pipeline aggregations over the rebuilt buckets.

pub mod buckets_path;
pub mod compiler;
pub mod node;
pub mod pipeline;
pub mod planner;
pub mod reconstruct;
pub mod script;

pub use buckets_path::{BucketsPathReference, PathValue};
pub use compiler::{AggregationCompiler, CompileWarning, CompiledAggregations};
pub use node::{AggregationKind, AggregationNode, AggregationTree};
pub use planner::{CompiledQuery, QueryPlan, QueryPlanner};
pub use reconstruct::{AggValue, Bucket, MetricValue, Reconstructed, Reconstructor, TopLevel, TopLevelGroup};
