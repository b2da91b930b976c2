//! Core building blocks for quarry
//!
//! quarry lets Elasticsearch and Kibana clients query a ClickHouse-family
//! column store. This crate holds the pieces shared by every front end:
//!
//! - [`config`] - TOML configuration (`quarry.toml`)
//! - [`schema`] - read-only field lookup (type, aggregatable, searchable)
//! - [`executor`] - result rows, the SQL execution collaborator and the
//!   bounded-parallel statement runner
//! - [`metrics`] - counters and histograms recorded along the way

pub mod config;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod schema;

pub use error::{Error, Result};
