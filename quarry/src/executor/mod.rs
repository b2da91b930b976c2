//! SQL execution collaborator
//!
//! The aggregation engine never talks to the column store directly. It hands
//! SQL text to a [`SqlExecutor`] and gets back decoded [`ResultRow`]s. The
//! [`StatementRunner`] fans a request's statements out with bounded
//! parallelism; [`RecordedExecutor`] replays canned results.

mod recorded;
mod runner;
mod value;

pub use recorded::{normalize_sql, RecordedExecutor, RecordedStatement};
pub use runner::{PendingStatement, StatementOutcome, StatementRunner};
pub use value::{ColumnValue, NumericValue};

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("Store error: {0}")]
    Store(String),

    #[error("Statement timed out after {0:?}")]
    Timeout(Duration),

    #[error("Statement cancelled")]
    Cancelled,

    #[error("Cannot decode result row: {0}")]
    Decode(String),
}

impl ExecutionError {
    /// Short label used for metrics and warnings
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::Store(_) => "store",
            ExecutionError::Timeout(_) => "timeout",
            ExecutionError::Cancelled => "cancelled",
            ExecutionError::Decode(_) => "decode",
        }
    }
}

/// One named column of a result row
#[derive(Debug, Clone, PartialEq)]
pub struct ResultColumn {
    pub name: String,
    pub value: ColumnValue,
}

impl ResultColumn {
    pub fn new(name: impl Into<String>, value: impl Into<ColumnValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// One row as returned by the store, columns in SELECT order
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultRow {
    pub columns: Vec<ResultColumn>,
}

impl ResultRow {
    pub fn new(columns: Vec<ResultColumn>) -> Self {
        Self { columns }
    }

    /// Build a row from unnamed values, columns are named `c0`, `c1`, ...
    pub fn from_values<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<ColumnValue>,
    {
        Self {
            columns: values
                .into_iter()
                .enumerate()
                .map(|(i, v)| ResultColumn::new(format!("c{i}"), v))
                .collect(),
        }
    }

    /// Decode a JSON row: an object keeps its column names, an array gets
    /// positional names
    pub fn from_json(row: Value) -> Result<Self, ExecutionError> {
        match row {
            Value::Object(map) => Ok(Self {
                columns: map
                    .into_iter()
                    .map(|(name, value)| ResultColumn::new(name, value))
                    .collect(),
            }),
            Value::Array(values) => Ok(Self::from_values(values)),
            other => Err(ExecutionError::Decode(format!(
                "expected object or array, got {other}"
            ))),
        }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn value(&self, index: usize) -> Option<&ColumnValue> {
        self.columns.get(index).map(|c| &c.value)
    }

    pub fn column(&self, index: usize) -> Option<&ResultColumn> {
        self.columns.get(index)
    }
}

/// Executes SQL against the column store
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<Vec<ResultRow>, ExecutionError>;
}
