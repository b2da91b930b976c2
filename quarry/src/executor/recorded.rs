use super::{ExecutionError, ResultRow, SqlExecutor};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// A canned statement result
///
/// ```json
/// {"sql": "SELECT count() FROM \"t\"", "rows": [{"count()": 4}]}
/// {"sql": "SELECT ...", "error": "connection reset"}
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecordedStatement {
    pub sql: String,
    #[serde(default)]
    pub rows: Vec<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Collapse whitespace so recorded SQL matches regardless of formatting
pub fn normalize_sql(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Executor that replays recorded results keyed by SQL text
#[derive(Clone, Default)]
pub struct RecordedExecutor {
    statements: Arc<HashMap<String, Result<Vec<Value>, String>>>,
    executed: Arc<Mutex<Vec<String>>>,
}

impl RecordedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_statements(statements: Vec<RecordedStatement>) -> Self {
        let mut map = HashMap::new();
        for statement in statements {
            let outcome = match statement.error {
                Some(error) => Err(error),
                None => Ok(statement.rows),
            };
            map.insert(normalize_sql(&statement.sql), outcome);
        }
        Self {
            statements: Arc::new(map),
            executed: Arc::default(),
        }
    }

    /// Load a JSON array of [`RecordedStatement`]s
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let statements: Vec<RecordedStatement> = serde_json::from_str(&content)?;
        Ok(Self::from_statements(statements))
    }

    pub fn with_rows(self, sql: &str, rows: Vec<Value>) -> Self {
        self.with_outcome(sql, Ok(rows))
    }

    pub fn with_failure(self, sql: &str, error: &str) -> Self {
        self.with_outcome(sql, Err(error.to_string()))
    }

    fn with_outcome(mut self, sql: &str, outcome: Result<Vec<Value>, String>) -> Self {
        Arc::make_mut(&mut self.statements).insert(normalize_sql(sql), outcome);
        self
    }

    /// SQL seen so far, in execution order
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }
}

#[async_trait]
impl SqlExecutor for RecordedExecutor {
    async fn execute(&self, sql: &str) -> Result<Vec<ResultRow>, ExecutionError> {
        let key = normalize_sql(sql);
        self.executed.lock().push(key.clone());
        match self.statements.get(&key) {
            Some(Ok(rows)) => rows.iter().cloned().map(ResultRow::from_json).collect(),
            Some(Err(error)) => Err(ExecutionError::Store(error.clone())),
            None => Err(ExecutionError::Store(format!("no recorded result for: {key}"))),
        }
    }
}
