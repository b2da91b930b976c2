use super::{ExecutionError, ResultRow, SqlExecutor};
use crate::metrics;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Outcome of one planned statement
#[derive(Debug, Clone, PartialEq)]
pub enum StatementOutcome {
    /// The statement ran and returned rows
    Rows(Vec<ResultRow>),
    /// The statement failed, timed out or was cancelled
    Failed(ExecutionError),
    /// Nothing to run (computed in-process)
    Skipped,
}

impl StatementOutcome {
    pub fn rows(&self) -> Option<&[ResultRow]> {
        match self {
            StatementOutcome::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ExecutionError> {
        match self {
            StatementOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// A started statement, awaited on its own
///
/// Dropping it before the outcome is read cancels the statement.
pub struct PendingStatement(Option<JoinHandle<StatementOutcome>>);

impl PendingStatement {
    pub async fn outcome(mut self) -> StatementOutcome {
        let Some(handle) = self.0.take() else {
            return StatementOutcome::Skipped;
        };
        match handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Statement task ended without an outcome: {}", e);
                StatementOutcome::Failed(ExecutionError::Cancelled)
            }
        }
    }
}

impl Drop for PendingStatement {
    fn drop(&mut self) {
        if let Some(handle) = &self.0 {
            handle.abort();
        }
    }
}

/// Runs a request's statements with bounded parallelism
///
/// Every statement runs at most once. Failures are reported per statement so
/// the caller can still use the others.
#[derive(Clone)]
pub struct StatementRunner {
    executor: Arc<dyn SqlExecutor>,
    semaphore: Arc<Semaphore>,
    timeout: Option<Duration>,
}

impl StatementRunner {
    pub fn new(
        executor: Arc<dyn SqlExecutor>,
        max_concurrent: usize,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            executor,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            timeout,
        }
    }

    /// Start every statement, `None` entries are skipped
    ///
    /// Handles come back in input order so callers can wait on exactly the
    /// statements they need.
    pub fn start_all(&self, statements: &[Option<String>]) -> Vec<PendingStatement> {
        statements
            .iter()
            .enumerate()
            .map(|(index, sql)| {
                let handle = sql.clone().map(|sql| {
                    let runner = self.clone();
                    tokio::spawn(async move { runner.run_one(index, &sql).await })
                });
                PendingStatement(handle)
            })
            .collect()
    }

    async fn run_one(&self, index: usize, sql: &str) -> StatementOutcome {
        let Ok(_permit) = self.semaphore.acquire().await else {
            return StatementOutcome::Failed(ExecutionError::Cancelled);
        };

        let start = Instant::now();
        debug!("Executing statement {}: {}", index, sql);

        let result = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.executor.execute(sql))
                .await
                .unwrap_or(Err(ExecutionError::Timeout(limit))),
            None => self.executor.execute(sql).await,
        };

        let elapsed = start.elapsed();
        match result {
            Ok(rows) => {
                debug!(
                    "Statement {} returned {} rows in {:?}",
                    index,
                    rows.len(),
                    elapsed
                );
                metrics::record_statement_success(elapsed);
                StatementOutcome::Rows(rows)
            }
            Err(e) => {
                warn!("Statement {} failed: {}", index, e);
                metrics::record_statement_failure(e.kind(), elapsed);
                StatementOutcome::Failed(e)
            }
        }
    }
}
