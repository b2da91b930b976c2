//! Search request engine
//!
//! Drives one request through compile, plan, execute and reconstruct.
//! Subtree problems become warnings on the response; only an unreadable
//! body, an untranslatable query or a plan/result mismatch fail the request.

use crate::aggregations::compiler::AggregationCompiler;
use crate::aggregations::planner::{QueryPlan, QueryPlanner};
use crate::aggregations::node::AggregationTree;
use crate::aggregations::reconstruct::{Reconstructor, TopLevel};
use crate::error::EsCompatError;
use crate::query::translator::{LuceneParser, WhereTranslator};
use crate::query::types::SearchBody;
use crate::response::{render_level, AggregationResponse, AggregationWarning, RequestPhase, WarningPhase};
use crate::Result;
use chrono::{DateTime, Utc};
use quarry::config::EngineConfig;
use quarry::executor::{PendingStatement, SqlExecutor, StatementOutcome, StatementRunner};
use quarry::schema::SchemaLookup;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub struct AggregationEngine {
    config: EngineConfig,
    schema: Arc<dyn SchemaLookup>,
    runner: StatementRunner,
    lucene: Option<Arc<dyn LuceneParser>>,
}

/// A compiled and planned request
struct Prepared {
    tree: AggregationTree,
    plan: QueryPlan,
    warnings: Vec<AggregationWarning>,
}

impl AggregationEngine {
    pub fn new(config: &EngineConfig, schema: Arc<dyn SchemaLookup>, executor: Arc<dyn SqlExecutor>) -> Self {
        Self {
            runner: StatementRunner::new(executor, config.max_concurrent_statements, config.statement_timeout()),
            config: config.clone(),
            schema,
            lucene: None,
        }
    }

    /// Install the collaborator used for `query_string` queries
    pub fn with_lucene_parser(mut self, parser: Arc<dyn LuceneParser>) -> Self {
        self.lucene = Some(parser);
        self
    }

    pub fn table(&self) -> &str {
        &self.config.table
    }

    /// Compile and plan without executing anything
    pub fn explain(&self, body: &Value) -> Result<QueryPlan> {
        self.prepare(body).map(|prepared| prepared.plan)
    }

    pub async fn search(&self, body: &Value) -> Result<AggregationResponse> {
        self.search_at(body, Utc::now()).await
    }

    /// Run a search, resolving date math against `now`
    pub async fn search_at(&self, body: &Value, now: DateTime<Utc>) -> Result<AggregationResponse> {
        let started = Instant::now();
        let prepared = match self.prepare(body) {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(error = %e, "Search request failed to compile");
                quarry::metrics::record_request_finished(RequestPhase::CompileFailed.as_str(), started.elapsed());
                return Err(e);
            }
        };
        let Prepared {
            tree,
            plan,
            mut warnings,
        } = prepared;

        debug!(phase = %RequestPhase::Executing, statements = plan.db_statement_count(), "Executing statements");
        let mut pending: Vec<Option<PendingStatement>> =
            self.runner.start_all(&plan.sql()).into_iter().map(Some).collect();

        // each top-level group waits only on its own statements
        let mut top = TopLevel::new(&tree);
        for &index in &tree.evaluation_order {
            if tree.aggregations[index].is_pipeline() {
                top.evaluate_pipeline(index);
                continue;
            }
            let Some(group) = top.group(&plan, index) else {
                continue;
            };
            let mut scoped = vec![StatementOutcome::Skipped; plan.statements.len()];
            for &statement in &group.statements {
                if let Some(handle) = pending[statement].take() {
                    scoped[statement] = handle.outcome().await;
                }
            }
            debug!(
                phase = %RequestPhase::Reconstructing,
                aggregations = group.nodes.len(),
                statements = group.statements.len(),
                "Reconstructing aggregations"
            );
            top.fill(&Reconstructor::new(&plan, &scoped, now)?, &group);
        }
        let reconstructed = top.finish();

        for failure in &reconstructed.failures {
            quarry::metrics::record_aggregation_dropped("execution");
            warnings.push(AggregationWarning {
                aggregation: failure.aggregation.clone(),
                phase: WarningPhase::Execution,
                reason: failure.error.to_string(),
            });
        }

        for failure in &reconstructed.pipeline_failures {
            quarry::metrics::record_aggregation_dropped("execution");
            warnings.push(AggregationWarning {
                aggregation: failure.aggregation.clone(),
                phase: WarningPhase::Execution,
                reason: format!("buckets_path source [{}] failed", failure.sources.join(", ")),
            });
        }

        let phase = match reconstructed.failures.len() {
            0 => RequestPhase::Done,
            failed => RequestPhase::ExecutionFailed { failed },
        };
        let elapsed = started.elapsed();
        info!(
            phase = %phase,
            statements = plan.statements.len(),
            warnings = warnings.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Search request finished"
        );
        quarry::metrics::record_request_finished(phase.as_str(), elapsed);

        Ok(AggregationResponse {
            aggregations: render_level(&tree.aggregations, &reconstructed.values),
            warnings,
            phase,
        })
    }

    fn prepare(&self, body: &Value) -> Result<Prepared> {
        let search: SearchBody =
            serde_json::from_value(body.clone()).map_err(|e| EsCompatError::InvalidRequestBody(e.to_string()))?;
        let table = self.config.table.as_str();
        let lucene = self.lucene.as_deref();

        let base_where = match &search.query {
            Some(query) => WhereTranslator::new(self.schema.as_ref(), table)
                .with_lucene(lucene)
                .translate(query)?,
            None => None,
        };

        let compiled = AggregationCompiler::new(self.schema.as_ref(), table)
            .with_lucene(lucene)
            .with_default_terms_size(self.config.default_terms_size)
            .compile(&search.aggs.unwrap_or_default());
        debug!(
            phase = %RequestPhase::Compiled,
            aggregations = compiled.tree.aggregations.len(),
            dropped = compiled.warnings.len(),
            "Compiled aggregations"
        );

        let plan = QueryPlanner::new(table, base_where.as_deref())
            .with_merge_conditional(self.config.merge_conditional_buckets)
            .plan(&compiled.tree);
        debug!(phase = %RequestPhase::Planned, statements = plan.statements.len(), "Planned request");

        let warnings = compiled
            .warnings
            .into_iter()
            .map(|w| AggregationWarning {
                aggregation: w.aggregation,
                phase: WarningPhase::Compile,
                reason: w.error.to_string(),
            })
            .collect();
        Ok(Prepared {
            tree: compiled.tree,
            plan,
            warnings,
        })
    }
}
