use super::{load_schema, read_body};
use anyhow::Result;
use quarry::config::Config;
use quarry::executor::RecordedExecutor;
use quarry_es_compat::AggregationEngine;
use std::path::Path;
use std::sync::Arc;

/// Print every planned statement, one per line
pub fn run_explain(config: &Config, schema: Option<&Path>, body: &Path) -> Result<()> {
    let schema = load_schema(schema)?;
    let body = read_body(body)?;

    // planning never executes, any executor will do
    let engine = AggregationEngine::new(&config.engine, schema, Arc::new(RecordedExecutor::new()));
    let plan = engine.explain(&body)?;

    println!("Table: {}", plan.table);
    println!(
        "Statements: {} ({} database, {} merged)",
        plan.statements.len(),
        plan.db_statement_count(),
        plan.merged_count()
    );
    println!();
    print!("{plan}");
    Ok(())
}
