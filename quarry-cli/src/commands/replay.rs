use super::{load_schema, read_body};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use quarry::config::Config;
use quarry::executor::RecordedExecutor;
use quarry_es_compat::AggregationEngine;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

/// Execute against recorded results and print the `aggregations` JSON
pub async fn run_replay(
    config: &Config,
    schema: Option<&Path>,
    body: &Path,
    fixtures: &Path,
    now: Option<&str>,
) -> Result<()> {
    let schema = load_schema(schema)?;
    let body = read_body(body)?;
    let executor = RecordedExecutor::from_file(fixtures)
        .with_context(|| format!("Failed to load fixtures from {:?}", fixtures))?;
    let now = match now {
        Some(text) => DateTime::parse_from_rfc3339(text)
            .with_context(|| format!("Invalid --now '{}'", text))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };

    let engine = AggregationEngine::new(&config.engine, schema, Arc::new(executor));
    let response = engine.search_at(&body, now).await?;

    for warning in &response.warnings {
        tracing::warn!(
            aggregation = %warning.aggregation,
            phase = ?warning.phase,
            "{}",
            warning.reason
        );
    }
    tracing::info!(phase = %response.phase, "Replay finished");

    let output = json!({ "aggregations": response.aggregations });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
