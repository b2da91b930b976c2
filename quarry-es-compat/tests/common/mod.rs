//! Shared fixtures for engine tests
//!
//! SQL is taken from the engine's own plan and paired with canned rows, so
//! tests describe results per statement rather than by SQL text.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use quarry::config::EngineConfig;
use quarry::executor::RecordedExecutor;
use quarry::schema::{FieldInfo, FieldType, SchemaLookup, SchemaRegistry, TableSchema};
use quarry_es_compat::{AggregationEngine, AggregationResponse};
use serde_json::Value;
use std::sync::Arc;

pub const TABLE: &str = "logs";

pub fn schema() -> Arc<dyn SchemaLookup> {
    let registry = SchemaRegistry::new();
    registry.register(
        TableSchema::new(TABLE)
            .with_field(FieldInfo::new("ts", FieldType::Timestamp))
            .with_field(FieldInfo::new("host", FieldType::Keyword))
            .with_field(FieldInfo::new("status", FieldType::Long))
            .with_field(FieldInfo::new("bytes", FieldType::Long))
            .with_field(FieldInfo::new("n", FieldType::Long))
            .with_field(FieldInfo::new("latency", FieldType::Float))
            .with_field(FieldInfo::new("active", FieldType::Boolean))
            .with_field(FieldInfo::new("message", FieldType::Text)),
    );
    Arc::new(registry)
}

pub fn config() -> EngineConfig {
    EngineConfig {
        table: TABLE.into(),
        ..EngineConfig::default()
    }
}

/// 2024-01-01T12:00:00Z
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
}

/// What a database statement answers
pub enum Answer {
    Rows(Vec<Value>),
    Fail(&'static str),
}

/// SQL of every database statement the engine would run, in plan order
pub fn planned_sql(config: &EngineConfig, body: &Value) -> Vec<String> {
    let planning = AggregationEngine::new(config, schema(), Arc::new(RecordedExecutor::new()));
    planning.explain(body).unwrap().sql().into_iter().flatten().collect()
}

/// Run `body` with one answer per database statement
pub async fn run_with(config: &EngineConfig, body: &Value, answers: Vec<Answer>) -> AggregationResponse {
    let sql = planned_sql(config, body);
    assert_eq!(sql.len(), answers.len(), "planned statements: {sql:#?}");

    let mut executor = RecordedExecutor::new();
    for (sql, answer) in sql.iter().zip(answers) {
        executor = match answer {
            Answer::Rows(rows) => executor.with_rows(sql, rows),
            Answer::Fail(error) => executor.with_failure(sql, error),
        };
    }
    AggregationEngine::new(config, schema(), Arc::new(executor))
        .search_at(body, now())
        .await
        .unwrap()
}

pub async fn run(body: &Value, answers: Vec<Vec<Value>>) -> AggregationResponse {
    run_with(&config(), body, answers.into_iter().map(Answer::Rows).collect()).await
}
