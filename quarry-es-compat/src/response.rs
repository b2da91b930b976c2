//! Elasticsearch response rendering
//!
//! Turns the reconstructed tree into the `aggregations` object clients
//! expect. Keys follow request order; aggregations dropped at compile time
//! are absent and aggregations whose statement failed render as `null`.

use crate::aggregations::node::AggregationNode;
use crate::aggregations::reconstruct::{AggValue, Bucket, MetricValue};
use quarry::executor::NumericValue;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::fmt;

/// How far a search request got
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Compiled,
    Planned,
    Executing,
    Reconstructing,
    Done,
    CompileFailed,
    /// Finished with `failed` statements missing
    ExecutionFailed { failed: usize },
}

impl RequestPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestPhase::Compiled => "compiled",
            RequestPhase::Planned => "planned",
            RequestPhase::Executing => "executing",
            RequestPhase::Reconstructing => "reconstructing",
            RequestPhase::Done => "done",
            RequestPhase::CompileFailed => "compile_failed",
            RequestPhase::ExecutionFailed { .. } => "execution_failed",
        }
    }
}

impl fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestPhase::ExecutionFailed { failed } => write!(f, "execution_failed({failed})"),
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningPhase {
    Compile,
    Execution,
}

/// An aggregation that is missing from, or `null` in, the response
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregationWarning {
    pub aggregation: String,
    pub phase: WarningPhase,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregationResponse {
    pub aggregations: Map<String, Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<AggregationWarning>,
    #[serde(skip)]
    pub phase: RequestPhase,
}

impl AggregationResponse {
    /// The `aggregations` section as a JSON value
    pub fn aggregations_json(&self) -> Value {
        Value::Object(self.aggregations.clone())
    }
}

/// Render one level, values aligned with `nodes`
pub fn render_level(nodes: &[AggregationNode], values: &[AggValue]) -> Map<String, Value> {
    nodes
        .iter()
        .zip(values)
        .map(|(node, value)| (node.name.clone(), render_value(node, value)))
        .collect()
}

fn render_value(node: &AggregationNode, value: &AggValue) -> Value {
    match value {
        AggValue::Failed | AggValue::Pending => Value::Null,
        AggValue::Metric(metric) => render_metric(metric),
        AggValue::SingleBucket(bucket) => Value::Object(render_bucket(node, bucket, false)),
        AggValue::MultiBucket { buckets, keyed, extra } => {
            let mut out: Map<String, Value> = extra.iter().cloned().collect();
            let rendered = if *keyed {
                Value::Object(
                    buckets
                        .iter()
                        .map(|b| (b.label.clone().unwrap_or_default(), Value::Object(render_bucket(node, b, true))))
                        .collect(),
                )
            } else {
                Value::Array(
                    buckets
                        .iter()
                        .map(|b| Value::Object(render_bucket(node, b, false)))
                        .collect(),
                )
            };
            out.insert("buckets".into(), rendered);
            Value::Object(out)
        }
    }
}

fn render_bucket(node: &AggregationNode, bucket: &Bucket, keyed: bool) -> Map<String, Value> {
    let mut out = Map::new();
    if !keyed {
        if let Some(key) = &bucket.key {
            out.insert("key".into(), key.clone());
        }
    }
    for (name, value) in &bucket.head {
        out.insert(name.clone(), value.clone());
    }
    out.insert("doc_count".into(), json!(bucket.doc_count));
    out.extend(render_level(&node.children, &bucket.children));
    out
}

fn numeric(value: &Option<NumericValue>) -> Value {
    value.map(|v| v.to_json()).unwrap_or(Value::Null)
}

fn render_metric(metric: &MetricValue) -> Value {
    match metric {
        MetricValue::Single { value, as_string } => {
            let mut out = Map::new();
            out.insert("value".into(), numeric(value));
            if let Some(text) = as_string {
                out.insert("value_as_string".into(), json!(text));
            }
            Value::Object(out)
        }
        MetricValue::Stats {
            count,
            min,
            max,
            avg,
            sum,
        } => json!({
            "count": count,
            "min": numeric(min),
            "max": numeric(max),
            "avg": numeric(avg),
            "sum": numeric(sum),
        }),
        MetricValue::Percentiles { values, keyed } => {
            let rendered = if *keyed {
                Value::Object(values.iter().map(|(key, v)| (key.clone(), json!(v))).collect())
            } else {
                Value::Array(
                    values
                        .iter()
                        .map(|(key, v)| {
                            let key = key.parse::<f64>().map(|k| json!(k)).unwrap_or_else(|_| json!(key));
                            json!({"key": key, "value": v})
                        })
                        .collect(),
                )
            };
            json!({ "values": rendered })
        }
        MetricValue::BucketKeys { value, keys } => json!({
            "value": numeric(value),
            "keys": keys,
        }),
        MetricValue::Document(document) => document.clone(),
    }
}
