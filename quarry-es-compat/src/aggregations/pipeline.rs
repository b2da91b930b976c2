//! Pipeline evaluation
//!
//! Pipelines run in memory once the buckets of a level are built. Parent
//! pipelines (`cumulative_sum`, `derivative`, `bucket_script`) add a value
//! to every bucket of their multi-bucket parent. Sibling pipelines
//! (`*_bucket`) fold the buckets of a sibling multi-bucket aggregation into
//! one value. Levels are evaluated bottom-up and siblings in dependency
//! order, so a pipeline may read another pipeline's output.
//!
//! A pipeline that reads a failed aggregation fails as well rather than
//! folding over the data that did arrive.

use crate::aggregations::buckets_path::{BucketsPathReference, PathValue};
use crate::aggregations::node::{find_child, AggregationNode, PipelineAggregation, PipelineFunction};
use crate::aggregations::reconstruct::{AggValue, Bucket, MetricValue};
use quarry::executor::NumericValue;
use std::cmp::Ordering;
use std::collections::HashMap;

/// A pipeline left without a value because an aggregation it reads failed
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineFailure {
    /// `>` separated path of the pipeline
    pub aggregation: String,
    /// Siblings named by its buckets_path
    pub sources: Vec<String>,
}

/// Evaluate the pipelines among `nodes` for every bucket of one level
pub fn evaluate_level(nodes: &[AggregationNode], order: &[usize], buckets: &mut [Bucket]) {
    for &index in order {
        let Some(pipeline) = nodes.get(index).and_then(AggregationNode::pipeline) else {
            continue;
        };
        let gaps = pipeline.gap_policy;
        match &pipeline.function {
            function if function.is_sibling() => {
                for bucket in buckets.iter_mut() {
                    bucket.children[index] = match sibling(nodes, &bucket.children, pipeline, function) {
                        Some(value) => AggValue::Metric(value),
                        None => AggValue::Failed,
                    };
                }
            }
            _ if buckets.iter().any(|b| reads_failed(nodes, &b.children, pipeline)) => {
                for bucket in buckets.iter_mut() {
                    bucket.children[index] = AggValue::Failed;
                }
            }
            PipelineFunction::CumulativeSum => {
                let mut total = NumericValue::Int(0);
                for bucket in buckets.iter_mut() {
                    if let Some(value) = read_single(nodes, bucket, pipeline) {
                        total = total.add(value);
                    }
                    bucket.children[index] = AggValue::Metric(MetricValue::single(Some(total)));
                }
            }
            PipelineFunction::Derivative => {
                let mut previous: Option<NumericValue> = None;
                for (position, bucket) in buckets.iter_mut().enumerate() {
                    let current = read_single(nodes, bucket, pipeline);
                    let derivative = match (previous, current) {
                        (Some(prev), Some(cur)) if position > 0 => Some(cur.sub(prev)),
                        _ => None,
                    };
                    bucket.children[index] = AggValue::Metric(MetricValue::single(derivative));
                    previous = current;
                }
            }
            PipelineFunction::BucketScript(script) => {
                for bucket in buckets.iter_mut() {
                    let vars: Option<HashMap<String, f64>> = pipeline
                        .paths
                        .iter()
                        .map(|(var, reference)| {
                            gaps.fill(lookup(nodes, &bucket.children, bucket.doc_count, reference))
                                .map(|v| (var.clone(), v.as_f64()))
                        })
                        .collect();
                    let value = vars
                        .and_then(|vars| script.eval(&vars))
                        .map(NumericValue::Float);
                    bucket.children[index] = AggValue::Metric(MetricValue::single(value));
                }
            }
            _ => {}
        }
    }
}

/// Name every failed pipeline under `nodes`, once per pipeline
pub fn collect_failures(nodes: &[AggregationNode], values: &[AggValue], parent: &str, out: &mut Vec<PipelineFailure>) {
    for (node, value) in nodes.iter().zip(values) {
        let name = if parent.is_empty() {
            node.name.clone()
        } else {
            format!("{parent}>{}", node.name)
        };
        match value {
            AggValue::Failed => {
                if let Some(pipeline) = node.pipeline() {
                    if !out.iter().any(|f| f.aggregation == name) {
                        out.push(PipelineFailure {
                            aggregation: name,
                            sources: pipeline.sibling_dependencies().into_iter().map(String::from).collect(),
                        });
                    }
                }
            }
            AggValue::MultiBucket { buckets, .. } => {
                for bucket in buckets {
                    collect_failures(&node.children, &bucket.children, &name, out);
                }
            }
            AggValue::SingleBucket(bucket) => collect_failures(&node.children, &bucket.children, &name, out),
            _ => {}
        }
    }
}

fn read_single(nodes: &[AggregationNode], bucket: &Bucket, pipeline: &PipelineAggregation) -> Option<NumericValue> {
    let (_, reference) = pipeline.paths.first()?;
    pipeline
        .gap_policy
        .fill(lookup(nodes, &bucket.children, bucket.doc_count, reference))
}

/// Whether any path of `pipeline` runs into a failed aggregation
fn reads_failed(nodes: &[AggregationNode], values: &[AggValue], pipeline: &PipelineAggregation) -> bool {
    pipeline
        .paths
        .iter()
        .any(|(_, reference)| path_failed(nodes, values, reference))
}

fn path_failed(nodes: &[AggregationNode], values: &[AggValue], reference: &BucketsPathReference) -> bool {
    let Some((index, node)) = reference.first_segment().and_then(|name| find_child(nodes, name)) else {
        return false;
    };
    match values.get(index) {
        Some(AggValue::Failed) => true,
        Some(AggValue::SingleBucket(bucket)) => reference
            .descend()
            .is_some_and(|inner| path_failed(&node.children, &bucket.children, &inner)),
        _ => false,
    }
}

/// Read the value a resolved path points at, starting from one bucket's children
pub fn lookup(
    nodes: &[AggregationNode],
    values: &[AggValue],
    doc_count: u64,
    reference: &BucketsPathReference,
) -> Option<NumericValue> {
    let BucketsPathReference::Named { path, value } = reference else {
        return Some(NumericValue::UInt(doc_count));
    };
    let (index, node) = find_child(nodes, path.first()?)?;
    let target = values.get(index)?;

    if path.len() > 1 {
        let AggValue::SingleBucket(bucket) = target else {
            return None;
        };
        return lookup(&node.children, &bucket.children, bucket.doc_count, &reference.descend()?);
    }

    match (target, value) {
        (AggValue::SingleBucket(bucket), PathValue::Count) => Some(NumericValue::UInt(bucket.doc_count)),
        (AggValue::Metric(metric), PathValue::Default) => match metric {
            MetricValue::Single { value, .. } | MetricValue::BucketKeys { value, .. } => *value,
            MetricValue::Percentiles { values, .. } if values.len() == 1 => {
                values[0].1.map(NumericValue::Float)
            }
            _ => None,
        },
        (AggValue::Metric(metric), PathValue::Metric(name)) => select(metric, name),
        _ => None,
    }
}

fn select(metric: &MetricValue, name: &str) -> Option<NumericValue> {
    match metric {
        MetricValue::Stats {
            count,
            min,
            max,
            avg,
            sum,
        } => match name {
            "count" => Some(NumericValue::UInt(*count)),
            "min" => *min,
            "max" => *max,
            "avg" => *avg,
            "sum" => *sum,
            _ => None,
        },
        MetricValue::Percentiles { values, .. } => {
            let wanted = name.parse::<f64>().ok();
            values
                .iter()
                .find(|(key, _)| key == name || (wanted.is_some() && key.parse::<f64>().ok() == wanted))
                .and_then(|(_, v)| v.map(NumericValue::Float))
        }
        MetricValue::Single { value, .. } | MetricValue::BucketKeys { value, .. } if name == "value" => *value,
        _ => None,
    }
}

/// Fold the sibling's buckets, `None` when the sibling or a value it holds failed
fn sibling(
    nodes: &[AggregationNode],
    values: &[AggValue],
    pipeline: &PipelineAggregation,
    function: &PipelineFunction,
) -> Option<MetricValue> {
    let points = sibling_points(nodes, values, pipeline)?;
    let value = match function {
        PipelineFunction::MinBucket => extreme(points, Ordering::Less),
        PipelineFunction::MaxBucket => extreme(points, Ordering::Greater),
        PipelineFunction::AvgBucket => {
            let present: Vec<f64> = points.iter().filter_map(|(_, v)| v.map(|v| v.as_f64())).collect();
            let avg = (!present.is_empty()).then(|| present.iter().sum::<f64>() / present.len() as f64);
            MetricValue::single(avg.map(NumericValue::Float))
        }
        PipelineFunction::SumBucket => {
            let sum = points
                .iter()
                .filter_map(|(_, v)| *v)
                .fold(NumericValue::Int(0), NumericValue::add);
            MetricValue::single(Some(sum))
        }
        _ => MetricValue::single(None),
    };
    Some(value)
}

/// Key and value of every bucket of the sibling the path starts at
fn sibling_points(
    nodes: &[AggregationNode],
    values: &[AggValue],
    pipeline: &PipelineAggregation,
) -> Option<Vec<(String, Option<NumericValue>)>> {
    let (_, reference) = pipeline.paths.first()?;
    let (index, node) = find_child(nodes, reference.first_segment()?)?;
    let AggValue::MultiBucket { buckets, .. } = values.get(index)? else {
        return None;
    };
    let inner = reference.descend()?;
    buckets
        .iter()
        .map(|b| {
            if path_failed(&node.children, &b.children, &inner) {
                return None;
            }
            let value = lookup(&node.children, &b.children, b.doc_count, &inner);
            Some((b.display_key(), pipeline.gap_policy.fill(value)))
        })
        .collect()
}

/// min_bucket/max_bucket, every tied bucket is listed
fn extreme(points: Vec<(String, Option<NumericValue>)>, wanted: Ordering) -> MetricValue {
    let mut best: Option<NumericValue> = None;
    let mut keys = Vec::new();
    for (key, value) in points {
        let Some(value) = value else { continue };
        match best.map(|b| value.compare(&b)) {
            None => {
                best = Some(value);
                keys = vec![key];
            }
            Some(Ordering::Equal) => keys.push(key),
            Some(ordering) if ordering == wanted => {
                best = Some(value);
                keys = vec![key];
            }
            Some(_) => {}
        }
    }
    MetricValue::BucketKeys { value: best, keys }
}
