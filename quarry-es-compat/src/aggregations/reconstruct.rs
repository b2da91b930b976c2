//! Result reconstruction
//!
//! Rebuilds the nested aggregation tree from flat statement results. A
//! child statement repeats its ancestors' grouping keys in the leading
//! columns, so its rows are matched to parent buckets by that key prefix.
//! The result is a typed tree aligned with the compiled nodes; pipelines
//! run on it afterwards and [`crate::response`] renders it as JSON.

use crate::aggregations::node::*;
use crate::aggregations::pipeline::{self, PipelineFailure};
use crate::aggregations::planner::{BoundSide, ColumnRole, CompiledQuery, NodeAddress, QueryPlan};
use crate::error::ReconstructionError;
use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, Utc};
use quarry::executor::{ColumnValue, ExecutionError, NumericValue, ResultRow, StatementOutcome};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// Upper bound on buckets created by gap filling
const MAX_FILLED_BUCKETS: i64 = 65_535;

/// Value of one aggregation
#[derive(Debug, Clone, PartialEq)]
pub enum AggValue {
    MultiBucket {
        buckets: Vec<Bucket>,
        keyed: bool,
        /// Extra top-level fields such as `sum_other_doc_count`
        extra: Vec<(String, Value)>,
    },
    SingleBucket(Bucket),
    Metric(MetricValue),
    /// A pipeline not evaluated yet
    Pending,
    /// The statement behind this aggregation failed
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    /// Rendered as `key` unless the aggregation is keyed
    pub key: Option<Value>,
    /// Object key of a keyed bucket
    pub label: Option<String>,
    /// Fields rendered between `key` and `doc_count`
    pub head: Vec<(String, Value)>,
    pub doc_count: u64,
    /// Aligned with the node's children
    pub children: Vec<AggValue>,
}

impl Bucket {
    pub fn new(doc_count: u64, children: Vec<AggValue>) -> Self {
        Self {
            key: None,
            label: None,
            head: Vec::new(),
            doc_count,
            children,
        }
    }

    /// Key as listed by `min_bucket`/`max_bucket`
    pub fn display_key(&self) -> String {
        if let Some((_, Value::String(s))) = self.head.iter().find(|(k, _)| k == "key_as_string") {
            return s.clone();
        }
        if let Some(label) = &self.label {
            return label.clone();
        }
        match &self.key {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Single {
        value: Option<NumericValue>,
        as_string: Option<String>,
    },
    Stats {
        count: u64,
        min: Option<NumericValue>,
        max: Option<NumericValue>,
        avg: Option<NumericValue>,
        sum: Option<NumericValue>,
    },
    Percentiles {
        values: Vec<(String, Option<f64>)>,
        keyed: bool,
    },
    /// Result of `min_bucket`/`max_bucket`
    BucketKeys {
        value: Option<NumericValue>,
        keys: Vec<String>,
    },
    /// top_hits and top_metrics output, already in response shape
    Document(Value),
}

impl MetricValue {
    pub fn single(value: Option<NumericValue>) -> Self {
        MetricValue::Single {
            value,
            as_string: None,
        }
    }
}

/// A statement failure to report against an aggregation
#[derive(Debug, Clone, PartialEq)]
pub struct FailedStatement {
    pub aggregation: String,
    pub error: ExecutionError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconstructed {
    pub values: Vec<AggValue>,
    pub failures: Vec<FailedStatement>,
    /// Pipelines that read a failed aggregation
    pub pipeline_failures: Vec<PipelineFailure>,
}

/// Top-level aggregations that are built together, and the statements they read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopLevelGroup {
    pub nodes: Vec<usize>,
    pub statements: Vec<usize>,
}

/// The response's top level, filled in group by group as statements complete
///
/// Aggregate metrics at the top level share the root statement and form one
/// group. Every other aggregation is a group of its own that reads only the
/// statements beneath it. Top-level pipelines run as soon as what they read
/// is built.
pub struct TopLevel<'t> {
    tree: &'t AggregationTree,
    root: Bucket,
    failures: Vec<FailedStatement>,
}

impl<'t> TopLevel<'t> {
    pub fn new(tree: &'t AggregationTree) -> Self {
        Self {
            tree,
            root: Bucket::new(0, vec![AggValue::Pending; tree.aggregations.len()]),
            failures: Vec::new(),
        }
    }

    /// The group `index` belongs to, `None` once built or for pipelines
    pub fn group(&self, plan: &QueryPlan, index: usize) -> Option<TopLevelGroup> {
        let node = self.tree.aggregations.get(index)?;
        if node.is_pipeline() || !matches!(self.root.children.get(index)?, AggValue::Pending) {
            return None;
        }
        let root_metric = |n: &AggregationNode| n.metric().is_some_and(MetricAggregation::is_aggregate);
        let nodes: Vec<usize> = if root_metric(node) {
            self.tree
                .aggregations
                .iter()
                .enumerate()
                .filter(|(_, n)| root_metric(n))
                .map(|(i, _)| i)
                .collect()
        } else {
            vec![index]
        };
        let statements = plan
            .statements
            .iter()
            .enumerate()
            .filter(|(_, statement)| match statement.owner.0.first() {
                None => root_metric(node),
                Some(step) => nodes.contains(&step.child),
            })
            .map(|(i, _)| i)
            .collect();
        Some(TopLevelGroup { nodes, statements })
    }

    /// Store the group's values, built from outcomes holding its statements
    pub fn fill(&mut self, reconstructor: &Reconstructor<'_>, group: &TopLevelGroup) {
        for (index, value) in reconstructor.build_top_level(self.tree, &group.nodes) {
            self.root.children[index] = value;
        }
        self.failures.extend(reconstructor.failures.iter().cloned());
    }

    pub fn evaluate_pipeline(&mut self, index: usize) {
        pipeline::evaluate_level(&self.tree.aggregations, &[index], std::slice::from_mut(&mut self.root));
    }

    pub fn finish(self) -> Reconstructed {
        let mut pipeline_failures = Vec::new();
        pipeline::collect_failures(&self.tree.aggregations, &self.root.children, "", &mut pipeline_failures);
        Reconstructed {
            values: self.root.children,
            failures: self.failures,
            pipeline_failures,
        }
    }
}

enum StatementRows<'a> {
    Rows {
        rows: &'a [ResultRow],
        by_prefix: HashMap<Vec<String>, Vec<usize>>,
    },
    Failed,
    Skipped,
}

/// Where the aggregate metrics of a level are read from
#[derive(Clone, Copy)]
struct MetricSource<'a> {
    statement: Option<&'a CompiledQuery>,
    row: Option<&'a ResultRow>,
    failed: bool,
    branch: Option<usize>,
    doc_count: Option<u64>,
}

impl MetricSource<'_> {
    fn none() -> Self {
        Self {
            statement: None,
            row: None,
            failed: false,
            branch: None,
            doc_count: None,
        }
    }
}

pub struct Reconstructor<'a> {
    plan: &'a QueryPlan,
    results: Vec<StatementRows<'a>>,
    owners: HashMap<&'a NodeAddress, usize>,
    failures: Vec<FailedStatement>,
    now: DateTime<Utc>,
}

impl<'a> Reconstructor<'a> {
    pub fn new(
        plan: &'a QueryPlan,
        outcomes: &'a [StatementOutcome],
        now: DateTime<Utc>,
    ) -> Result<Self, ReconstructionError> {
        if plan.statements.len() != outcomes.len() {
            return Err(ReconstructionError::ResultCountMismatch {
                planned: plan.statements.len(),
                executed: outcomes.len(),
            });
        }

        let mut results = Vec::with_capacity(outcomes.len());
        let mut owners = HashMap::new();
        let mut failures = Vec::new();
        for (index, (statement, outcome)) in plan.statements.iter().zip(outcomes).enumerate() {
            owners.insert(&statement.owner, index);
            let rows = match outcome {
                StatementOutcome::Rows(rows) => {
                    let expected = statement.columns.len();
                    if let Some(short) = rows.iter().find(|r| r.len() < expected) {
                        return Err(ReconstructionError::ColumnCountMismatch {
                            statement: index,
                            expected,
                            actual: short.len(),
                        });
                    }
                    let mut by_prefix: HashMap<Vec<String>, Vec<usize>> = HashMap::new();
                    for (i, row) in rows.iter().enumerate() {
                        by_prefix.entry(prefix_of(row, statement.prefix_len)).or_default().push(i);
                    }
                    StatementRows::Rows {
                        rows: rows.as_slice(),
                        by_prefix,
                    }
                }
                StatementOutcome::Failed(error) => {
                    failures.push(FailedStatement {
                        aggregation: statement.aggregation.clone(),
                        error: error.clone(),
                    });
                    StatementRows::Failed
                }
                StatementOutcome::Skipped => StatementRows::Skipped,
            };
            results.push(rows);
        }

        Ok(Self {
            plan,
            results,
            owners,
            failures,
            now,
        })
    }

    /// Build the top-level aggregations at `indices` and everything below them
    fn build_top_level(&self, tree: &AggregationTree, indices: &[usize]) -> Vec<(usize, AggValue)> {
        let root = NodeAddress::root();
        let source = match self.statement(&root) {
            Some((statement, rows)) => self.source_from(statement, rows, &[], None),
            None => MetricSource::none(),
        };
        indices
            .iter()
            .filter_map(|&i| {
                let node = tree.aggregations.get(i)?;
                Some((i, self.build_node(node, i, &root, &[], &source)))
            })
            .collect()
    }

    fn statement(&self, owner: &NodeAddress) -> Option<(&'a CompiledQuery, &StatementRows<'a>)> {
        let index = *self.owners.get(owner)?;
        let plan: &'a QueryPlan = self.plan;
        Some((&plan.statements[index], &self.results[index]))
    }

    /// Rows of a statement under one parent bucket, in store order
    fn rows_for(&self, rows: &StatementRows<'a>, prefix: &[String]) -> Vec<&'a ResultRow> {
        match rows {
            StatementRows::Rows { rows, by_prefix } => {
                let rows: &'a [ResultRow] = rows;
                by_prefix
                    .get(prefix)
                    .map(|indices| indices.iter().map(|&i| &rows[i]).collect())
                    .unwrap_or_default()
            }
            _ => Vec::new(),
        }
    }

    fn source_from(
        &self,
        statement: &'a CompiledQuery,
        rows: &StatementRows<'a>,
        prefix: &[String],
        branch: Option<usize>,
    ) -> MetricSource<'a> {
        MetricSource {
            statement: Some(statement),
            row: self.rows_for(rows, prefix).into_iter().next(),
            failed: matches!(rows, StatementRows::Failed | StatementRows::Skipped),
            branch,
            doc_count: None,
        }
    }

    fn build_level(
        &self,
        nodes: &[AggregationNode],
        address: &NodeAddress,
        prefix: &[String],
        source: MetricSource<'a>,
    ) -> Vec<AggValue> {
        nodes
            .iter()
            .enumerate()
            .map(|(i, node)| self.build_node(node, i, address, prefix, &source))
            .collect()
    }

    fn build_node(
        &self,
        node: &AggregationNode,
        index: usize,
        address: &NodeAddress,
        prefix: &[String],
        source: &MetricSource<'a>,
    ) -> AggValue {
        match &node.kind {
            AggregationKind::Metric(metric) if metric.is_aggregate() => read_metric(metric, index, source),
            AggregationKind::Metric(metric) => {
                self.build_row_metric(metric, &address.child(index, None), prefix, source.doc_count)
            }
            AggregationKind::Pipeline(_) => AggValue::Pending,
            AggregationKind::Bucket(bucket) => self.build_bucket(node, bucket, address, index, prefix),
        }
    }

    fn build_bucket(
        &self,
        node: &AggregationNode,
        bucket: &BucketAggregation,
        parent: &NodeAddress,
        index: usize,
        prefix: &[String],
    ) -> AggValue {
        let mut value = match bucket {
            BucketAggregation::Terms(params) => self.build_terms(node, params, parent.child(index, None), prefix),
            BucketAggregation::Histogram(params) => {
                self.build_histogram(node, params, parent.child(index, None), prefix)
            }
            BucketAggregation::DateHistogram(params) => {
                self.build_date_histogram(node, params, parent.child(index, None), prefix)
            }
            BucketAggregation::Filter => self.build_filter(node, parent.child(index, None), prefix),
            BucketAggregation::Range { branches, keyed, .. }
            | BucketAggregation::DateRange { branches, keyed, .. }
            | BucketAggregation::Filters { branches, keyed } => {
                self.build_conditional(node, branches, *keyed, parent, index, prefix)
            }
        };

        match &mut value {
            AggValue::MultiBucket { buckets, .. } => {
                pipeline::evaluate_level(&node.children, &node.evaluation_order, buckets)
            }
            AggValue::SingleBucket(bucket) => pipeline::evaluate_level(
                &node.children,
                &node.evaluation_order,
                std::slice::from_mut(bucket),
            ),
            _ => {}
        }
        value
    }

    /// One bucket of a grouping aggregation, `row` is `None` for gap-filled buckets
    fn grouped_bucket(
        &self,
        node: &AggregationNode,
        address: &NodeAddress,
        statement: &'a CompiledQuery,
        row: Option<&'a ResultRow>,
        prefix: &[String],
        key_string: String,
    ) -> Bucket {
        let doc_count = row
            .map(|r| count_at(statement, r, &ColumnRole::Count { branch: None }))
            .unwrap_or(0);
        let mut child_prefix = prefix.to_vec();
        child_prefix.push(key_string);
        let source = MetricSource {
            statement: Some(statement),
            row,
            failed: false,
            branch: None,
            doc_count: Some(doc_count),
        };
        let children = self.build_level(&node.children, address, &child_prefix, source);
        Bucket::new(doc_count, children)
    }

    fn grouped_rows(&self, address: &NodeAddress, prefix: &[String]) -> Option<(&'a CompiledQuery, Vec<&'a ResultRow>)> {
        let (statement, rows) = self.statement(address)?;
        match rows {
            StatementRows::Rows { .. } => Some((statement, self.rows_for(rows, prefix))),
            _ => None,
        }
    }

    fn build_terms(&self, node: &AggregationNode, params: &TermsParams, address: NodeAddress, prefix: &[String]) -> AggValue {
        let Some((statement, rows)) = self.grouped_rows(&address, prefix) else {
            return AggValue::Failed;
        };
        let key_index = statement.prefix_len;
        let mut buckets = Vec::with_capacity(rows.len());
        let mut missing = 0;
        for &row in &rows {
            let key = row.value(key_index).cloned().unwrap_or(ColumnValue::Null);
            // documents without the field never form a bucket
            if key.is_null() {
                missing += count_at(statement, row, &ColumnRole::Count { branch: None });
                continue;
            }
            let mut bucket = self.grouped_bucket(node, &address, statement, Some(row), prefix, key.key_string());
            if params.field.is_boolean() {
                let truthy = key.as_i64().is_some_and(|v| v != 0);
                bucket.key = Some(key.to_json());
                bucket.head.push(("key_as_string".into(), json!(truthy.to_string())));
            } else if params.field.is_date() {
                bucket.key = Some(key.to_json());
                if let Some(text) = key.as_i64().and_then(format_millis) {
                    bucket.head.push(("key_as_string".into(), json!(text)));
                }
            } else {
                bucket.key = Some(key.to_json());
            }
            buckets.push(bucket);
        }

        let emitted: u64 = buckets.iter().map(|b| b.doc_count).sum();
        let total = rows
            .first()
            .map(|row| count_at(statement, row, &ColumnRole::ParentCount))
            .unwrap_or(0);
        AggValue::MultiBucket {
            buckets,
            keyed: false,
            extra: vec![
                ("doc_count_error_upper_bound".into(), json!(0)),
                ("sum_other_doc_count".into(), json!(total.saturating_sub(missing + emitted))),
            ],
        }
    }

    fn build_histogram(
        &self,
        node: &AggregationNode,
        params: &HistogramParams,
        address: NodeAddress,
        prefix: &[String],
    ) -> AggValue {
        let Some((statement, rows)) = self.grouped_rows(&address, prefix) else {
            return AggValue::Failed;
        };
        let key_index = statement.prefix_len;
        let keyed_rows: Vec<(f64, &ResultRow)> = rows
            .iter()
            .filter_map(|row| row.value(key_index).and_then(ColumnValue::as_f64).map(|k| (k, *row)))
            .collect();

        let slots: Vec<(f64, Option<&ResultRow>)> = if params.min_doc_count == 0 {
            fill_histogram(&keyed_rows, params.interval, params.extended_bounds.as_ref())
        } else {
            keyed_rows
                .into_iter()
                .filter(|(_, row)| count_at(statement, row, &ColumnRole::Count { branch: None }) >= params.min_doc_count)
                .map(|(k, row)| (k, Some(row)))
                .collect()
        };

        let buckets = slots
            .into_iter()
            .map(|(key, row)| {
                let key_string = match row.and_then(|r| r.value(key_index)) {
                    Some(value) => value.key_string(),
                    None => key.to_string(),
                };
                let mut bucket = self.grouped_bucket(node, &address, statement, row, prefix, key_string);
                bucket.key = Some(json!(key));
                bucket
            })
            .collect();
        AggValue::MultiBucket {
            buckets,
            keyed: false,
            extra: Vec::new(),
        }
    }

    fn build_date_histogram(
        &self,
        node: &AggregationNode,
        params: &DateHistogramParams,
        address: NodeAddress,
        prefix: &[String],
    ) -> AggValue {
        let Some((statement, rows)) = self.grouped_rows(&address, prefix) else {
            return AggValue::Failed;
        };
        let key_index = statement.prefix_len;
        let keyed_rows: Vec<(i64, &ResultRow)> = rows
            .iter()
            .filter_map(|row| {
                row.value(key_index)
                    .and_then(ColumnValue::as_i64)
                    .map(|raw| (params.key_millis(raw), *row))
            })
            .collect();

        let slots: Vec<(i64, Option<&ResultRow>)> = if params.min_doc_count == 0 {
            fill_date_histogram(&keyed_rows, params.interval, params.extended_bounds.as_ref())
        } else {
            keyed_rows
                .into_iter()
                .filter(|(_, row)| count_at(statement, row, &ColumnRole::Count { branch: None }) >= params.min_doc_count)
                .map(|(k, row)| (k, Some(row)))
                .collect()
        };

        let buckets = slots
            .into_iter()
            .map(|(millis, row)| {
                let key_string = match row.and_then(|r| r.value(key_index)) {
                    Some(value) => value.key_string(),
                    None => millis.to_string(),
                };
                let mut bucket = self.grouped_bucket(node, &address, statement, row, prefix, key_string);
                bucket.key = Some(json!(millis));
                if let Some(text) = format_millis(millis) {
                    bucket.head.push(("key_as_string".into(), json!(text)));
                }
                bucket
            })
            .collect();
        AggValue::MultiBucket {
            buckets,
            keyed: false,
            extra: Vec::new(),
        }
    }

    fn build_filter(&self, node: &AggregationNode, address: NodeAddress, prefix: &[String]) -> AggValue {
        let Some((statement, rows)) = self.grouped_rows(&address, prefix) else {
            return AggValue::Failed;
        };
        let row = rows.first().copied();
        let doc_count = row
            .map(|r| count_at(statement, r, &ColumnRole::Count { branch: None }))
            .unwrap_or(0);
        let source = MetricSource {
            statement: Some(statement),
            row,
            failed: false,
            branch: None,
            doc_count: Some(doc_count),
        };
        let children = self.build_level(&node.children, &address, prefix, source);
        AggValue::SingleBucket(Bucket::new(doc_count, children))
    }

    fn build_conditional(
        &self,
        node: &AggregationNode,
        branches: &[ConditionalBranch],
        keyed: bool,
        parent: &NodeAddress,
        index: usize,
        prefix: &[String],
    ) -> AggValue {
        let merged = parent.child(index, None);
        let mut buckets = Vec::with_capacity(branches.len());

        for (b, branch) in branches.iter().enumerate() {
            let (address, statement, row, branch_index) = match self.grouped_rows(&merged, prefix) {
                Some((statement, rows)) if statement.merged => (merged.clone(), statement, rows.first().copied(), Some(b)),
                _ => {
                    let split = parent.child(index, Some(b));
                    let Some((statement, rows)) = self.grouped_rows(&split, prefix) else {
                        return AggValue::Failed;
                    };
                    (split, statement, rows.first().copied(), None)
                }
            };

            let doc_count = row
                .map(|r| count_at(statement, r, &ColumnRole::Count { branch: branch_index }))
                .unwrap_or(0);
            let source = MetricSource {
                statement: Some(statement),
                row,
                failed: false,
                branch: branch_index,
                doc_count: Some(doc_count),
            };
            let children = self.build_level(&node.children, &address, prefix, source);
            let mut bucket = Bucket::new(doc_count, children);
            self.label_bucket(&mut bucket, &branch.label, statement, row, b, keyed);
            buckets.push(bucket);
        }

        AggValue::MultiBucket {
            buckets,
            keyed,
            extra: Vec::new(),
        }
    }

    fn label_bucket(
        &self,
        bucket: &mut Bucket,
        label: &BranchLabel,
        statement: &CompiledQuery,
        row: Option<&ResultRow>,
        branch: usize,
        keyed: bool,
    ) {
        match label {
            BranchLabel::Range { key, from, to } => {
                if keyed {
                    bucket.label = Some(key.clone());
                } else {
                    bucket.key = Some(json!(key));
                }
                if let Some(from) = from {
                    bucket.head.push(("from".into(), json!(from)));
                }
                if let Some(to) = to {
                    bucket.head.push(("to".into(), json!(to)));
                }
            }
            BranchLabel::DateRange { key, from, to } => {
                let resolve = |bound: &Option<DateBound>, side: BoundSide| -> Option<i64> {
                    let bound = bound.as_ref()?;
                    let reported = row.and_then(|r| {
                        let index = statement.column_index(&ColumnRole::Bound { branch, side })?;
                        r.value(index)?.as_i64()
                    });
                    reported.or_else(|| bound.local_millis(self.now))
                };
                let from_ms = resolve(from, BoundSide::From);
                let to_ms = resolve(to, BoundSide::To);
                let from_text = from_ms.and_then(format_millis);
                let to_text = to_ms.and_then(format_millis);
                let key = key.clone().unwrap_or_else(|| {
                    format!(
                        "{}-{}",
                        from_text.as_deref().unwrap_or("*"),
                        to_text.as_deref().unwrap_or("*")
                    )
                });
                if keyed {
                    bucket.label = Some(key);
                } else {
                    bucket.key = Some(json!(key));
                }
                if let Some(ms) = from_ms {
                    bucket.head.push(("from".into(), json!(ms as f64)));
                    bucket.head.push(("from_as_string".into(), json!(from_text)));
                }
                if let Some(ms) = to_ms {
                    bucket.head.push(("to".into(), json!(ms as f64)));
                    bucket.head.push(("to_as_string".into(), json!(to_text)));
                }
            }
            BranchLabel::Filter { name } => bucket.label = name.clone(),
        }
    }

    fn build_row_metric(
        &self,
        metric: &MetricAggregation,
        address: &NodeAddress,
        prefix: &[String],
        doc_count: Option<u64>,
    ) -> AggValue {
        let Some((statement, rows)) = self.grouped_rows(address, prefix) else {
            return AggValue::Failed;
        };
        let document = match metric {
            MetricAggregation::TopHits { fields, .. } => {
                let hits: Vec<Value> = rows
                    .iter()
                    .map(|row| {
                        json!({
                            "_index": statement.table_name,
                            "_score": null,
                            "_source": source_document(statement, row, fields),
                        })
                    })
                    .collect();
                json!({
                    "hits": {
                        "total": {"value": doc_count.unwrap_or(hits.len() as u64), "relation": "eq"},
                        "max_score": null,
                        "hits": hits,
                    }
                })
            }
            MetricAggregation::TopMetrics { metrics, .. } => {
                let top: Vec<Value> = rows
                    .iter()
                    .map(|row| {
                        let value_at = |index: usize| {
                            statement
                                .column_index(&ColumnRole::Field { index })
                                .and_then(|i| row.value(i))
                                .map(ColumnValue::to_json)
                                .unwrap_or(Value::Null)
                        };
                        let values: Map<String, Value> = metrics
                            .iter()
                            .enumerate()
                            .map(|(i, field)| (field.name.clone(), value_at(i)))
                            .collect();
                        json!({"sort": [value_at(metrics.len())], "metrics": values})
                    })
                    .collect();
                json!({ "top": top })
            }
            _ => Value::Null,
        };
        AggValue::Metric(MetricValue::Document(document))
    }
}

fn prefix_of(row: &ResultRow, len: usize) -> Vec<String> {
    (0..len)
        .map(|i| row.value(i).map(ColumnValue::key_string).unwrap_or_default())
        .collect()
}

fn count_at(statement: &CompiledQuery, row: &ResultRow, role: &ColumnRole) -> u64 {
    statement
        .column_index(role)
        .and_then(|i| row.value(i))
        .and_then(ColumnValue::as_i64)
        .map(|n| n.max(0) as u64)
        .unwrap_or(0)
}

fn source_document(statement: &CompiledQuery, row: &ResultRow, fields: &[FieldRef]) -> Value {
    let mut source = Map::new();
    for (i, column) in statement.columns.iter().enumerate() {
        match column.role {
            ColumnRole::Field { index } => {
                if let (Some(field), Some(value)) = (fields.get(index), row.value(i)) {
                    source.insert(field.name.clone(), value.to_json());
                }
            }
            ColumnRole::Wildcard => {
                for column in row.columns.iter().skip(i) {
                    source.insert(column.name.clone(), column.value.to_json());
                }
            }
            _ => {}
        }
    }
    Value::Object(source)
}

/// Read an aggregate metric from the level's row. No row means no documents.
fn read_metric(metric: &MetricAggregation, child: usize, source: &MetricSource<'_>) -> AggValue {
    if source.failed {
        return AggValue::Failed;
    }
    let part = |part: usize| metric_part(source, child, part);
    let numeric = |index: usize| part(index).and_then(ColumnValue::as_numeric);

    let value = match metric {
        MetricAggregation::Single { function, field } => {
            let value = numeric(0);
            match function {
                SingleValueMetric::ValueCount | SingleValueMetric::Cardinality => {
                    MetricValue::single(Some(value.unwrap_or(NumericValue::Int(0))))
                }
                SingleValueMetric::Sum => MetricValue::single(Some(value.unwrap_or(NumericValue::Int(0)))),
                SingleValueMetric::Min | SingleValueMetric::Max if field.is_date() => MetricValue::Single {
                    as_string: value.and_then(|v| format_millis(v.as_f64() as i64)),
                    value,
                },
                _ => MetricValue::single(value),
            }
        }
        MetricAggregation::Stats { .. } => {
            let labelled: HashMap<&str, NumericValue> = (0..STATS_VALUES.len())
                .filter_map(|part| metric_column(source, child, part))
                .filter_map(|(expr, value)| Some((stats_label(expr), value.as_numeric()?)))
                .collect();
            let stat = |label: &str| labelled.get(label).copied();
            let count = stat("count").map(|n| n.as_f64().max(0.0) as u64).unwrap_or(0);
            if count == 0 {
                MetricValue::Stats {
                    count,
                    min: None,
                    max: None,
                    avg: None,
                    sum: Some(NumericValue::Int(0)),
                }
            } else {
                MetricValue::Stats {
                    count,
                    min: stat("min"),
                    max: stat("max"),
                    avg: stat("avg"),
                    sum: stat("sum"),
                }
            }
        }
        MetricAggregation::Percentiles { percents, keyed, .. } => MetricValue::Percentiles {
            values: percents
                .iter()
                .enumerate()
                .map(|(i, p)| (p.key.clone(), part(i).and_then(ColumnValue::as_f64)))
                .collect(),
            keyed: *keyed,
        },
        _ => return AggValue::Failed,
    };
    AggValue::Metric(value)
}

fn metric_part<'s>(source: &MetricSource<'s>, child: usize, part: usize) -> Option<&'s ColumnValue> {
    metric_column(source, child, part).map(|(_, value)| value)
}

/// SELECT expression and value of one metric part
fn metric_column<'s>(source: &MetricSource<'s>, child: usize, part: usize) -> Option<(&'s str, &'s ColumnValue)> {
    let statement = source.statement?;
    let index = statement.column_index(&ColumnRole::Metric {
        child,
        part,
        branch: source.branch,
    })?;
    Some((statement.columns.get(index)?.expr.as_str(), source.row?.value(index)?))
}

/// `YYYY-MM-DDTHH:MM:SS.mmm` in UTC
pub fn format_millis(millis: i64) -> Option<String> {
    DateTime::from_timestamp_millis(millis).map(|t| t.format("%Y-%m-%dT%H:%M:%S%.3f").to_string())
}

fn fill_histogram<'r>(
    rows: &[(f64, &'r ResultRow)],
    interval: f64,
    bounds: Option<&crate::query::types::ExtendedBounds>,
) -> Vec<(f64, Option<&'r ResultRow>)> {
    let slot = |key: f64| (key / interval).round() as i64;
    let by_slot: HashMap<i64, (f64, &ResultRow)> = rows.iter().map(|(k, r)| (slot(*k), (*k, *r))).collect();

    let mut lo = rows.iter().map(|(k, _)| slot(*k)).min();
    let mut hi = rows.iter().map(|(k, _)| slot(*k)).max();
    if let Some(bounds) = bounds {
        let (min, max) = ((bounds.min / interval).floor() as i64, (bounds.max / interval).floor() as i64);
        lo = Some(lo.map_or(min, |lo| lo.min(min)));
        hi = Some(hi.map_or(max, |hi| hi.max(max)));
    }
    let (Some(lo), Some(hi)) = (lo, hi) else {
        return Vec::new();
    };
    if hi.saturating_sub(lo) > MAX_FILLED_BUCKETS {
        tracing::warn!(lo, hi, "Too many empty histogram buckets, not filling gaps");
        return rows.iter().map(|(k, r)| (*k, Some(*r))).collect();
    }
    (lo..=hi)
        .map(|n| match by_slot.get(&n) {
            Some((key, row)) => (*key, Some(*row)),
            None => (n as f64 * interval, None),
        })
        .collect()
}

fn fill_date_histogram<'r>(
    rows: &[(i64, &'r ResultRow)],
    interval: DateInterval,
    bounds: Option<&crate::query::types::DateExtendedBounds>,
) -> Vec<(i64, Option<&'r ResultRow>)> {
    let by_key: HashMap<i64, &ResultRow> = rows.iter().map(|(k, r)| (*k, *r)).collect();
    let floor = |ms: i64| match interval {
        DateInterval::Fixed { millis } => Some(ms.div_euclid(millis) * millis),
        DateInterval::Calendar(unit) => calendar_floor(ms, unit),
    };

    let mut lo = rows.iter().map(|(k, _)| *k).min();
    let mut hi = rows.iter().map(|(k, _)| *k).max();
    if let Some(bounds) = bounds {
        if let (Some(min), Some(max)) = (floor(bounds.min), floor(bounds.max)) {
            lo = Some(lo.map_or(min, |lo| lo.min(min)));
            hi = Some(hi.map_or(max, |hi| hi.max(max)));
        }
    }
    let (Some(lo), Some(hi)) = (lo, hi) else {
        return Vec::new();
    };

    let mut slots = Vec::new();
    let mut current = lo;
    while current <= hi {
        if slots.len() as i64 > MAX_FILLED_BUCKETS {
            tracing::warn!(lo, hi, "Too many empty date_histogram buckets, not filling gaps");
            return rows.iter().map(|(k, r)| (*k, Some(*r))).collect();
        }
        slots.push((current, by_key.get(&current).copied()));
        let next = match interval {
            DateInterval::Fixed { millis } => current.checked_add(millis),
            DateInterval::Calendar(unit) => calendar_next(current, unit),
        };
        match next {
            Some(next) if next > current => current = next,
            _ => break,
        }
    }
    slots
}

fn calendar_floor(millis: i64, unit: CalendarUnit) -> Option<i64> {
    let date = DateTime::from_timestamp_millis(millis)?.date_naive();
    let start = match unit {
        CalendarUnit::Week => date - Duration::days(i64::from(date.weekday().num_days_from_monday())),
        CalendarUnit::Month => NaiveDate::from_ymd_opt(date.year(), date.month(), 1)?,
        CalendarUnit::Quarter => NaiveDate::from_ymd_opt(date.year(), (date.month0() / 3) * 3 + 1, 1)?,
        CalendarUnit::Year => NaiveDate::from_ymd_opt(date.year(), 1, 1)?,
    };
    Some(start.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis())
}

fn calendar_next(millis: i64, unit: CalendarUnit) -> Option<i64> {
    let instant = DateTime::from_timestamp_millis(millis)?;
    let next = match unit.months() {
        Some(months) => instant.checked_add_months(Months::new(months))?,
        None => instant.checked_add_signed(Duration::days(7))?,
    };
    Some(next.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregations::compiler::AggregationCompiler;
    use crate::aggregations::planner::QueryPlanner;
    use crate::query::types::{DateExtendedBounds, ExtendedBounds};
    use quarry::schema::{FieldInfo, FieldType, SchemaRegistry, TableSchema};
    use serde_json::json;

    fn row(values: Value) -> ResultRow {
        ResultRow::from_json(values).unwrap()
    }

    #[test]
    fn test_format_millis() {
        assert_eq!(format_millis(0).as_deref(), Some("1970-01-01T00:00:00.000"));
        assert_eq!(format_millis(1_704_067_200_123).as_deref(), Some("2024-01-01T00:00:00.123"));
    }

    #[test]
    fn test_fill_histogram_gaps_and_bounds() {
        let a = row(json!([0, 2]));
        let b = row(json!([30, 1]));
        let filled = fill_histogram(&[(0.0, &a), (30.0, &b)], 10.0, None);
        let keys: Vec<_> = filled.iter().map(|(k, r)| (*k, r.is_some())).collect();
        assert_eq!(keys, vec![(0.0, true), (10.0, false), (20.0, false), (30.0, true)]);

        let bounds = ExtendedBounds { min: -10.0, max: 45.0 };
        let filled = fill_histogram(&[(0.0, &a)], 10.0, Some(&bounds));
        let keys: Vec<_> = filled.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![-10.0, 0.0, 10.0, 20.0, 30.0, 40.0]);

        assert!(fill_histogram(&[], 10.0, None).is_empty());
    }

    #[test]
    fn test_fill_calendar_months() {
        let jan = row(json!([1]));
        let apr = row(json!([1]));
        let jan_ms = 1_704_067_200_000; // 2024-01-01
        let apr_ms = 1_711_929_600_000; // 2024-04-01
        let filled = fill_date_histogram(
            &[(jan_ms, &jan), (apr_ms, &apr)],
            DateInterval::Calendar(CalendarUnit::Month),
            None,
        );
        let keys: Vec<_> = filled.iter().map(|(k, _)| format_millis(*k).unwrap()).collect();
        assert_eq!(
            keys,
            vec![
                "2024-01-01T00:00:00.000",
                "2024-02-01T00:00:00.000",
                "2024-03-01T00:00:00.000",
                "2024-04-01T00:00:00.000",
            ]
        );
    }

    #[test]
    fn test_fill_fixed_with_bounds() {
        let filled = fill_date_histogram(
            &[],
            DateInterval::Fixed { millis: 1000 },
            Some(&DateExtendedBounds { min: 1500, max: 3000 }),
        );
        let keys: Vec<_> = filled.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![1000, 2000, 3000]);
    }

    #[test]
    fn test_calendar_floor() {
        // 2024-05-16 is a Thursday
        let ms = 1_715_860_800_000;
        assert_eq!(format_millis(calendar_floor(ms, CalendarUnit::Week).unwrap()).unwrap(), "2024-05-13T00:00:00.000");
        assert_eq!(format_millis(calendar_floor(ms, CalendarUnit::Quarter).unwrap()).unwrap(), "2024-04-01T00:00:00.000");
        assert_eq!(format_millis(calendar_floor(ms, CalendarUnit::Year).unwrap()).unwrap(), "2024-01-01T00:00:00.000");
    }

    #[test]
    fn test_display_key() {
        let mut bucket = Bucket::new(1, Vec::new());
        bucket.key = Some(json!(5));
        assert_eq!(bucket.display_key(), "5");
        bucket.head.push(("key_as_string".into(), json!("2024-01-01T00:00:00.000")));
        assert_eq!(bucket.display_key(), "2024-01-01T00:00:00.000");
    }

    fn tree(aggs: Value) -> AggregationTree {
        let registry = SchemaRegistry::new();
        registry.register(
            TableSchema::new("t")
                .with_field(FieldInfo::new("host", FieldType::Keyword))
                .with_field(FieldInfo::new("x", FieldType::Long)),
        );
        let compiled = AggregationCompiler::new(&registry, "t").compile(aggs.as_object().unwrap());
        assert!(compiled.warnings.is_empty(), "{:?}", compiled.warnings);
        compiled.tree
    }

    #[test]
    fn test_top_level_groups() {
        let tree = tree(json!({
            "total": {"sum": {"field": "x"}},
            "hosts": {"terms": {"field": "host"}},
            "peak": {"max": {"field": "x"}},
            "best": {"max_bucket": {"buckets_path": "hosts>_count"}}
        }));
        let plan = QueryPlanner::new("t", None).plan(&tree);
        assert_eq!(plan.statements.len(), 2);

        let mut top = TopLevel::new(&tree);
        let metrics = top.group(&plan, 0).unwrap();
        assert_eq!(metrics, TopLevelGroup { nodes: vec![0, 2], statements: vec![0] });
        let hosts = top.group(&plan, 1).unwrap();
        assert_eq!(hosts, TopLevelGroup { nodes: vec![1], statements: vec![1] });
        assert_eq!(top.group(&plan, 3), None);

        // only the metrics statement has completed
        let scoped = vec![StatementOutcome::Rows(vec![row(json!([10, 7]))]), StatementOutcome::Skipped];
        top.fill(&Reconstructor::new(&plan, &scoped, Utc::now()).unwrap(), &metrics);
        assert_eq!(top.group(&plan, 2), None);
        assert!(top.group(&plan, 1).is_some());

        let scoped = vec![
            StatementOutcome::Skipped,
            StatementOutcome::Rows(vec![row(json!(["a", 3, 8])), row(json!(["b", 5, 8]))]),
        ];
        top.fill(&Reconstructor::new(&plan, &scoped, Utc::now()).unwrap(), &hosts);
        top.evaluate_pipeline(3);

        let done = top.finish();
        assert!(done.failures.is_empty());
        assert!(done.pipeline_failures.is_empty());
        assert!(matches!(&done.values[0], AggValue::Metric(MetricValue::Single { value: Some(_), .. })));
        assert!(matches!(&done.values[1], AggValue::MultiBucket { buckets, .. } if buckets.len() == 2));
        assert!(matches!(
            &done.values[3],
            AggValue::Metric(MetricValue::BucketKeys { keys, .. }) if keys == &["b".to_string()]
        ));
    }

    #[test]
    fn test_top_level_records_group_failures() {
        let tree = tree(json!({
            "hosts": {"terms": {"field": "host"}},
            "total": {"sum": {"field": "x"}}
        }));
        let plan = QueryPlanner::new("t", None).plan(&tree);
        let mut top = TopLevel::new(&tree);
        for index in 0..2 {
            let group = top.group(&plan, index).unwrap();
            let mut scoped = vec![StatementOutcome::Skipped; plan.statements.len()];
            for &statement in &group.statements {
                scoped[statement] = StatementOutcome::Failed(ExecutionError::Store("gone".into()));
            }
            top.fill(&Reconstructor::new(&plan, &scoped, Utc::now()).unwrap(), &group);
        }
        let done = top.finish();
        let mut failed: Vec<_> = done.failures.iter().map(|f| f.aggregation.as_str()).collect();
        failed.sort_unstable();
        assert_eq!(failed, vec!["hosts", "total"]);
        assert_eq!(done.values, vec![AggValue::Failed, AggValue::Failed]);
    }
}
