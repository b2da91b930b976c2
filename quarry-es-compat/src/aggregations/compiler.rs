//! Aggregation compiler
//!
//! Walks the request's `aggs` object level by level, in request order, and
//! builds [`AggregationNode`]s. Each level compiles in two passes: bucket and
//! metric aggregations first, then pipelines, whose `buckets_path` is
//! resolved against everything visible at that level.
//!
//! A failure drops only the offending subtree and is reported as a warning.

use crate::aggregations::buckets_path::{self, BucketsPathReference, ScopeEntry};
use crate::aggregations::node::*;
use crate::aggregations::script::Script;
use crate::error::CompileError;
use crate::query::date_math;
use crate::query::sql::{and_all, or_all, quote_literal, SortDirection};
use crate::query::translator::{LuceneParser, WhereTranslator};
use crate::query::types::*;
use quarry::schema::{FieldType, SchemaLookup};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashSet;

const DEFAULT_PERCENTS: [f64; 7] = [1.0, 5.0, 25.0, 50.0, 75.0, 95.0, 99.0];
const MAX_PERCENTILE_FRACTION: f64 = 0.999_999_999_9;
const DEFAULT_TOP_HITS_SIZE: usize = 3;
const DEFAULT_OTHER_BUCKET_KEY: &str = "_other_";

const METRIC_TYPES: &[&str] = &[
    "avg",
    "sum",
    "min",
    "max",
    "value_count",
    "cardinality",
    "stats",
    "percentiles",
    "top_hits",
    "top_metrics",
];

const BUCKET_TYPES: &[&str] = &[
    "terms",
    "histogram",
    "date_histogram",
    "range",
    "date_range",
    "filter",
    "filters",
];

const PIPELINE_TYPES: &[&str] = &[
    "cumulative_sum",
    "derivative",
    "min_bucket",
    "max_bucket",
    "avg_bucket",
    "sum_bucket",
    "bucket_script",
];

/// Elasticsearch aggregations this engine recognizes but does not run
const UNSUPPORTED_TYPES: &[&str] = &[
    "adjacency_matrix",
    "auto_date_histogram",
    "boxplot",
    "bucket_selector",
    "bucket_sort",
    "children",
    "composite",
    "diversified_sampler",
    "extended_stats",
    "extended_stats_bucket",
    "geo_bounds",
    "geo_centroid",
    "geo_line",
    "geohash_grid",
    "geotile_grid",
    "global",
    "ip_range",
    "matrix_stats",
    "median_absolute_deviation",
    "missing",
    "moving_avg",
    "moving_fn",
    "multi_terms",
    "nested",
    "parent",
    "percentile_ranks",
    "percentiles_bucket",
    "rare_terms",
    "rate",
    "reverse_nested",
    "sampler",
    "scripted_metric",
    "serial_diff",
    "significant_terms",
    "significant_text",
    "stats_bucket",
    "string_stats",
    "t_test",
    "variable_width_histogram",
    "weighted_avg",
];

/// Keys of an aggregation body that are not the aggregation type
const NON_TYPE_KEYS: &[&str] = &["aggs", "aggregations", "meta"];

/// An aggregation subtree that was dropped
#[derive(Debug, Clone, PartialEq)]
pub struct CompileWarning {
    /// `>` separated path of the dropped aggregation
    pub aggregation: String,
    pub error: CompileError,
}

#[derive(Debug, Clone, Default)]
pub struct CompiledAggregations {
    pub tree: AggregationTree,
    pub warnings: Vec<CompileWarning>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParentKind {
    Root,
    SingleBucket,
    MultiBucket,
}

/// One request entry between the two passes
enum Entry<'v> {
    Compiled(AggregationNode),
    Pipeline {
        name: String,
        path: String,
        agg_type: &'v str,
        params: &'v Value,
    },
    Resolved(AggregationNode),
    Dropped,
}

pub struct AggregationCompiler<'a> {
    schema: &'a dyn SchemaLookup,
    table: &'a str,
    lucene: Option<&'a dyn LuceneParser>,
    default_terms_size: usize,
    warnings: Vec<CompileWarning>,
}

impl<'a> AggregationCompiler<'a> {
    pub fn new(schema: &'a dyn SchemaLookup, table: &'a str) -> Self {
        Self {
            schema,
            table,
            lucene: None,
            default_terms_size: 10,
            warnings: Vec::new(),
        }
    }

    pub fn with_lucene(mut self, lucene: Option<&'a dyn LuceneParser>) -> Self {
        self.lucene = lucene;
        self
    }

    pub fn with_default_terms_size(mut self, size: usize) -> Self {
        self.default_terms_size = size;
        self
    }

    pub fn compile(mut self, aggs: &Map<String, Value>) -> CompiledAggregations {
        let (aggregations, evaluation_order) = self.compile_level(aggs, ParentKind::Root, "");
        CompiledAggregations {
            tree: AggregationTree {
                aggregations,
                evaluation_order,
            },
            warnings: self.warnings,
        }
    }

    fn drop_aggregation(&mut self, path: &str, error: CompileError) {
        tracing::warn!(aggregation = %path, error = %error, "Dropping aggregation");
        quarry::metrics::record_aggregation_dropped(error.reason());
        self.warnings.push(CompileWarning {
            aggregation: path.to_string(),
            error,
        });
    }

    fn compile_level(
        &mut self,
        aggs: &Map<String, Value>,
        parent: ParentKind,
        prefix: &str,
    ) -> (Vec<AggregationNode>, Vec<usize>) {
        let mut entries = Vec::with_capacity(aggs.len());

        for (name, body) in aggs {
            let path = qualified(prefix, name);
            let entry = match classify(name, body) {
                Err(e) => {
                    self.drop_aggregation(&path, e);
                    Entry::Dropped
                }
                Ok((agg_type, params, _)) if PIPELINE_TYPES.contains(&agg_type) => Entry::Pipeline {
                    name: name.clone(),
                    path,
                    agg_type,
                    params,
                },
                Ok((agg_type, params, sub_aggs)) => {
                    match self.compile_node(name, &path, agg_type, params, sub_aggs) {
                        Ok(node) => Entry::Compiled(node),
                        Err(e) => {
                            self.drop_aggregation(&path, e);
                            Entry::Dropped
                        }
                    }
                }
            };
            entries.push(entry);
        }

        self.resolve_pipelines(&mut entries, parent, prefix);

        let mut children = Vec::new();
        let mut pipelines = Vec::new();
        for entry in entries {
            match entry {
                Entry::Compiled(node) => children.push(node),
                Entry::Resolved(node) => {
                    pipelines.push(children.len());
                    children.push(node);
                }
                Entry::Pipeline { .. } | Entry::Dropped => {}
            }
        }
        let order = self.evaluation_order(&mut children, pipelines, prefix);
        (children, order)
    }

    /// Second pass: resolve every pipeline of a level against its siblings
    fn resolve_pipelines(&mut self, entries: &mut [Entry<'_>], parent: ParentKind, prefix: &str) {
        let scope: Vec<ScopeEntry> = entries
            .iter()
            .filter_map(|e| match e {
                Entry::Compiled(node) => Some(ScopeEntry::from_node(node)),
                Entry::Pipeline { name, .. } => Some(ScopeEntry::pending_pipeline(name)),
                _ => None,
            })
            .collect();

        for entry in entries.iter_mut() {
            let (name, path, agg_type, params) = match entry {
                Entry::Pipeline {
                    name,
                    path,
                    agg_type,
                    params,
                } => (name.clone(), path.clone(), *agg_type, *params),
                _ => continue,
            };
            *entry = match compile_pipeline(&name, agg_type, params, parent, &scope) {
                Ok(pipeline) => {
                    Entry::Resolved(AggregationNode::new(name, AggregationKind::Pipeline(pipeline)))
                }
                Err(e) => {
                    self.drop_aggregation(&path, e);
                    Entry::Dropped
                }
            };
        }

        // Pipelines reading a dropped pipeline go too
        loop {
            let alive: HashSet<String> = entries
                .iter()
                .filter_map(|e| match e {
                    Entry::Compiled(n) | Entry::Resolved(n) => Some(n.name.clone()),
                    _ => None,
                })
                .collect();
            let mut dropped_any = false;
            for entry in entries.iter_mut() {
                let missing = match entry {
                    Entry::Resolved(node) => node.pipeline().and_then(|p| {
                        p.sibling_dependencies()
                            .into_iter()
                            .find(|s| !alive.contains(*s))
                            .map(|s| (node.name.clone(), s.to_string()))
                    }),
                    _ => None,
                };
                if let Some((name, segment)) = missing {
                    let error = CompileError::UnresolvedBucketsPath {
                        path: segment.clone(),
                        segment,
                    };
                    self.drop_aggregation(&qualified(prefix, &name), error);
                    *entry = Entry::Dropped;
                    dropped_any = true;
                }
            }
            if !dropped_any {
                break;
            }
        }
    }

    /// Non-pipelines first, then pipelines after their dependencies.
    /// Pipelines on a cycle are dropped.
    fn evaluation_order(
        &mut self,
        children: &mut Vec<AggregationNode>,
        pipelines: Vec<usize>,
        prefix: &str,
    ) -> Vec<usize> {
        let pipeline_names: HashSet<&str> = pipelines
            .iter()
            .map(|&i| children[i].name.as_str())
            .collect();
        let deps: Vec<(usize, Vec<String>)> = pipelines
            .iter()
            .map(|&i| {
                let reads = children[i]
                    .pipeline()
                    .map(|p| p.sibling_dependencies())
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|d| pipeline_names.contains(d))
                    .map(str::to_string)
                    .collect();
                (i, reads)
            })
            .collect();

        let mut order: Vec<usize> = (0..children.len())
            .filter(|i| !pipelines.contains(i))
            .collect();
        let mut done: HashSet<String> = HashSet::new();
        let mut pending = deps;
        loop {
            let ready = pending
                .iter()
                .position(|(_, reads)| reads.iter().all(|r| done.contains(r)));
            match ready {
                Some(pos) => {
                    let (index, _) = pending.remove(pos);
                    done.insert(children[index].name.clone());
                    order.push(index);
                }
                None => break,
            }
        }
        if pending.is_empty() {
            return order;
        }

        let cycle = find_cycle(children, &pending);
        let mut removed: Vec<usize> = pending.iter().map(|(i, _)| *i).collect();
        removed.sort_unstable();
        for &index in &removed {
            let path = qualified(prefix, &children[index].name);
            self.drop_aggregation(&path, CompileError::PipelineCycle(cycle.clone()));
        }
        for &index in removed.iter().rev() {
            children.remove(index);
        }
        // Indices shift after removal
        order
            .into_iter()
            .map(|i| i - removed.iter().filter(|&&r| r < i).count())
            .collect()
    }

    fn compile_node(
        &mut self,
        name: &str,
        path: &str,
        agg_type: &str,
        params: &Value,
        sub_aggs: Option<&Map<String, Value>>,
    ) -> Result<AggregationNode, CompileError> {
        if METRIC_TYPES.contains(&agg_type) {
            if sub_aggs.is_some_and(|s| !s.is_empty()) {
                return Err(CompileError::malformed(
                    name,
                    format!("[{agg_type}] cannot accept sub-aggregations"),
                ));
            }
            let metric = self.compile_metric(name, agg_type, params)?;
            return Ok(AggregationNode::new(name, AggregationKind::Metric(metric)));
        }
        if !BUCKET_TYPES.contains(&agg_type) {
            let reason = if UNSUPPORTED_TYPES.contains(&agg_type) {
                "not supported by this engine"
            } else {
                "unknown aggregation type"
            };
            return Err(CompileError::UnsupportedAggregationType {
                agg_type: agg_type.to_string(),
                reason: reason.to_string(),
            });
        }

        let parent_kind = if agg_type == "filter" {
            ParentKind::SingleBucket
        } else {
            ParentKind::MultiBucket
        };
        let (children, order) = match sub_aggs {
            Some(sub) => self.compile_level(sub, parent_kind, path),
            None => (Vec::new(), Vec::new()),
        };

        let mut where_clause = None;
        let bucket = match agg_type {
            "terms" => {
                let agg: TermsAgg = params_of(name, params)?;
                let size = agg.size.unwrap_or(self.default_terms_size);
                if size == 0 {
                    return Err(CompileError::malformed(name, "[size] must be greater than 0"));
                }
                BucketAggregation::Terms(TermsParams {
                    field: self.field(&agg.field)?,
                    size,
                    order: terms_order(name, agg.order.as_ref(), &children)?,
                })
            }
            "histogram" => {
                let agg: HistogramAgg = params_of(name, params)?;
                if !agg.interval.is_finite() || agg.interval <= 0.0 {
                    return Err(CompileError::malformed(name, "[interval] must be > 0"));
                }
                BucketAggregation::Histogram(HistogramParams {
                    field: self.numeric_field(name, agg_type, &agg.field)?,
                    interval: agg.interval,
                    min_doc_count: agg.min_doc_count.unwrap_or(0),
                    extended_bounds: agg.extended_bounds,
                })
            }
            "date_histogram" => {
                let agg: DateHistogramAgg = params_of(name, params)?;
                if agg.time_zone.as_deref().is_some_and(|tz| !is_utc(tz)) {
                    tracing::debug!(aggregation = %name, "Ignoring time_zone, buckets are UTC");
                }
                BucketAggregation::DateHistogram(DateHistogramParams {
                    field: self.field(&agg.field)?,
                    interval: date_interval(name, &agg)?,
                    min_doc_count: agg.min_doc_count.unwrap_or(0),
                    extended_bounds: agg.extended_bounds,
                })
            }
            "range" => {
                let agg: RangeAgg = params_of(name, params)?;
                if agg.ranges.is_empty() {
                    return Err(CompileError::malformed(name, "[ranges] must not be empty"));
                }
                let field = self.numeric_field(name, agg_type, &agg.field)?;
                let branches = agg.ranges.iter().map(|r| range_branch(&field, r)).collect();
                BucketAggregation::Range {
                    field,
                    branches,
                    keyed: agg.keyed.unwrap_or(false),
                }
            }
            "date_range" => {
                let agg: DateRangeAgg = params_of(name, params)?;
                if agg.ranges.is_empty() {
                    return Err(CompileError::malformed(name, "[ranges] must not be empty"));
                }
                let field = self.field(&agg.field)?;
                let branches = agg
                    .ranges
                    .iter()
                    .map(|r| date_range_branch(&field, r))
                    .collect::<Result<_, _>>()?;
                BucketAggregation::DateRange {
                    field,
                    branches,
                    keyed: agg.keyed.unwrap_or(false),
                }
            }
            "filter" => {
                let query: EsQuery = params_of(name, params)?;
                where_clause = self.translator().translate(&query)?;
                BucketAggregation::Filter
            }
            "filters" => {
                let agg: FiltersAgg = params_of(name, params)?;
                self.filters(name, &agg)?
            }
            other => return Err(unsupported(other)),
        };

        Ok(AggregationNode::new(name, AggregationKind::Bucket(bucket))
            .with_children(children, order)
            .with_where(where_clause))
    }

    fn compile_metric(
        &self,
        name: &str,
        agg_type: &str,
        params: &Value,
    ) -> Result<MetricAggregation, CompileError> {
        let single = |function| -> Result<MetricAggregation, CompileError> {
            let agg: FieldAgg = params_of(name, params)?;
            let field = match function {
                SingleValueMetric::Avg | SingleValueMetric::Sum => {
                    self.numeric_field(name, agg_type, &agg.field)?
                }
                _ => self.field(&agg.field)?,
            };
            Ok(MetricAggregation::Single { function, field })
        };

        match agg_type {
            "avg" => single(SingleValueMetric::Avg),
            "sum" => single(SingleValueMetric::Sum),
            "min" => single(SingleValueMetric::Min),
            "max" => single(SingleValueMetric::Max),
            "value_count" => single(SingleValueMetric::ValueCount),
            "cardinality" => single(SingleValueMetric::Cardinality),
            "stats" => {
                let agg: FieldAgg = params_of(name, params)?;
                Ok(MetricAggregation::Stats {
                    field: self.numeric_field(name, agg_type, &agg.field)?,
                })
            }
            "percentiles" => {
                let agg: PercentilesAgg = params_of(name, params)?;
                let percents = agg.percents.unwrap_or_else(|| DEFAULT_PERCENTS.to_vec());
                let percents = percents
                    .into_iter()
                    .map(|p| percentile(name, p))
                    .collect::<Result<_, _>>()?;
                Ok(MetricAggregation::Percentiles {
                    field: self.numeric_field(name, agg_type, &agg.field)?,
                    percents,
                    keyed: agg.keyed.unwrap_or(true),
                })
            }
            "top_hits" => {
                let agg: TopHitsAgg = params_of(name, params)?;
                let sort = agg
                    .sort
                    .iter()
                    .flatten()
                    .map(|clause| sort_clause(name, clause))
                    .collect::<Result<Vec<_>, _>>()?
                    .into_iter()
                    .flatten()
                    .map(|(field, direction)| (self.lookup(&field), direction))
                    .collect();
                Ok(MetricAggregation::TopHits {
                    size: agg.size.unwrap_or(DEFAULT_TOP_HITS_SIZE),
                    sort,
                    fields: self.source_fields(agg.source.as_ref()),
                })
            }
            "top_metrics" => {
                let agg: TopMetricsAgg = params_of(name, params)?;
                let mut sort = sort_clause(name, &agg.sort)?;
                if sort.len() != 1 {
                    return Err(CompileError::malformed(name, "[sort] must name exactly one field"));
                }
                let (field, direction) = sort.remove(0);
                let metrics = agg
                    .metrics
                    .fields()
                    .iter()
                    .map(|f| self.field(f))
                    .collect::<Result<_, _>>()?;
                Ok(MetricAggregation::TopMetrics {
                    size: agg.size.unwrap_or(1),
                    sort: (self.field(&field)?, direction),
                    metrics,
                })
            }
            other => Err(unsupported(other)),
        }
    }

    fn translator(&self) -> WhereTranslator<'_> {
        WhereTranslator::new(self.schema, self.table).with_lucene(self.lucene)
    }

    /// Schema lookup without the aggregatable check
    fn lookup(&self, name: &str) -> FieldRef {
        match self.schema.field(self.table, name) {
            Some(info) => FieldRef::new(info.name, Some(info.field_type)),
            None => {
                tracing::debug!("Field {} not in schema of {}", name, self.table);
                FieldRef::new(name, None)
            }
        }
    }

    fn field(&self, name: &str) -> Result<FieldRef, CompileError> {
        if let Some(info) = self.schema.field(self.table, name) {
            if !info.aggregatable {
                return Err(CompileError::FieldNotAggregatable(name.to_string()));
            }
        }
        Ok(self.lookup(name))
    }

    fn numeric_field(&self, name: &str, agg_type: &str, field: &str) -> Result<FieldRef, CompileError> {
        let field_ref = self.field(field)?;
        match field_ref.field_type {
            Some(t) if !(t.is_numeric() || t.is_date() || t == FieldType::Boolean) => {
                Err(CompileError::malformed(
                    name,
                    format!("field [{field}] of type [{t}] is not supported for aggregation [{agg_type}]"),
                ))
            }
            _ => Ok(field_ref),
        }
    }

    fn source_fields(&self, source: Option<&SourceFilter>) -> Vec<FieldRef> {
        let names: Vec<String> = match source {
            Some(SourceFilter::Fields(fields)) => fields.clone(),
            Some(SourceFilter::Object {
                includes: Some(fields),
            }) => fields.clone(),
            _ => self
                .schema
                .fields(self.table)
                .into_iter()
                .map(|f| f.name)
                .collect(),
        };
        names.iter().map(|n| self.lookup(n)).collect()
    }

    fn filters(&self, name: &str, agg: &FiltersAgg) -> Result<BucketAggregation, CompileError> {
        let translator = self.translator();
        let (mut branches, keyed) = match &agg.filters {
            FiltersSpec::Keyed(filters) => {
                let branches = filters
                    .iter()
                    .map(|(key, query)| {
                        Ok(ConditionalBranch {
                            predicate: translator.translate_predicate(query)?,
                            label: BranchLabel::Filter {
                                name: Some(key.clone()),
                            },
                        })
                    })
                    .collect::<Result<Vec<_>, CompileError>>()?;
                (branches, true)
            }
            FiltersSpec::Anonymous(filters) => {
                let branches = filters
                    .iter()
                    .map(|query| {
                        Ok(ConditionalBranch {
                            predicate: translator.translate_predicate(query)?,
                            label: BranchLabel::Filter { name: None },
                        })
                    })
                    .collect::<Result<Vec<_>, CompileError>>()?;
                (branches, false)
            }
        };
        if branches.is_empty() {
            return Err(CompileError::malformed(name, "[filters] must not be empty"));
        }

        if agg.other_bucket.unwrap_or(false) || agg.other_bucket_key.is_some() {
            let any = or_all(branches.iter().map(|b| b.predicate.as_str()))
                .unwrap_or_else(|| "false".to_string());
            let key = agg
                .other_bucket_key
                .clone()
                .unwrap_or_else(|| DEFAULT_OTHER_BUCKET_KEY.to_string());
            branches.push(ConditionalBranch {
                predicate: format!("NOT ({any})"),
                label: BranchLabel::Filter {
                    name: keyed.then_some(key),
                },
            });
        }
        Ok(BucketAggregation::Filters { branches, keyed })
    }
}

fn unsupported(agg_type: &str) -> CompileError {
    CompileError::UnsupportedAggregationType {
        agg_type: agg_type.to_string(),
        reason: "unknown aggregation type".to_string(),
    }
}

fn qualified(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}>{name}")
    }
}

fn is_utc(tz: &str) -> bool {
    matches!(tz, "UTC" | "utc" | "Z" | "+00:00" | "Etc/UTC" | "GMT")
}

fn params_of<T: DeserializeOwned>(name: &str, params: &Value) -> Result<T, CompileError> {
    serde_json::from_value(params.clone()).map_err(|e| CompileError::malformed(name, e.to_string()))
}

/// Split an aggregation body into type, parameters and sub-aggregations
fn classify<'v>(
    name: &str,
    body: &'v Value,
) -> Result<(&'v str, &'v Value, Option<&'v Map<String, Value>>), CompileError> {
    let object = body
        .as_object()
        .ok_or_else(|| CompileError::malformed(name, "aggregation body must be an object"))?;
    let types: Vec<(&String, &Value)> = object
        .iter()
        .filter(|(k, _)| !NON_TYPE_KEYS.contains(&k.as_str()))
        .collect();
    let (agg_type, params) = match types.as_slice() {
        [single] => *single,
        [] => return Err(CompileError::malformed(name, "missing aggregation type")),
        many => {
            let names: Vec<&str> = many.iter().map(|(k, _)| k.as_str()).collect();
            return Err(CompileError::malformed(
                name,
                format!("expected one aggregation type, found [{}]", names.join(", ")),
            ));
        }
    };
    let sub_aggs = match object.get("aggs").or_else(|| object.get("aggregations")) {
        None => None,
        Some(Value::Object(sub)) => Some(sub),
        Some(_) => return Err(CompileError::malformed(name, "[aggs] must be an object")),
    };
    Ok((agg_type.as_str(), params, sub_aggs))
}

fn compile_pipeline(
    name: &str,
    agg_type: &str,
    params: &Value,
    parent: ParentKind,
    scope: &[ScopeEntry],
) -> Result<PipelineAggregation, CompileError> {
    let placement = |reason: &str| CompileError::InvalidPipelinePlacement {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let (function, raw_paths, gap_policy) = match agg_type {
        "bucket_script" => {
            let agg: BucketScriptAgg = params_of(name, params)?;
            let source = agg
                .script
                .source()
                .ok_or_else(|| CompileError::malformed(name, "[script] has no source"))?;
            let script = Script::parse(source)?;
            if let Some(unknown) = script
                .variables()
                .into_iter()
                .find(|v| !agg.buckets_path.contains_key(*v))
            {
                return Err(CompileError::Script(format!(
                    "params.{unknown} is not declared in buckets_path"
                )));
            }
            let paths: Vec<(String, String)> = agg.buckets_path.into_iter().collect();
            (PipelineFunction::BucketScript(script), paths, agg.gap_policy)
        }
        _ => {
            let agg: BucketsPathAgg = params_of(name, params)?;
            let function = match agg_type {
                "cumulative_sum" => PipelineFunction::CumulativeSum,
                "derivative" => PipelineFunction::Derivative,
                "min_bucket" => PipelineFunction::MinBucket,
                "max_bucket" => PipelineFunction::MaxBucket,
                "avg_bucket" => PipelineFunction::AvgBucket,
                "sum_bucket" => PipelineFunction::SumBucket,
                other => return Err(unsupported(other)),
            };
            (function, vec![("_value".to_string(), agg.buckets_path)], agg.gap_policy)
        }
    };

    let gap_policy = match gap_policy.as_deref() {
        None => GapPolicy::default(),
        Some(policy) => GapPolicy::parse(policy)
            .ok_or_else(|| CompileError::malformed(name, format!("unknown gap_policy [{policy}]")))?,
    };
    if function.needs_multi_bucket_parent() && parent != ParentKind::MultiBucket {
        return Err(placement("must be declared inside a multi-bucket aggregation"));
    }

    let mut paths = Vec::with_capacity(raw_paths.len());
    for (var, raw) in raw_paths {
        let reference = buckets_path::resolve(&raw, scope)?;
        if reference.first_segment() == Some(name) {
            return Err(CompileError::PipelineCycle(vec![name.to_string(), name.to_string()]));
        }
        let first = reference
            .first_segment()
            .and_then(|s| scope.iter().find(|e| e.name == s));
        if function.is_sibling() {
            if !first.is_some_and(|e| e.multi_bucket) || reference.descend().is_none() {
                return Err(placement(
                    "buckets_path must start at a sibling multi-bucket aggregation",
                ));
            }
        } else if first.is_some_and(|e| e.multi_bucket)
            && !matches!(reference, BucketsPathReference::SpecialCount)
        {
            return Err(placement(
                "buckets_path must resolve to a single value in each bucket",
            ));
        }
        paths.push((var, reference));
    }

    Ok(PipelineAggregation {
        function,
        paths,
        gap_policy,
    })
}

/// Follow dependencies among unsortable pipelines until a name repeats
fn find_cycle(children: &[AggregationNode], pending: &[(usize, Vec<String>)]) -> Vec<String> {
    let Some((start, _)) = pending.first() else {
        return Vec::new();
    };
    let mut cycle = vec![children[*start].name.clone()];
    let mut current = *start;
    loop {
        let next = pending
            .iter()
            .find(|(i, _)| *i == current)
            .and_then(|(_, reads)| {
                reads
                    .iter()
                    .find_map(|name| pending.iter().find(|(i, _)| children[*i].name == *name))
            });
        let Some((index, _)) = next else {
            return cycle;
        };
        let name = children[*index].name.clone();
        let seen = cycle.iter().position(|n| *n == name);
        cycle.push(name);
        if let Some(pos) = seen {
            return cycle.split_off(pos);
        }
        current = *index;
    }
}

fn terms_order(
    name: &str,
    order: Option<&Value>,
    children: &[AggregationNode],
) -> Result<TermsOrder, CompileError> {
    let first = match order {
        None => return Ok(TermsOrder::Count(SortDirection::Desc)),
        Some(Value::Array(items)) => items.first(),
        Some(other) => Some(other),
    };
    let Some((key, direction)) = first
        .and_then(Value::as_object)
        .and_then(|o| o.iter().next())
    else {
        return Err(CompileError::malformed(name, "[order] must name a key and a direction"));
    };
    let direction = direction
        .as_str()
        .and_then(SortDirection::parse)
        .ok_or_else(|| CompileError::malformed(name, format!("invalid order direction for [{key}]")))?;

    match key.as_str() {
        "_count" => Ok(TermsOrder::Count(direction)),
        "_key" | "_term" => Ok(TermsOrder::Key(direction)),
        path => {
            let (child_name, value) = match find_child(children, path) {
                Some(_) => (path, None),
                None => match buckets_path::split_value_selector(path) {
                    Some((child, value)) => (child, Some(value)),
                    None => (path, None),
                },
            };
            let invalid = || {
                CompileError::malformed(name, format!("order path [{path}] does not name a metric sub-aggregation"))
            };
            let (child, node) = find_child(children, child_name).ok_or_else(invalid)?;
            let metric = node.metric().filter(|m| m.is_aggregate()).ok_or_else(invalid)?;
            let value = match value {
                None | Some("value") => None,
                Some(v) => Some(metric.value_name(v).ok_or_else(invalid)?),
            };
            Ok(TermsOrder::Metric {
                child,
                value,
                direction,
            })
        }
    }
}

fn split_interval(raw: &str) -> Option<(i64, &str)> {
    let raw = raw.trim();
    let digits = raw.find(|c: char| !c.is_ascii_digit())?;
    let amount = raw[..digits].parse::<i64>().ok()?;
    Some((amount, &raw[digits..]))
}

fn fixed_interval(raw: &str) -> Option<DateInterval> {
    let (amount, unit) = split_interval(raw)?;
    let unit_ms = match unit {
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => return None,
    };
    (amount > 0).then_some(DateInterval::Fixed {
        millis: amount.checked_mul(unit_ms)?,
    })
}

fn calendar_interval(raw: &str) -> Option<DateInterval> {
    let interval = match raw.trim() {
        "minute" | "1m" => DateInterval::Fixed { millis: 60_000 },
        "hour" | "1h" => DateInterval::Fixed { millis: 3_600_000 },
        "day" | "1d" => DateInterval::Fixed { millis: 86_400_000 },
        "week" | "1w" => DateInterval::Calendar(CalendarUnit::Week),
        "month" | "1M" => DateInterval::Calendar(CalendarUnit::Month),
        "quarter" | "1q" => DateInterval::Calendar(CalendarUnit::Quarter),
        "year" | "1y" => DateInterval::Calendar(CalendarUnit::Year),
        _ => return None,
    };
    Some(interval)
}

fn date_interval(name: &str, agg: &DateHistogramAgg) -> Result<DateInterval, CompileError> {
    let invalid = |raw: &str| CompileError::malformed(name, format!("invalid interval [{raw}]"));
    if let Some(raw) = &agg.fixed_interval {
        return fixed_interval(raw).ok_or_else(|| invalid(raw));
    }
    if let Some(raw) = &agg.calendar_interval {
        return calendar_interval(raw).ok_or_else(|| invalid(raw));
    }
    if let Some(raw) = &agg.interval {
        return calendar_interval(raw)
            .or_else(|| fixed_interval(raw))
            .ok_or_else(|| invalid(raw));
    }
    Err(CompileError::malformed(
        name,
        "[date_histogram] requires fixed_interval or calendar_interval",
    ))
}

fn percentile(name: &str, percent: f64) -> Result<Percentile, CompileError> {
    if !(0.0..=100.0).contains(&percent) {
        return Err(CompileError::malformed(
            name,
            format!("percent [{percent}] must be between 0 and 100"),
        ));
    }
    let fraction = ((percent / 100.0) * 1e10).round() / 1e10;
    Ok(Percentile {
        key: format_es_double(percent),
        percent,
        fraction: fraction.min(MAX_PERCENTILE_FRACTION),
    })
}

fn sort_clause(name: &str, clause: &SortClause) -> Result<Vec<(String, SortDirection)>, CompileError> {
    match clause {
        SortClause::Field(field) if field == "_score" => Ok(Vec::new()),
        SortClause::Field(field) => Ok(vec![(field.clone(), SortDirection::Asc)]),
        SortClause::Object(fields) => fields
            .iter()
            .filter(|(field, _)| field.as_str() != "_score")
            .map(|(field, order)| {
                let direction = SortDirection::parse(order.order()).ok_or_else(|| {
                    CompileError::malformed(name, format!("invalid sort order for [{field}]"))
                })?;
                Ok((field.clone(), direction))
            })
            .collect(),
    }
}

fn range_branch(field: &FieldRef, range: &RangeBucket) -> ConditionalBranch {
    let column = field.value_sql();
    let from = range.from.map(|f| format!("{column} >= {}", crate::query::sql::float_literal(f)));
    let to = range.to.map(|t| format!("{column} < {}", crate::query::sql::float_literal(t)));
    let key = range.key.clone().unwrap_or_else(|| {
        format!(
            "{}-{}",
            range.from.map(format_es_double).unwrap_or_else(|| "*".into()),
            range.to.map(format_es_double).unwrap_or_else(|| "*".into())
        )
    });
    ConditionalBranch {
        predicate: and_all(from.into_iter().chain(to)).unwrap_or_else(|| "true".to_string()),
        label: BranchLabel::Range {
            key,
            from: range.from,
            to: range.to,
        },
    }
}

fn date_bound(value: &Value) -> Result<Option<DateBound>, CompileError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) if date_math::is_date_math(s) => {
            let expr = date_math::parse(s)?;
            Ok(Some(DateBound {
                sql: expr.to_clickhouse(),
                source: DateBoundSource::Math(expr),
            }))
        }
        Value::String(s) => Ok(Some(DateBound {
            sql: format!("parseDateTime64BestEffort({})", quote_literal(s)),
            source: DateBoundSource::Text(s.clone()),
        })),
        Value::Number(n) => {
            let millis = n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .ok_or_else(|| CompileError::InvalidQuery(format!("invalid date bound {n}")))?;
            Ok(Some(DateBound {
                sql: format!("fromUnixTimestamp64Milli({millis})"),
                source: DateBoundSource::Millis(millis),
            }))
        }
        other => Err(CompileError::InvalidQuery(format!("invalid date bound {other}"))),
    }
}

fn date_range_branch(field: &FieldRef, range: &DateRangeBucket) -> Result<ConditionalBranch, CompileError> {
    let from = range.from.as_ref().map(date_bound).transpose()?.flatten();
    let to = range.to.as_ref().map(date_bound).transpose()?.flatten();
    let column = field.sql();
    let predicate = and_all(
        from.iter()
            .map(|b| format!("{column} >= {}", b.sql))
            .chain(to.iter().map(|b| format!("{column} < {}", b.sql))),
    )
    .unwrap_or_else(|| "true".to_string());
    Ok(ConditionalBranch {
        predicate,
        label: BranchLabel::DateRange {
            key: range.key.clone(),
            from,
            to,
        },
    })
}

/// Format a double the way Elasticsearch (Java) prints it: `50.0`, `99.9999`, `1.0E-4`
pub fn format_es_double(value: f64) -> String {
    let magnitude = value.abs();
    if value == 0.0 || (1e-3..1e7).contains(&magnitude) {
        let s = format!("{value}");
        if s.contains('.') {
            s
        } else {
            format!("{s}.0")
        }
    } else {
        let s = format!("{value:E}");
        match s.split_once('E') {
            Some((mantissa, exponent)) if !mantissa.contains('.') => {
                format!("{mantissa}.0E{exponent}")
            }
            _ => s,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry::schema::{FieldInfo, SchemaRegistry, TableSchema};
    use serde_json::json;

    fn schema() -> SchemaRegistry {
        let registry = SchemaRegistry::new();
        let mut hidden = FieldInfo::new("secret", FieldType::Keyword);
        hidden.aggregatable = false;
        registry.register(
            TableSchema::new("logs")
                .with_field(FieldInfo::new("@timestamp", FieldType::Timestamp))
                .with_field(FieldInfo::new("host", FieldType::Keyword))
                .with_field(FieldInfo::new("message", FieldType::Text))
                .with_field(FieldInfo::new("bytes", FieldType::Long))
                .with_field(FieldInfo::new("price", FieldType::Float))
                .with_field(hidden),
        );
        registry
    }

    fn compile(aggs: Value) -> CompiledAggregations {
        let schema = schema();
        let aggs = aggs.as_object().cloned().unwrap();
        AggregationCompiler::new(&schema, "logs").compile(&aggs)
    }

    #[test]
    fn test_request_order_preserved() {
        let result = compile(json!({
            "z": {"avg": {"field": "bytes"}},
            "a": {"terms": {"field": "host"}},
            "m": {"max": {"field": "price"}}
        }));
        assert!(result.warnings.is_empty());
        assert_eq!(result.tree.names(), vec!["z", "a", "m"]);
    }

    #[test]
    fn test_unknown_and_unsupported_types() {
        let result = compile(json!({
            "geo": {"geo_centroid": {"field": "loc"}},
            "what": {"frobnicate": {}},
            "ok": {"sum": {"field": "bytes"}}
        }));
        assert_eq!(result.tree.names(), vec!["ok"]);
        assert_eq!(result.warnings.len(), 2);
        assert!(matches!(
            &result.warnings[0].error,
            CompileError::UnsupportedAggregationType { reason, .. } if reason.contains("not supported")
        ));
        assert!(matches!(
            &result.warnings[1].error,
            CompileError::UnsupportedAggregationType { reason, .. } if reason.contains("unknown")
        ));
    }

    #[test]
    fn test_meta_is_not_a_type() {
        let result = compile(json!({
            "a": {"avg": {"field": "bytes"}, "meta": {"color": "red"}},
            "b": {"avg": {"field": "bytes"}, "sum": {"field": "bytes"}}
        }));
        assert_eq!(result.tree.names(), vec!["a"]);
        assert!(matches!(result.warnings[0].error, CompileError::MalformedAggregation { .. }));
    }

    #[test]
    fn test_non_aggregatable_drops_only_subtree() {
        let result = compile(json!({
            "hosts": {
                "terms": {"field": "host"},
                "aggs": {
                    "bad": {"terms": {"field": "secret"}},
                    "text": {"terms": {"field": "message"}},
                    "good": {"avg": {"field": "bytes"}}
                }
            }
        }));
        let hosts = &result.tree.aggregations[0];
        assert_eq!(hosts.children.len(), 1);
        assert_eq!(hosts.children[0].name, "good");
        assert_eq!(result.warnings[0].aggregation, "hosts>bad");
        assert_eq!(
            result.warnings[0].error,
            CompileError::FieldNotAggregatable("secret".into())
        );
        assert_eq!(result.warnings[1].aggregation, "hosts>text");
    }

    #[test]
    fn test_unknown_field_is_allowed() {
        let result = compile(json!({"u": {"terms": {"field": "not_in_schema"}}}));
        assert!(result.warnings.is_empty());
        let Some(BucketAggregation::Terms(params)) = result.tree.aggregations[0].bucket() else {
            panic!("expected terms");
        };
        assert_eq!(params.field.field_type, None);
        assert_eq!(params.size, 10);
    }

    #[test]
    fn test_percentiles_fractions() {
        let result = compile(json!({
            "p": {"percentiles": {"field": "price", "percents": [0.001, 50, 99.9999, 100]}}
        }));
        let Some(MetricAggregation::Percentiles { percents, keyed, .. }) =
            result.tree.aggregations[0].metric()
        else {
            panic!("expected percentiles");
        };
        assert!(*keyed);
        let keys: Vec<_> = percents.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, vec!["0.001", "50.0", "99.9999", "100.0"]);
        assert_eq!(percents[0].fraction, 0.00001);
        assert_eq!(percents[2].fraction, 0.999999);
        assert_eq!(percents[3].fraction, MAX_PERCENTILE_FRACTION);
    }

    #[test]
    fn test_default_percents() {
        let result = compile(json!({"p": {"percentiles": {"field": "price"}}}));
        let metric = result.tree.aggregations[0].metric().unwrap();
        assert_eq!(metric.value_names().len(), 7);
    }

    #[test]
    fn test_pipeline_evaluation_order() {
        let result = compile(json!({
            "per_hour": {
                "date_histogram": {"field": "@timestamp", "fixed_interval": "1h"},
                "aggs": {
                    "total": {"cumulative_sum": {"buckets_path": "running"}},
                    "running": {"cumulative_sum": {"buckets_path": "sum"}},
                    "sum": {"sum": {"field": "bytes"}}
                }
            }
        }));
        assert!(result.warnings.is_empty(), "{:?}", result.warnings);
        let node = &result.tree.aggregations[0];
        let names: Vec<_> = node.children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["total", "running", "sum"]);
        let order: Vec<_> = node
            .evaluation_order
            .iter()
            .map(|&i| node.children[i].name.as_str())
            .collect();
        assert_eq!(order, vec!["sum", "running", "total"]);
    }

    #[test]
    fn test_pipeline_cycle_is_dropped() {
        let result = compile(json!({
            "h": {
                "histogram": {"field": "bytes", "interval": 10},
                "aggs": {
                    "a": {"cumulative_sum": {"buckets_path": "b"}},
                    "b": {"derivative": {"buckets_path": "a"}},
                    "c": {"cumulative_sum": {"buckets_path": "_count"}}
                }
            }
        }));
        let node = &result.tree.aggregations[0];
        let names: Vec<_> = node.children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["c"]);
        assert_eq!(node.evaluation_order, vec![0]);
        assert_eq!(result.warnings.len(), 2);
        assert_eq!(
            result.warnings[0].error,
            CompileError::PipelineCycle(vec!["a".into(), "b".into(), "a".into()])
        );
    }

    #[test]
    fn test_pipeline_placement() {
        let result = compile(json!({
            "top_cumsum": {"cumulative_sum": {"buckets_path": "_count"}},
            "f": {
                "filter": {"term": {"host": "a"}},
                "aggs": {"d": {"derivative": {"buckets_path": "_count"}}}
            },
            "hosts": {"terms": {"field": "host"}, "aggs": {"s": {"sum": {"field": "bytes"}}}},
            "best": {"max_bucket": {"buckets_path": "hosts>s"}},
            "wrong": {"max_bucket": {"buckets_path": "f>_count"}}
        }));
        let names = result.tree.names();
        assert_eq!(names, vec!["f", "hosts", "best"]);
        assert!(result.tree.aggregations[0].children.is_empty());
        let placements = result
            .warnings
            .iter()
            .filter(|w| matches!(w.error, CompileError::InvalidPipelinePlacement { .. }))
            .count();
        assert_eq!(placements, 3);
    }

    #[test]
    fn test_unresolved_buckets_path() {
        let result = compile(json!({
            "hosts": {"terms": {"field": "host"}},
            "best": {"max_bucket": {"buckets_path": "hosts>nope"}}
        }));
        assert_eq!(result.tree.names(), vec!["hosts"]);
        assert_eq!(
            result.warnings[0].error,
            CompileError::UnresolvedBucketsPath {
                path: "hosts>nope".into(),
                segment: "nope".into()
            }
        );
    }

    #[test]
    fn test_bucket_script_variables() {
        let result = compile(json!({
            "h": {
                "histogram": {"field": "bytes", "interval": 100},
                "aggs": {
                    "s": {"sum": {"field": "price"}},
                    "ratio": {"bucket_script": {
                        "buckets_path": {"total": "s", "n": "_count"},
                        "script": "params.total / params.n"
                    }},
                    "broken": {"bucket_script": {
                        "buckets_path": {"total": "s"},
                        "script": {"source": "params.total / params.missing"}
                    }}
                }
            }
        }));
        let node = &result.tree.aggregations[0];
        assert_eq!(node.children.len(), 2);
        assert!(matches!(result.warnings[0].error, CompileError::Script(_)));
    }

    #[test]
    fn test_terms_order() {
        let result = compile(json!({
            "hosts": {
                "terms": {"field": "host", "size": 3, "order": {"st.avg": "asc"}},
                "aggs": {"st": {"stats": {"field": "price"}}}
            },
            "keys": {"terms": {"field": "host", "order": [{"_key": "asc"}]}},
            "bad": {"terms": {"field": "host", "order": {"nothing": "asc"}}}
        }));
        assert_eq!(result.tree.names(), vec!["hosts", "keys"]);
        let Some(BucketAggregation::Terms(params)) = result.tree.aggregations[0].bucket() else {
            panic!("expected terms");
        };
        assert_eq!(
            params.order,
            TermsOrder::Metric {
                child: 0,
                value: Some("avg".into()),
                direction: SortDirection::Asc
            }
        );
        let Some(BucketAggregation::Terms(params)) = result.tree.aggregations[1].bucket() else {
            panic!("expected terms");
        };
        assert_eq!(params.order, TermsOrder::Key(SortDirection::Asc));
    }

    #[test]
    fn test_terms_order_by_percentile() {
        let by_percentile = |order: &str| {
            json!({"hosts": {
                "terms": {"field": "host", "order": {order: "desc"}},
                "aggs": {"p": {"percentiles": {"field": "price", "percents": [99]}}}
            }})
        };
        for order in ["p.99", "p[99.0]", "p.99.0"] {
            let result = compile(by_percentile(order));
            assert!(result.warnings.is_empty(), "{order}: {:?}", result.warnings);
            let Some(BucketAggregation::Terms(params)) = result.tree.aggregations[0].bucket() else {
                panic!("expected terms for {order}");
            };
            assert_eq!(
                params.order,
                TermsOrder::Metric {
                    child: 0,
                    value: Some("99.0".into()),
                    direction: SortDirection::Desc
                }
            );
        }

        let result = compile(by_percentile("p.50"));
        assert!(result.tree.aggregations.is_empty());
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_unknown_gap_policy() {
        let result = compile(json!({"h": {
            "histogram": {"field": "bytes", "interval": 10},
            "aggs": {
                "zeros": {"derivative": {"buckets_path": "_count", "gap_policy": "insert_zeros"}},
                "bad": {"derivative": {"buckets_path": "_count", "gap_policy": "guess"}}
            }
        }}));
        let node = &result.tree.aggregations[0];
        assert_eq!(node.children.len(), 1);
        assert_eq!(
            node.children[0].pipeline().map(|p| p.gap_policy),
            Some(GapPolicy::InsertZeros)
        );
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].aggregation, "h>bad");
    }

    #[test]
    fn test_date_histogram_intervals() {
        let result = compile(json!({
            "fixed": {"date_histogram": {"field": "@timestamp", "fixed_interval": "30s"}},
            "cal": {"date_histogram": {"field": "@timestamp", "calendar_interval": "month"}},
            "legacy": {"date_histogram": {"field": "@timestamp", "interval": "1d"}},
            "bad": {"date_histogram": {"field": "@timestamp", "calendar_interval": "3M"}}
        }));
        assert_eq!(result.tree.names(), vec!["fixed", "cal", "legacy"]);
        let intervals: Vec<_> = result
            .tree
            .aggregations
            .iter()
            .map(|n| match n.bucket() {
                Some(BucketAggregation::DateHistogram(p)) => p.interval,
                _ => panic!("expected date_histogram"),
            })
            .collect();
        assert_eq!(
            intervals,
            vec![
                DateInterval::Fixed { millis: 30_000 },
                DateInterval::Calendar(CalendarUnit::Month),
                DateInterval::Fixed { millis: 86_400_000 },
            ]
        );
    }

    #[test]
    fn test_range_keys_and_predicates() {
        let result = compile(json!({
            "r": {"range": {"field": "price", "ranges": [{"to": 100}, {"from": 100, "to": 200}, {"from": 200, "key": "pricey"}]}}
        }));
        let branches = result.tree.aggregations[0].bucket().unwrap().branches().unwrap();
        let keys: Vec<_> = branches
            .iter()
            .map(|b| match &b.label {
                BranchLabel::Range { key, .. } => key.clone(),
                _ => panic!("expected range label"),
            })
            .collect();
        assert_eq!(keys, vec!["*-100.0", "100.0-200.0", "pricey"]);
        assert_eq!(branches[0].predicate, "\"price\" < 100");
        assert_eq!(branches[1].predicate, "(\"price\" >= 100) AND (\"price\" < 200)");
    }

    #[test]
    fn test_date_range_bounds() {
        let result = compile(json!({
            "dr": {"date_range": {"field": "@timestamp", "ranges": [{"from": "now-1d/d", "to": "now"}, {"from": 0}]}}
        }));
        let branches = result.tree.aggregations[0].bucket().unwrap().branches().unwrap();
        assert_eq!(
            branches[0].predicate,
            "(\"@timestamp\" >= toStartOfDay(subDate(now(), INTERVAL 1 day))) AND (\"@timestamp\" < now())"
        );
        assert_eq!(branches[1].predicate, "\"@timestamp\" >= fromUnixTimestamp64Milli(0)");
    }

    #[test]
    fn test_filters_sorted_with_other_bucket() {
        let result = compile(json!({
            "f": {"filters": {
                "filters": {
                    "zeta": {"term": {"host": "z"}},
                    "alpha": {"match_all": {}}
                },
                "other_bucket_key": "rest"
            }}
        }));
        let Some(BucketAggregation::Filters { branches, keyed }) = result.tree.aggregations[0].bucket()
        else {
            panic!("expected filters");
        };
        assert!(*keyed);
        let names: Vec<_> = branches
            .iter()
            .map(|b| match &b.label {
                BranchLabel::Filter { name } => name.clone().unwrap(),
                _ => panic!("expected filter label"),
            })
            .collect();
        assert_eq!(names, vec!["alpha", "zeta", "rest"]);
        assert_eq!(branches[0].predicate, "true");
        assert_eq!(branches[2].predicate, "NOT ((true) OR (\"host\" = 'z'))");
    }

    #[test]
    fn test_metric_with_sub_aggs_rejected() {
        let result = compile(json!({
            "a": {"avg": {"field": "bytes"}, "aggs": {"b": {"max": {"field": "bytes"}}}}
        }));
        assert!(result.tree.is_empty());
        assert!(matches!(result.warnings[0].error, CompileError::MalformedAggregation { .. }));
    }

    #[test]
    fn test_format_es_double() {
        assert_eq!(format_es_double(50.0), "50.0");
        assert_eq!(format_es_double(99.9999), "99.9999");
        assert_eq!(format_es_double(0.001), "0.001");
        assert_eq!(format_es_double(0.0001), "1.0E-4");
        assert_eq!(format_es_double(0.0), "0.0");
        assert_eq!(format_es_double(-5.5), "-5.5");
    }
}
