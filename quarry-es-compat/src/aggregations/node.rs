//! Compiled aggregation tree
//!
//! Every aggregation of a request becomes one [`AggregationNode`]. Nodes are
//! a closed set of variants grouped by kind (bucket, metric, pipeline) and
//! keep their children in request order. The tree is built once by the
//! compiler and only read afterwards.

use crate::aggregations::buckets_path::BucketsPathReference;
use crate::aggregations::script::Script;
use crate::query::date_math::DateMathExpression;
use crate::query::sql::{quote_identifier, SortDirection};
use crate::query::types::{DateExtendedBounds, ExtendedBounds};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use quarry::executor::NumericValue;
use quarry::schema::FieldType;

/// A column reference resolved against the schema
#[derive(Debug, Clone, PartialEq)]
pub struct FieldRef {
    pub name: String,
    /// `None` when the schema does not know the field
    pub field_type: Option<FieldType>,
}

impl FieldRef {
    pub fn new(name: impl Into<String>, field_type: Option<FieldType>) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }

    pub fn sql(&self) -> String {
        quote_identifier(&self.name)
    }

    pub fn is_date(&self) -> bool {
        self.field_type.is_some_and(|t| t.is_date())
    }

    pub fn is_boolean(&self) -> bool {
        self.field_type == Some(FieldType::Boolean)
    }

    /// Epoch milliseconds of a date column
    pub fn millis_sql(&self) -> String {
        match self.field_type {
            Some(FieldType::Date) => format!("toInt64(toUnixTimestamp({}) * 1000)", self.sql()),
            _ => format!("toUnixTimestamp64Milli({})", self.sql()),
        }
    }

    /// Expression used when the field is a grouping key or a metric input
    pub fn value_sql(&self) -> String {
        if self.is_boolean() {
            format!("toInt8({})", self.sql())
        } else if self.is_date() {
            self.millis_sql()
        } else {
            self.sql()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TermsOrder {
    Count(SortDirection),
    Key(SortDirection),
    /// A single value of a metric child, `value` names a stats/percentiles part
    Metric {
        child: usize,
        value: Option<String>,
        direction: SortDirection,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TermsParams {
    pub field: FieldRef,
    pub size: usize,
    pub order: TermsOrder,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistogramParams {
    pub field: FieldRef,
    pub interval: f64,
    pub min_doc_count: u64,
    pub extended_bounds: Option<ExtendedBounds>,
}

impl HistogramParams {
    pub fn key_sql(&self) -> String {
        let integer_field = self.field.field_type.is_some_and(|t| t.is_integer());
        if self.interval == 1.0 && integer_field {
            self.field.sql()
        } else {
            let interval = crate::query::sql::float_literal(self.interval);
            format!("floor({} / {interval}) * {interval}", self.field.value_sql())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarUnit {
    Week,
    Month,
    Quarter,
    Year,
}

impl CalendarUnit {
    pub fn start_of_sql(&self, column: &str) -> String {
        match self {
            CalendarUnit::Week => format!("toMonday({column})"),
            CalendarUnit::Month => format!("toStartOfMonth({column})"),
            CalendarUnit::Quarter => format!("toStartOfQuarter({column})"),
            CalendarUnit::Year => format!("toStartOfYear({column})"),
        }
    }

    pub fn months(&self) -> Option<u32> {
        match self {
            CalendarUnit::Week => None,
            CalendarUnit::Month => Some(1),
            CalendarUnit::Quarter => Some(3),
            CalendarUnit::Year => Some(12),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateInterval {
    Fixed { millis: i64 },
    Calendar(CalendarUnit),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DateHistogramParams {
    pub field: FieldRef,
    pub interval: DateInterval,
    pub min_doc_count: u64,
    pub extended_bounds: Option<DateExtendedBounds>,
}

impl DateHistogramParams {
    pub fn key_sql(&self) -> String {
        match self.interval {
            DateInterval::Fixed { millis } => {
                format!("intDiv({}, {millis})", self.field.millis_sql())
            }
            DateInterval::Calendar(unit) => format!(
                "toInt64(toUnixTimestamp({}))",
                unit.start_of_sql(&self.field.sql())
            ),
        }
    }

    /// Bucket key in epoch millis from the value the store returned
    pub fn key_millis(&self, raw: i64) -> i64 {
        match self.interval {
            DateInterval::Fixed { millis } => raw.saturating_mul(millis),
            DateInterval::Calendar(_) => raw.saturating_mul(1000),
        }
    }
}

/// Where a date_range bound came from
#[derive(Debug, Clone, PartialEq)]
pub enum DateBoundSource {
    Math(DateMathExpression),
    Millis(i64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DateBound {
    /// SQL expression of the bound instant
    pub sql: String,
    pub source: DateBoundSource,
}

impl DateBound {
    /// Resolve the bound locally when the store did not report it
    pub fn local_millis(&self, now: DateTime<Utc>) -> Option<i64> {
        match &self.source {
            DateBoundSource::Millis(ms) => Some(*ms),
            DateBoundSource::Math(expr) => expr.evaluate(now).ok().map(|t| t.timestamp_millis()),
            DateBoundSource::Text(s) => parse_date_text(s).map(|t| t.timestamp_millis()),
        }
    }
}

fn parse_date_text(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, format) {
            return Some(t.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| t.and_utc())
}

#[derive(Debug, Clone, PartialEq)]
pub enum BranchLabel {
    Range {
        key: String,
        from: Option<f64>,
        to: Option<f64>,
    },
    DateRange {
        key: Option<String>,
        from: Option<DateBound>,
        to: Option<DateBound>,
    },
    Filter {
        name: Option<String>,
    },
}

/// One branch of a range, date_range or filters aggregation
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionalBranch {
    pub predicate: String,
    pub label: BranchLabel,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BucketAggregation {
    Terms(TermsParams),
    Histogram(HistogramParams),
    DateHistogram(DateHistogramParams),
    Range {
        field: FieldRef,
        branches: Vec<ConditionalBranch>,
        keyed: bool,
    },
    DateRange {
        field: FieldRef,
        branches: Vec<ConditionalBranch>,
        keyed: bool,
    },
    /// Predicate lives in [`AggregationNode::where_clause`]
    Filter,
    Filters {
        branches: Vec<ConditionalBranch>,
        keyed: bool,
    },
}

impl BucketAggregation {
    pub fn type_name(&self) -> &'static str {
        match self {
            BucketAggregation::Terms(_) => "terms",
            BucketAggregation::Histogram(_) => "histogram",
            BucketAggregation::DateHistogram(_) => "date_histogram",
            BucketAggregation::Range { .. } => "range",
            BucketAggregation::DateRange { .. } => "date_range",
            BucketAggregation::Filter => "filter",
            BucketAggregation::Filters { .. } => "filters",
        }
    }

    /// Grouping key expression, `None` for predicate-based buckets
    pub fn key_sql(&self) -> Option<String> {
        match self {
            BucketAggregation::Terms(p) => Some(p.field.value_sql()),
            BucketAggregation::Histogram(p) => Some(p.key_sql()),
            BucketAggregation::DateHistogram(p) => Some(p.key_sql()),
            _ => None,
        }
    }

    /// Branches of range, date_range and filters
    pub fn branches(&self) -> Option<&[ConditionalBranch]> {
        match self {
            BucketAggregation::Range { branches, .. }
            | BucketAggregation::DateRange { branches, .. }
            | BucketAggregation::Filters { branches, .. } => Some(branches),
            _ => None,
        }
    }

    pub fn is_multi_bucket(&self) -> bool {
        !matches!(self, BucketAggregation::Filter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingleValueMetric {
    Avg,
    Sum,
    Min,
    Max,
    ValueCount,
    Cardinality,
}

impl SingleValueMetric {
    pub fn type_name(&self) -> &'static str {
        match self {
            SingleValueMetric::Avg => "avg",
            SingleValueMetric::Sum => "sum",
            SingleValueMetric::Min => "min",
            SingleValueMetric::Max => "max",
            SingleValueMetric::ValueCount => "value_count",
            SingleValueMetric::Cardinality => "cardinality",
        }
    }
}

/// A requested percentile
#[derive(Debug, Clone, PartialEq)]
pub struct Percentile {
    /// The percent as the client wrote it, formatted like Elasticsearch
    pub key: String,
    pub percent: f64,
    /// 0-1 fraction passed to the store
    pub fraction: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetricAggregation {
    Single {
        function: SingleValueMetric,
        field: FieldRef,
    },
    Stats {
        field: FieldRef,
    },
    Percentiles {
        field: FieldRef,
        percents: Vec<Percentile>,
        keyed: bool,
    },
    TopHits {
        size: usize,
        sort: Vec<(FieldRef, SortDirection)>,
        /// Empty selects every column
        fields: Vec<FieldRef>,
    },
    TopMetrics {
        size: usize,
        sort: (FieldRef, SortDirection),
        metrics: Vec<FieldRef>,
    },
}

pub const STATS_VALUES: [&str; 5] = ["count", "min", "max", "avg", "sum"];

impl MetricAggregation {
    pub fn type_name(&self) -> &'static str {
        match self {
            MetricAggregation::Single { function, .. } => function.type_name(),
            MetricAggregation::Stats { .. } => "stats",
            MetricAggregation::Percentiles { .. } => "percentiles",
            MetricAggregation::TopHits { .. } => "top_hits",
            MetricAggregation::TopMetrics { .. } => "top_metrics",
        }
    }

    /// Row-level metrics run as their own statement
    pub fn is_aggregate(&self) -> bool {
        !matches!(
            self,
            MetricAggregation::TopHits { .. } | MetricAggregation::TopMetrics { .. }
        )
    }

    /// Names of the values this metric exposes to buckets_path and ordering
    pub fn value_names(&self) -> Vec<String> {
        match self {
            MetricAggregation::Single { .. } => vec!["value".to_string()],
            MetricAggregation::Stats { .. } => STATS_VALUES.iter().map(|s| s.to_string()).collect(),
            MetricAggregation::Percentiles { percents, .. } => {
                percents.iter().map(|p| p.key.clone()).collect()
            }
            _ => Vec::new(),
        }
    }

    /// The exposed value `wanted` selects, in its canonical spelling
    pub fn value_name(&self, wanted: &str) -> Option<String> {
        match_value_name(&self.value_names(), wanted).cloned()
    }

    /// Aggregate SELECT expressions, conditional when `condition` is set.
    /// Empty for row-level metrics.
    pub fn aggregate_columns(&self, condition: Option<&str>) -> Vec<String> {
        match self {
            MetricAggregation::Single { function, field } => {
                vec![single_metric_sql(*function, field, condition)]
            }
            MetricAggregation::Stats { field } => {
                let x = field.value_sql();
                let count = match condition {
                    Some(c) => format!("countIf(({x} IS NOT NULL) AND ({c}))"),
                    None => format!("count({x})"),
                };
                let mut columns = vec![count];
                for function in ["minOrNull", "maxOrNull", "avgOrNull", "sumOrNull"] {
                    columns.push(conditional_call(function, &x, condition));
                }
                columns
            }
            MetricAggregation::Percentiles {
                field, percents, ..
            } => {
                let x = field.value_sql();
                percents
                    .iter()
                    .map(|p| match condition {
                        Some(c) => format!("quantileIf({})({x}, {c})", p.fraction),
                        None => format!("quantile({})({x})", p.fraction),
                    })
                    .collect()
            }
            MetricAggregation::TopHits { .. } | MetricAggregation::TopMetrics { .. } => Vec::new(),
        }
    }
}

/// Find `wanted` among value names, percentile keys compare numerically so `99` selects `99.0`
pub fn match_value_name<'n>(names: &'n [String], wanted: &str) -> Option<&'n String> {
    if let Some(exact) = names.iter().find(|n| *n == wanted) {
        return Some(exact);
    }
    let wanted = wanted.parse::<f64>().ok()?;
    names.iter().find(|n| n.parse::<f64>().ok() == Some(wanted))
}

fn conditional_call(function: &str, arg: &str, condition: Option<&str>) -> String {
    match condition {
        Some(c) => format!("{function}If({arg}, {c})"),
        None => format!("{function}({arg})"),
    }
}

fn single_metric_sql(function: SingleValueMetric, field: &FieldRef, condition: Option<&str>) -> String {
    let x = field.value_sql();
    match function {
        SingleValueMetric::Avg => conditional_call("avgOrNull", &x, condition),
        SingleValueMetric::Sum => conditional_call("sumOrNull", &x, condition),
        SingleValueMetric::Min => conditional_call("minOrNull", &x, condition),
        SingleValueMetric::Max => conditional_call("maxOrNull", &x, condition),
        SingleValueMetric::Cardinality => conditional_call("uniq", &x, condition),
        SingleValueMetric::ValueCount => match condition {
            Some(c) => format!("countIf(({x} IS NOT NULL) AND ({c}))"),
            None => format!("count({x})"),
        },
    }
}

/// Recover a stats label from the SQL column, `avgOrNullIf(..)` -> `avg`
pub fn stats_label(column: &str) -> &str {
    let function = column.split('(').next().unwrap_or(column);
    let function = function.strip_suffix("If").unwrap_or(function);
    function.strip_suffix("OrNull").unwrap_or(function)
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineFunction {
    CumulativeSum,
    Derivative,
    MinBucket,
    MaxBucket,
    AvgBucket,
    SumBucket,
    BucketScript(Script),
}

impl PipelineFunction {
    pub fn type_name(&self) -> &'static str {
        match self {
            PipelineFunction::CumulativeSum => "cumulative_sum",
            PipelineFunction::Derivative => "derivative",
            PipelineFunction::MinBucket => "min_bucket",
            PipelineFunction::MaxBucket => "max_bucket",
            PipelineFunction::AvgBucket => "avg_bucket",
            PipelineFunction::SumBucket => "sum_bucket",
            PipelineFunction::BucketScript(_) => "bucket_script",
        }
    }

    /// Computed across the buckets of the enclosing multi-bucket aggregation
    pub fn needs_multi_bucket_parent(&self) -> bool {
        matches!(
            self,
            PipelineFunction::CumulativeSum
                | PipelineFunction::Derivative
                | PipelineFunction::BucketScript(_)
        )
    }

    /// Reads the buckets of a sibling multi-bucket aggregation
    pub fn is_sibling(&self) -> bool {
        matches!(
            self,
            PipelineFunction::MinBucket
                | PipelineFunction::MaxBucket
                | PipelineFunction::AvgBucket
                | PipelineFunction::SumBucket
        )
    }
}

/// What a pipeline reads where a bucket has no value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GapPolicy {
    /// The bucket contributes nothing
    #[default]
    Skip,
    /// The missing value reads as zero
    InsertZeros,
}

impl GapPolicy {
    /// `keep_values` behaves as `skip`, a present value is always used
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "skip" | "keep_values" => Some(GapPolicy::Skip),
            "insert_zeros" => Some(GapPolicy::InsertZeros),
            _ => None,
        }
    }

    pub fn fill(self, value: Option<NumericValue>) -> Option<NumericValue> {
        match self {
            GapPolicy::Skip => value,
            GapPolicy::InsertZeros => value.or(Some(NumericValue::Int(0))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineAggregation {
    pub function: PipelineFunction,
    /// Script variable (or `_value`) to resolved path
    pub paths: Vec<(String, BucketsPathReference)>,
    pub gap_policy: GapPolicy,
}

impl PipelineAggregation {
    /// Names of same-level siblings this pipeline reads
    pub fn sibling_dependencies(&self) -> Vec<&str> {
        self.paths
            .iter()
            .filter_map(|(_, reference)| reference.first_segment())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AggregationKind {
    Bucket(BucketAggregation),
    Metric(MetricAggregation),
    Pipeline(PipelineAggregation),
}

/// One compiled aggregation
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationNode {
    pub name: String,
    pub kind: AggregationKind,
    /// Request order
    pub children: Vec<AggregationNode>,
    /// Indices into `children`, pipelines after everything they read
    pub evaluation_order: Vec<usize>,
    pub where_clause: Option<String>,
    /// SQL columns this node adds at its own level
    pub select_columns: usize,
}

impl AggregationNode {
    pub fn new(name: impl Into<String>, kind: AggregationKind) -> Self {
        let select_columns = match &kind {
            AggregationKind::Bucket(b) => match b.branches() {
                Some(branches) => branches.len(),
                None => usize::from(b.key_sql().is_some()) + 1,
            },
            AggregationKind::Metric(m) => m.aggregate_columns(None).len(),
            AggregationKind::Pipeline(_) => 0,
        };
        Self {
            name: name.into(),
            kind,
            children: Vec::new(),
            evaluation_order: Vec::new(),
            where_clause: None,
            select_columns,
        }
    }

    pub fn with_children(mut self, children: Vec<AggregationNode>, evaluation_order: Vec<usize>) -> Self {
        self.children = children;
        self.evaluation_order = evaluation_order;
        self
    }

    pub fn with_where(mut self, predicate: Option<String>) -> Self {
        self.where_clause = predicate;
        self
    }

    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            AggregationKind::Bucket(b) => b.type_name(),
            AggregationKind::Metric(m) => m.type_name(),
            AggregationKind::Pipeline(p) => p.function.type_name(),
        }
    }

    pub fn bucket(&self) -> Option<&BucketAggregation> {
        match &self.kind {
            AggregationKind::Bucket(b) => Some(b),
            _ => None,
        }
    }

    pub fn metric(&self) -> Option<&MetricAggregation> {
        match &self.kind {
            AggregationKind::Metric(m) => Some(m),
            _ => None,
        }
    }

    pub fn pipeline(&self) -> Option<&PipelineAggregation> {
        match &self.kind {
            AggregationKind::Pipeline(p) => Some(p),
            _ => None,
        }
    }

    pub fn is_pipeline(&self) -> bool {
        matches!(self.kind, AggregationKind::Pipeline(_))
    }

    pub fn is_multi_bucket(&self) -> bool {
        self.bucket().is_some_and(|b| b.is_multi_bucket())
    }

    pub fn child(&self, name: &str) -> Option<(usize, &AggregationNode)> {
        find_child(&self.children, name)
    }
}

pub fn find_child<'a>(nodes: &'a [AggregationNode], name: &str) -> Option<(usize, &'a AggregationNode)> {
    nodes.iter().enumerate().find(|(_, n)| n.name == name)
}

/// The compiled top level of a request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregationTree {
    pub aggregations: Vec<AggregationNode>,
    pub evaluation_order: Vec<usize>,
}

impl AggregationTree {
    pub fn is_empty(&self) -> bool {
        self.aggregations.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.aggregations.iter().map(|n| n.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, t: FieldType) -> FieldRef {
        FieldRef::new(name, Some(t))
    }

    #[test]
    fn test_value_sql_casts() {
        assert_eq!(field("ok", FieldType::Boolean).value_sql(), "toInt8(\"ok\")");
        assert_eq!(
            field("ts", FieldType::Timestamp).value_sql(),
            "toUnixTimestamp64Milli(\"ts\")"
        );
        assert_eq!(
            field("d", FieldType::Date).value_sql(),
            "toInt64(toUnixTimestamp(\"d\") * 1000)"
        );
        assert_eq!(FieldRef::new("x", None).value_sql(), "\"x\"");
    }

    #[test]
    fn test_histogram_key() {
        let mut params = HistogramParams {
            field: field("x", FieldType::Long),
            interval: 1.0,
            min_doc_count: 0,
            extended_bounds: None,
        };
        assert_eq!(params.key_sql(), "\"x\"");
        params.interval = 2.5;
        assert_eq!(params.key_sql(), "floor(\"x\" / 2.5) * 2.5");
        params.field = field("f", FieldType::Float);
        params.interval = 1.0;
        assert_eq!(params.key_sql(), "floor(\"f\" / 1) * 1");
    }

    #[test]
    fn test_date_histogram_key() {
        let fixed = DateHistogramParams {
            field: field("ts", FieldType::Timestamp),
            interval: DateInterval::Fixed { millis: 60_000 },
            min_doc_count: 0,
            extended_bounds: None,
        };
        assert_eq!(fixed.key_sql(), "intDiv(toUnixTimestamp64Milli(\"ts\"), 60000)");
        assert_eq!(fixed.key_millis(2), 120_000);

        let monthly = DateHistogramParams {
            interval: DateInterval::Calendar(CalendarUnit::Month),
            ..fixed
        };
        assert_eq!(
            monthly.key_sql(),
            "toInt64(toUnixTimestamp(toStartOfMonth(\"ts\")))"
        );
        assert_eq!(monthly.key_millis(1_700_000_000), 1_700_000_000_000);
    }

    #[test]
    fn test_metric_columns() {
        let avg = MetricAggregation::Single {
            function: SingleValueMetric::Avg,
            field: field("x", FieldType::Float),
        };
        assert_eq!(avg.aggregate_columns(None), vec!["avgOrNull(\"x\")"]);
        assert_eq!(
            avg.aggregate_columns(Some("\"y\" = 1")),
            vec!["avgOrNullIf(\"x\", \"y\" = 1)"]
        );

        let stats = MetricAggregation::Stats {
            field: field("x", FieldType::Long),
        };
        let columns = stats.aggregate_columns(None);
        let labels: Vec<_> = columns.iter().map(|c| stats_label(c)).collect();
        assert_eq!(labels, STATS_VALUES.to_vec());
        let conditional = stats.aggregate_columns(Some("c"));
        assert_eq!(stats_label(&conditional[3]), "avg");
    }

    #[test]
    fn test_select_columns() {
        let terms = AggregationNode::new(
            "t",
            AggregationKind::Bucket(BucketAggregation::Terms(TermsParams {
                field: field("k", FieldType::Keyword),
                size: 10,
                order: TermsOrder::Count(SortDirection::Desc),
            })),
        );
        assert_eq!(terms.select_columns, 2);
        let filter = AggregationNode::new("f", AggregationKind::Bucket(BucketAggregation::Filter));
        assert_eq!(filter.select_columns, 1);
        assert!(!filter.is_multi_bucket());
    }

    #[test]
    fn test_date_bound_local_resolution() {
        let now = DateTime::parse_from_rfc3339("2024-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let bound = DateBound {
            sql: String::new(),
            source: DateBoundSource::Text("2024-01-01".into()),
        };
        assert_eq!(bound.local_millis(now), Some(1_704_067_200_000));
        let bound = DateBound {
            sql: String::new(),
            source: DateBoundSource::Math(crate::query::date_math::parse("now/d").unwrap()),
        };
        assert_eq!(bound.local_millis(now), Some(1_704_153_600_000));
    }
}
