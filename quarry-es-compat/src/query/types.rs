//! Elasticsearch Query DSL and aggregation parameter types
//!
//! Aggregation trees are walked as ordered JSON so sibling order survives;
//! each aggregation's own parameters are then decoded into the structs below.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// The parts of a search body the aggregation engine reads
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SearchBody {
    #[serde(default)]
    pub query: Option<EsQuery>,

    /// Kept as an ordered JSON object, key order is significant
    #[serde(default, alias = "aggregations")]
    pub aggs: Option<Map<String, Value>>,

    #[serde(default)]
    pub size: Option<usize>,
}

/// ES Query types
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EsQuery {
    MatchAll(MatchAllQuery),
    MatchNone(MatchAllQuery),
    Match(BTreeMap<String, MatchQuery>),
    MatchPhrase(BTreeMap<String, MatchQuery>),
    MultiMatch(MultiMatchQuery),
    Term(BTreeMap<String, TermValue>),
    Terms(BTreeMap<String, Vec<Value>>),
    Range(BTreeMap<String, RangeParams>),
    Bool(BoolQuery),
    Exists(ExistsQuery),
    QueryString(QueryStringQuery),
    SimpleQueryString(QueryStringQuery),
    Wildcard(BTreeMap<String, PatternParams>),
    Prefix(BTreeMap<String, PatternParams>),
    Ids(IdsQuery),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MatchAllQuery {
    #[serde(default)]
    pub boost: Option<f32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MatchQuery {
    Object {
        query: Value,
        #[serde(default)]
        operator: Option<String>,
        #[serde(default)]
        boost: Option<f32>,
    },
    Simple(Value),
}

impl MatchQuery {
    pub fn query(&self) -> &Value {
        match self {
            MatchQuery::Simple(v) => v,
            MatchQuery::Object { query, .. } => query,
        }
    }

    pub fn operator(&self) -> Option<&str> {
        match self {
            MatchQuery::Simple(_) => None,
            MatchQuery::Object { operator, .. } => operator.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MultiMatchQuery {
    pub query: String,
    #[serde(default)]
    pub fields: Option<Vec<String>>,
    #[serde(default, rename = "type")]
    pub match_type: Option<String>,
    #[serde(default)]
    pub operator: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TermValue {
    Object {
        value: Value,
        #[serde(default)]
        boost: Option<f32>,
    },
    Simple(Value),
}

impl TermValue {
    pub fn value(&self) -> &Value {
        match self {
            TermValue::Object { value, .. } => value,
            TermValue::Simple(v) => v,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RangeParams {
    #[serde(default)]
    pub gte: Option<Value>,
    #[serde(default)]
    pub gt: Option<Value>,
    #[serde(default)]
    pub lte: Option<Value>,
    #[serde(default)]
    pub lt: Option<Value>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub time_zone: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BoolQuery {
    #[serde(default)]
    pub must: Option<QueryList>,
    #[serde(default)]
    pub should: Option<QueryList>,
    #[serde(default)]
    pub must_not: Option<QueryList>,
    #[serde(default)]
    pub filter: Option<QueryList>,
    #[serde(default)]
    pub minimum_should_match: Option<MinimumShouldMatch>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum QueryList {
    Single(Box<EsQuery>),
    Multiple(Vec<EsQuery>),
}

impl QueryList {
    pub fn as_slice(&self) -> &[EsQuery] {
        match self {
            QueryList::Single(q) => std::slice::from_ref(q.as_ref()),
            QueryList::Multiple(v) => v,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MinimumShouldMatch {
    Number(i64),
    Text(String),
}

impl MinimumShouldMatch {
    /// Resolve against the number of optional clauses
    pub fn resolve(&self, clauses: usize) -> usize {
        let clauses_i = clauses as i64;
        let n = match self {
            MinimumShouldMatch::Number(n) => *n,
            MinimumShouldMatch::Text(s) => match s.trim().strip_suffix('%') {
                Some(pct) => pct
                    .trim()
                    .parse::<i64>()
                    .map(|p| clauses_i * p / 100)
                    .unwrap_or(1),
                None => s.trim().parse::<i64>().unwrap_or(1),
            },
        };
        let n = if n < 0 { clauses_i + n } else { n };
        n.clamp(0, clauses_i) as usize
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExistsQuery {
    pub field: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueryStringQuery {
    pub query: String,
    #[serde(default)]
    pub default_field: Option<String>,
    #[serde(default)]
    pub fields: Option<Vec<String>>,
    #[serde(default)]
    pub default_operator: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum PatternParams {
    Simple(String),
    Object {
        value: String,
        #[serde(default)]
        case_insensitive: Option<bool>,
    },
}

impl PatternParams {
    pub fn value(&self) -> &str {
        match self {
            PatternParams::Simple(s) => s,
            PatternParams::Object { value, .. } => value,
        }
    }

    pub fn case_insensitive(&self) -> bool {
        matches!(
            self,
            PatternParams::Object {
                case_insensitive: Some(true),
                ..
            }
        )
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IdsQuery {
    pub values: Vec<String>,
}

// ---------------------------------------------------------------------------
// Aggregation parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FieldAgg {
    pub field: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PercentilesAgg {
    pub field: String,
    #[serde(default)]
    pub percents: Option<Vec<f64>>,
    #[serde(default)]
    pub keyed: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TermsAgg {
    pub field: String,
    #[serde(default)]
    pub size: Option<usize>,
    /// `{"_count": "desc"}`, `{"_key": "asc"}`, `{"<metric>": "desc"}` or a list of those
    #[serde(default)]
    pub order: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HistogramAgg {
    pub field: String,
    pub interval: f64,
    #[serde(default)]
    pub min_doc_count: Option<u64>,
    #[serde(default)]
    pub extended_bounds: Option<ExtendedBounds>,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct ExtendedBounds {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DateHistogramAgg {
    pub field: String,
    #[serde(default)]
    pub fixed_interval: Option<String>,
    #[serde(default)]
    pub calendar_interval: Option<String>,
    /// Pre-7.x spelling, either kind of interval
    #[serde(default)]
    pub interval: Option<String>,
    #[serde(default)]
    pub min_doc_count: Option<u64>,
    #[serde(default)]
    pub extended_bounds: Option<DateExtendedBounds>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub time_zone: Option<String>,
}

/// Bounds in epoch milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct DateExtendedBounds {
    pub min: i64,
    pub max: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RangeAgg {
    pub field: String,
    pub ranges: Vec<RangeBucket>,
    #[serde(default)]
    pub keyed: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RangeBucket {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub from: Option<f64>,
    #[serde(default)]
    pub to: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DateRangeAgg {
    pub field: String,
    pub ranges: Vec<DateRangeBucket>,
    #[serde(default)]
    pub keyed: Option<bool>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub time_zone: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DateRangeBucket {
    #[serde(default)]
    pub key: Option<String>,
    /// Date math, a date string or epoch millis
    #[serde(default)]
    pub from: Option<Value>,
    #[serde(default)]
    pub to: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FiltersAgg {
    pub filters: FiltersSpec,
    #[serde(default)]
    pub other_bucket: Option<bool>,
    #[serde(default)]
    pub other_bucket_key: Option<String>,
}

/// Named filters render as a keyed object, anonymous ones as an array.
/// Named filters are sorted by name, as Elasticsearch does.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum FiltersSpec {
    Keyed(BTreeMap<String, EsQuery>),
    Anonymous(Vec<EsQuery>),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TopHitsAgg {
    #[serde(default)]
    pub size: Option<usize>,
    #[serde(default)]
    pub sort: Option<Vec<SortClause>>,
    #[serde(default, rename = "_source")]
    pub source: Option<SourceFilter>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TopMetricsAgg {
    pub metrics: MetricFields,
    pub sort: SortClause,
    #[serde(default)]
    pub size: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MetricFields {
    One(FieldAgg),
    Many(Vec<FieldAgg>),
}

impl MetricFields {
    pub fn fields(&self) -> Vec<String> {
        match self {
            MetricFields::One(f) => vec![f.field.clone()],
            MetricFields::Many(fs) => fs.iter().map(|f| f.field.clone()).collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SortClause {
    Field(String),
    Object(BTreeMap<String, SortOrder>),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SortOrder {
    Simple(String),
    Object { order: String },
}

impl SortOrder {
    pub fn order(&self) -> &str {
        match self {
            SortOrder::Simple(s) => s,
            SortOrder::Object { order } => order,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SourceFilter {
    Bool(bool),
    Fields(Vec<String>),
    Object {
        #[serde(default)]
        includes: Option<Vec<String>>,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BucketsPathAgg {
    pub buckets_path: String,
    #[serde(default)]
    pub gap_policy: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BucketScriptAgg {
    pub buckets_path: BTreeMap<String, String>,
    pub script: ScriptSpec,
    #[serde(default)]
    pub gap_policy: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ScriptSpec {
    Inline(String),
    Object {
        #[serde(default, alias = "inline")]
        source: Option<String>,
        #[serde(default)]
        lang: Option<String>,
    },
}

impl ScriptSpec {
    pub fn source(&self) -> Option<&str> {
        match self {
            ScriptSpec::Inline(s) => Some(s),
            ScriptSpec::Object { source, .. } => source.as_deref(),
        }
    }
}
