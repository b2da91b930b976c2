//! Error types for the aggregation layer
//!
//! Compile and plan errors are local to one aggregation subtree and end up as
//! response warnings. Reconstruction errors mean the planner and the
//! reconstructor disagree about a statement's shape and fail the request.

use crate::query::date_math::DateMathError;

/// Problems found while compiling one aggregation or query
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    #[error("Unsupported aggregation type '{agg_type}': {reason}")]
    UnsupportedAggregationType { agg_type: String, reason: String },

    #[error("Malformed aggregation '{name}': {reason}")]
    MalformedAggregation { name: String, reason: String },

    #[error("No aggregation named '{segment}' is visible from buckets_path '{path}'")]
    UnresolvedBucketsPath { path: String, segment: String },

    #[error("Invalid date math: {0}")]
    DateMath(#[from] DateMathError),

    #[error("Pipeline aggregations form a cycle: {}", .0.join(" -> "))]
    PipelineCycle(Vec<String>),

    #[error("Pipeline aggregation '{name}' {reason}")]
    InvalidPipelinePlacement { name: String, reason: String },

    #[error("Field '{0}' is not aggregatable")]
    FieldNotAggregatable(String),

    #[error("Unsupported query type: {0}")]
    UnsupportedQueryType(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid script: {0}")]
    Script(String),
}

impl CompileError {
    pub fn malformed(name: &str, reason: impl Into<String>) -> Self {
        Self::MalformedAggregation {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// Label used for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            Self::UnsupportedAggregationType { .. } => "unsupported_type",
            Self::MalformedAggregation { .. } => "malformed",
            Self::UnresolvedBucketsPath { .. } => "unresolved_buckets_path",
            Self::DateMath(_) => "date_math",
            Self::PipelineCycle(_) => "pipeline_cycle",
            Self::InvalidPipelinePlacement { .. } => "pipeline_placement",
            Self::FieldNotAggregatable(_) => "field_not_aggregatable",
            Self::UnsupportedQueryType(_) => "unsupported_query",
            Self::InvalidQuery(_) => "invalid_query",
            Self::Script(_) => "script",
        }
    }
}

/// A merge precondition did not hold; the planner splits the node instead
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanError {
    #[error("Cannot merge branches of '{name}': {reason}")]
    MergePrecondition { name: String, reason: String },
}

/// Results do not line up with the plan
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReconstructionError {
    #[error("Statement {statement} returned {actual} columns, plan expects {expected}")]
    ColumnCountMismatch {
        statement: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Plan has {planned} statements but {executed} results were supplied")]
    ResultCountMismatch { planned: usize, executed: usize },

    #[error("No statement planned for aggregation '{0}'")]
    MissingStatement(String),
}

/// Errors surfaced by the aggregation engine
#[derive(Debug, thiserror::Error)]
pub enum EsCompatError {
    #[error("Invalid request body: {0}")]
    InvalidRequestBody(String),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("Reconstruction failed: {0}")]
    Reconstruction(#[from] ReconstructionError),

    #[error("quarry error: {0}")]
    Quarry(#[from] quarry::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EsCompatError {
    /// Elasticsearch exception type for this error
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidRequestBody(_) => "parse_exception",
            Self::Compile(CompileError::UnsupportedQueryType(_)) => "parsing_exception",
            Self::Compile(CompileError::InvalidQuery(_)) => "query_shard_exception",
            Self::Compile(_) => "aggregation_execution_exception",
            Self::Reconstruction(_) | Self::Quarry(_) => "search_phase_execution_exception",
            Self::Internal(_) => "internal_server_error",
        }
    }
}
