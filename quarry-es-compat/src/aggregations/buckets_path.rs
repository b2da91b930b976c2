//! buckets_path resolution
//!
//! A path walks from the pipeline's level down through `>` separated
//! aggregation names. The last segment may select a value of a
//! multi-value metric (`stats.avg`, `percentiles[99.0]`) or the special
//! `_count`. Paths are resolved once at compile time against the names
//! visible at the pipeline's level.

use crate::aggregations::node::{match_value_name, AggregationKind, AggregationNode};
use crate::error::CompileError;

/// Which value at the end of a path is read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathValue {
    /// The aggregation's single value
    Default,
    /// `_count` of a bucket
    Count,
    /// A named value of a multi-value metric
    Metric(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketsPathReference {
    /// `_count` of the current bucket
    SpecialCount,
    Named { path: Vec<String>, value: PathValue },
}

impl BucketsPathReference {
    pub fn first_segment(&self) -> Option<&str> {
        match self {
            BucketsPathReference::SpecialCount => None,
            BucketsPathReference::Named { path, .. } => path.first().map(String::as_str),
        }
    }

    /// The same reference seen from inside the first segment's buckets.
    /// `None` when nothing selectable is left.
    pub fn descend(&self) -> Option<BucketsPathReference> {
        match self {
            BucketsPathReference::SpecialCount => None,
            BucketsPathReference::Named { path, value } => {
                if path.len() > 1 {
                    Some(BucketsPathReference::Named {
                        path: path[1..].to_vec(),
                        value: value.clone(),
                    })
                } else if *value == PathValue::Count {
                    Some(BucketsPathReference::SpecialCount)
                } else {
                    None
                }
            }
        }
    }
}

/// An aggregation name visible to a path, with what lies beneath it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeEntry {
    pub name: String,
    pub multi_bucket: bool,
    pub bucket: bool,
    pub pipeline: bool,
    /// Selectable values of a metric
    pub value_names: Vec<String>,
    pub children: Vec<ScopeEntry>,
}

impl ScopeEntry {
    pub fn from_node(node: &AggregationNode) -> Self {
        let (bucket, value_names) = match &node.kind {
            AggregationKind::Bucket(_) => (true, Vec::new()),
            AggregationKind::Metric(m) => (false, m.value_names()),
            AggregationKind::Pipeline(_) => (false, vec!["value".to_string()]),
        };
        Self {
            name: node.name.clone(),
            multi_bucket: node.is_multi_bucket(),
            bucket,
            pipeline: node.is_pipeline(),
            value_names,
            children: node.children.iter().map(ScopeEntry::from_node).collect(),
        }
    }

    /// A pipeline sibling that has not been resolved yet
    pub fn pending_pipeline(name: &str) -> Self {
        Self {
            name: name.to_string(),
            multi_bucket: false,
            bucket: false,
            pipeline: true,
            value_names: vec!["value".to_string()],
            children: Vec::new(),
        }
    }

    fn accepts_value(&self, name: &str) -> bool {
        match_value_name(&self.value_names, name).is_some()
    }
}

pub fn resolve(path: &str, scope: &[ScopeEntry]) -> Result<BucketsPathReference, CompileError> {
    let path = path.trim();
    if path == "_count" {
        return Ok(BucketsPathReference::SpecialCount);
    }
    let unresolved = |segment: &str| CompileError::UnresolvedBucketsPath {
        path: path.to_string(),
        segment: segment.to_string(),
    };

    let segments: Vec<&str> = path.split('>').map(str::trim).collect();
    let Some((last, intermediate)) = segments.split_last() else {
        return Err(unresolved(path));
    };

    let mut names = Vec::with_capacity(segments.len());
    let mut level = scope;
    for segment in intermediate {
        let entry = level
            .iter()
            .find(|e| e.name == *segment)
            .ok_or_else(|| unresolved(segment))?;
        if !entry.bucket {
            return Err(unresolved(segment));
        }
        names.push(segment.to_string());
        level = &entry.children;
    }

    if *last == "_count" {
        if names.is_empty() {
            return Err(unresolved(last));
        }
        return Ok(BucketsPathReference::Named {
            path: names,
            value: PathValue::Count,
        });
    }

    if let Some(entry) = level.iter().find(|e| e.name == *last) {
        names.push(entry.name.clone());
        let value = if entry.bucket {
            PathValue::Count
        } else {
            PathValue::Default
        };
        return Ok(BucketsPathReference::Named { path: names, value });
    }

    let (name, value) = split_value_selector(last).ok_or_else(|| unresolved(last))?;
    let entry = level
        .iter()
        .find(|e| e.name == name)
        .ok_or_else(|| unresolved(name))?;
    if entry.bucket || !entry.accepts_value(value) {
        return Err(unresolved(last));
    }
    names.push(name.to_string());
    let value = if entry.value_names.len() == 1 {
        PathValue::Default
    } else {
        PathValue::Metric(value.to_string())
    };
    Ok(BucketsPathReference::Named { path: names, value })
}

/// `stats.avg` or `percentiles[99.9]` into name and value
pub(crate) fn split_value_selector(segment: &str) -> Option<(&str, &str)> {
    if let Some(open) = segment.find('[') {
        let value = segment[open + 1..].strip_suffix(']')?;
        return Some((&segment[..open], value.trim_matches(|c| c == '\'' || c == '"')));
    }
    segment.split_once('.')
}
