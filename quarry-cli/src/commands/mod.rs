pub mod explain;
pub mod replay;

pub use explain::run_explain;
pub use replay::run_replay;

use anyhow::{Context, Result};
use quarry::schema::{SchemaLookup, SchemaRegistry};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

/// Schema from a YAML file, or an empty registry that knows no fields
pub(crate) fn load_schema(path: Option<&Path>) -> Result<Arc<dyn SchemaLookup>> {
    let registry = match path {
        Some(path) => SchemaRegistry::from_file(path)
            .with_context(|| format!("Failed to load schema from {:?}", path))?,
        None => {
            tracing::warn!("No schema configured, field types are unknown");
            SchemaRegistry::new()
        }
    };
    Ok(Arc::new(registry))
}

pub(crate) fn read_body(path: &Path) -> Result<Value> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("{:?} is not valid JSON", path))
}
