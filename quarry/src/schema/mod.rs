//! Read-only table schema lookup
//!
//! The aggregation compiler asks this module two things about a field: which
//! SQL casts it needs and whether it may be aggregated at all. Schemas come
//! from a YAML file or are registered programmatically; ingestion and schema
//! evolution live elsewhere.

mod types;

pub use types::FieldType;

use crate::error::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// One column as the compiler sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: String,
    pub field_type: FieldType,
    pub aggregatable: bool,
    pub searchable: bool,
}

impl FieldInfo {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            aggregatable: field_type.is_aggregatable(),
            searchable: field_type.is_searchable(),
            field_type,
        }
    }
}

/// Field lookup used while compiling aggregations
pub trait SchemaLookup: Send + Sync {
    /// Look up a single field, `None` when the table or field is unknown
    fn field(&self, table: &str, field: &str) -> Option<FieldInfo>;

    /// All fields of a table in declaration order
    fn fields(&self, table: &str) -> Vec<FieldInfo>;
}

/// Schema of a single table, fields kept in declaration order
#[derive(Debug, Clone, Default)]
pub struct TableSchema {
    pub name: String,
    fields: Vec<FieldInfo>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, field: FieldInfo) -> Self {
        self.add_field(field);
        self
    }

    pub fn add_field(&mut self, field: FieldInfo) {
        match self.fields.iter_mut().find(|f| f.name == field.name) {
            Some(existing) => *existing = field,
            None => self.fields.push(field),
        }
    }

    pub fn get(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn fields(&self) -> &[FieldInfo] {
        &self.fields
    }
}

/// YAML schema file
///
/// ```yaml
/// tables:
///   - name: logs-generic-default
///     fields:
///       - { name: timestamp, type: "DateTime64(3)" }
///       - { name: message, type: text }
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchemaFile {
    #[serde(default)]
    pub tables: Vec<TableDefinition>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TableDefinition {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FieldDefinition {
    pub name: String,
    /// Either a quarry type name (`keyword`, `long`, ...) or a ClickHouse
    /// column type (`LowCardinality(String)`, `DateTime64(3)`, ...)
    #[serde(rename = "type")]
    pub field_type: String,
    /// Overrides the type's default aggregatable flag
    #[serde(default)]
    pub aggregatable: Option<bool>,
}

impl FieldDefinition {
    fn into_field_info(self) -> Result<FieldInfo> {
        let field_type = FieldType::parse(&self.field_type)
            .or_else(|| FieldType::from_clickhouse(&self.field_type))
            .ok_or_else(|| {
                Error::Schema(format!(
                    "unsupported type '{}' for field '{}'",
                    self.field_type, self.name
                ))
            })?;
        let mut info = FieldInfo::new(self.name, field_type);
        if let Some(aggregatable) = self.aggregatable {
            info.aggregatable = aggregatable;
        }
        Ok(info)
    }
}

/// In-memory schema registry
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    tables: RwLock<HashMap<String, TableSchema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a registry from a YAML schema file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let file: SchemaFile = serde_yaml::from_str(yaml)?;
        let registry = Self::new();
        for table in file.tables {
            let mut schema = TableSchema::new(&table.name);
            for field in table.fields {
                schema.add_field(field.into_field_info()?);
            }
            tracing::debug!(
                "Loaded schema for table {} ({} fields)",
                schema.name,
                schema.fields().len()
            );
            registry.register(schema);
        }
        Ok(registry)
    }

    /// Add or replace a table schema
    pub fn register(&self, schema: TableSchema) {
        self.tables.write().insert(schema.name.clone(), schema);
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains_table(&self, table: &str) -> bool {
        self.tables.read().contains_key(table)
    }
}

impl SchemaLookup for SchemaRegistry {
    fn field(&self, table: &str, field: &str) -> Option<FieldInfo> {
        let tables = self.tables.read();
        let schema = tables.get(table)?;
        if let Some(info) = schema.get(field) {
            return Some(info.clone());
        }
        // Kibana addresses keyword sub-fields as `name.keyword`
        let base = field.strip_suffix(".keyword")?;
        schema.get(base).map(|info| FieldInfo {
            aggregatable: true,
            field_type: if info.field_type == FieldType::Text {
                FieldType::Keyword
            } else {
                info.field_type
            },
            ..info.clone()
        })
    }

    fn fields(&self, table: &str) -> Vec<FieldInfo> {
        self.tables
            .read()
            .get(table)
            .map(|s| s.fields().to_vec())
            .unwrap_or_default()
    }
}
