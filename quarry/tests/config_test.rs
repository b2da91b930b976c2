//! Tests for config and schema files

use quarry::config::{expand_tilde, Config};
use quarry::schema::{FieldType, SchemaLookup, SchemaRegistry};
use std::path::PathBuf;
use tempfile::tempdir;

#[test]
fn test_default_config() {
    let config = Config::default();

    assert_eq!(config.engine.table, "logs-generic-default");
    assert_eq!(config.engine.max_concurrent_statements, 4);
    assert_eq!(config.engine.statement_timeout_ms, 30_000);
    assert!(config.schema.path.is_none());
    assert_eq!(config.logging.level, "info");
    assert_eq!(config.logging.format, "pretty");
}

#[test]
fn test_expand_tilde() {
    let home = dirs::home_dir().unwrap();

    let expanded = expand_tilde(&PathBuf::from("~/schema.yaml")).unwrap();
    assert_eq!(expanded, home.join("schema.yaml"));

    let expanded = expand_tilde(&PathBuf::from("/etc/quarry/schema.yaml")).unwrap();
    assert_eq!(expanded, PathBuf::from("/etc/quarry/schema.yaml"));
}

#[test]
fn test_save_and_load() {
    let temp = tempdir().unwrap();
    let config_path = temp.path().join("quarry.toml");

    let mut config = Config::default();
    config.engine.table = "nginx".to_string();
    config.engine.merge_conditional_buckets = false;
    config.logging.format = "json".to_string();
    config.save(&config_path).unwrap();

    let loaded = Config::load(&config_path).unwrap();
    assert_eq!(loaded.engine.table, "nginx");
    assert!(!loaded.engine.merge_conditional_buckets);
    assert_eq!(loaded.logging.format, "json");
}

#[test]
fn test_load_or_create_writes_defaults() {
    let temp = tempdir().unwrap();
    let config_path = temp.path().join("nested").join("quarry.toml");

    let config = Config::load_or_create(&config_path).unwrap();
    assert_eq!(config.engine.default_terms_size, 10);
    assert!(config_path.exists());
}

#[test]
fn test_invalid_config_is_rejected() {
    let temp = tempdir().unwrap();
    let config_path = temp.path().join("quarry.toml");
    std::fs::write(&config_path, "[engine]\ntable = \"\"\n").unwrap();

    assert!(Config::load(&config_path).is_err());
}

#[test]
fn test_schema_file_referenced_by_config() {
    let temp = tempdir().unwrap();
    let schema_path = temp.path().join("schema.yaml");
    std::fs::write(
        &schema_path,
        r#"
tables:
  - name: logs
    fields:
      - { name: ts, type: "DateTime64(3)" }
      - { name: host, type: "LowCardinality(String)" }
      - { name: message, type: text }
"#,
    )
    .unwrap();
    let config_path = temp.path().join("quarry.toml");
    std::fs::write(
        &config_path,
        format!("[schema]\npath = {:?}\n", schema_path.display().to_string()),
    )
    .unwrap();

    let config = Config::load(&config_path).unwrap();
    let registry = SchemaRegistry::from_file(config.schema.path.as_deref().unwrap()).unwrap();
    let message = registry.field("logs", "message").unwrap();
    assert_eq!(message.field_type, FieldType::Text);
    assert!(!message.aggregatable);
    assert!(registry.field("logs", "host").unwrap().aggregatable);
}
