//! Configuration management for quarry
//!
//! Default config location: ./quarry.toml

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub schema: SchemaConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Aggregation engine settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Table queried when a request does not name one
    #[serde(default = "default_table")]
    pub table: String,
    /// Upper bound on statements in flight for one request
    #[serde(default = "default_max_concurrent_statements")]
    pub max_concurrent_statements: usize,
    /// Per-statement timeout in milliseconds, 0 disables it
    #[serde(default = "default_statement_timeout_ms")]
    pub statement_timeout_ms: u64,
    /// Collapse filters/range/date_range branches into one statement
    #[serde(default = "default_true")]
    pub merge_conditional_buckets: bool,
    /// `size` used by terms aggregations that do not set one
    #[serde(default = "default_terms_size")]
    pub default_terms_size: usize,
}

fn default_table() -> String {
    "logs-generic-default".to_string()
}

fn default_max_concurrent_statements() -> usize {
    4
}

fn default_statement_timeout_ms() -> u64 {
    30_000
}

fn default_terms_size() -> usize {
    10
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            table: default_table(),
            max_concurrent_statements: default_max_concurrent_statements(),
            statement_timeout_ms: default_statement_timeout_ms(),
            merge_conditional_buckets: default_true(),
            default_terms_size: default_terms_size(),
        }
    }
}

impl EngineConfig {
    /// Statement timeout, `None` when disabled
    pub fn statement_timeout(&self) -> Option<std::time::Duration> {
        (self.statement_timeout_ms > 0)
            .then(|| std::time::Duration::from_millis(self.statement_timeout_ms))
    }
}

/// Where table schemas come from
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct SchemaConfig {
    /// YAML schema file, see [`crate::schema::SchemaFile`]
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    /// Log output format: "pretty" or "json"
    #[serde(default = "default_format")]
    pub format: String,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: default_format(),
        }
    }
}

/// Expand `~` at the start of a path
pub fn expand_tilde(path: &Path) -> Result<PathBuf> {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        dirs::home_dir()
            .map(|h| h.join(rest))
            .ok_or_else(|| anyhow!("Cannot determine home directory"))
    } else if s == "~" {
        dirs::home_dir().ok_or_else(|| anyhow!("Cannot determine home directory"))
    } else {
        Ok(path.to_path_buf())
    }
}

impl Config {
    /// Load config from file path, or create default
    pub fn load_or_create(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            Self::load(config_path)
        } else {
            let config = Config::default();
            if let Some(parent) = config_path.parent() {
                let _ = fs::create_dir_all(parent);
            }
            let _ = config.save(config_path);
            Ok(config)
        }
    }

    /// Load config from an existing file
    pub fn load(config_path: &Path) -> Result<Self> {
        let content = fs::read_to_string(config_path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.expand_paths()?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    fn expand_paths(&mut self) -> Result<()> {
        if let Some(ref p) = self.schema.path {
            self.schema.path = Some(expand_tilde(p)?);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.engine.max_concurrent_statements == 0 {
            return Err(anyhow!("engine.max_concurrent_statements must be at least 1"));
        }
        if self.engine.table.trim().is_empty() {
            return Err(anyhow!("engine.table must not be empty"));
        }
        Ok(())
    }
}
