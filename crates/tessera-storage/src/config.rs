//! Unified configuration for Tessera.
//!
//! This module provides centralized configuration management with support for:
//! - Default values (embedded in binary)
//! - Configuration files (TOML format)
//! - Environment variable overrides (prefix: `TESSERA__`)
//!
//! # Environment Variables
//!
//! Configuration can be overridden using environment variables with the `TESSERA__` prefix:
//! - `TESSERA__DISPATCH__MAX_WORKERS=16`
//! - `TESSERA__DISPATCH__DEFAULT_TIMEOUT_MS=2000`
//! - `TESSERA__LAYOUT__DEFAULT_STORAGE=dense`
//! - `TESSERA__LOGGING__LEVEL=debug`
//!
//! # Example
//!
//! ```ignore
//! use tessera_storage::config::TesseraConfig;
//!
//! // Load from file with env overrides
//! let config = TesseraConfig::load(Some("tessera.toml")).unwrap();
//! println!("Workers: {}", config.dispatch.max_workers);
//! ```

use crate::vector::StorageKind;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const ENV_PREFIX: &str = "TESSERA__";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TesseraConfig {
    /// Worker pool and deadlines
    pub dispatch: DispatchConfig,
    /// Partition layout defaults
    pub layout: LayoutConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl TesseraConfig {
    /// Loads configuration from an optional file path with environment variable overrides.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (TESSERA__*)
    /// 2. Configuration file (if provided and present)
    /// 3. Built-in defaults
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(file_path) = path {
            if Path::new(file_path).exists() {
                let contents = std::fs::read_to_string(file_path)?;
                config = toml::from_str(&contents)?;
            }
        }

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(format!("{ENV_PREFIX}{key}")).ok());
    }

    /// Applies overrides from a lookup keyed by `SECTION__KEY`.
    ///
    /// Values that fail to parse are ignored and the previous value is kept.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        // Dispatch overrides
        if let Some(v) = lookup("DISPATCH__MAX_WORKERS").and_then(|v| v.parse().ok()) {
            self.dispatch.max_workers = v;
        }
        if let Some(val) = lookup("DISPATCH__DEFAULT_TIMEOUT_MS") {
            if val.is_empty() || val == "none" {
                self.dispatch.default_timeout_ms = None;
            } else if let Ok(v) = val.parse() {
                self.dispatch.default_timeout_ms = Some(v);
            }
        }
        if let Some(val) = lookup("DISPATCH__THREAD_NAME") {
            self.dispatch.thread_name = val;
        }

        // Layout overrides
        if let Some(val) = lookup("LAYOUT__DEFAULT_STORAGE") {
            match val.to_lowercase().as_str() {
                "dense" => self.layout.default_storage = StorageKind::Dense,
                "sparse" => self.layout.default_storage = StorageKind::Sparse,
                "sorted_sparse" => self.layout.default_storage = StorageKind::SortedSparse,
                _ => {}
            }
        }
        if let Some(v) = lookup("LAYOUT__DEFAULT_PARTITIONS").and_then(|v| v.parse().ok()) {
            self.layout.default_partitions = v;
        }

        // Logging overrides
        if let Some(val) = lookup("LOGGING__LEVEL") {
            self.logging.level = val;
        }
        if let Some(val) = lookup("LOGGING__JSON") {
            self.logging.json = val.to_lowercase() == "true" || val == "1";
        }
    }

    /// Serializes the configuration to TOML format.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

/// Dispatch configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum sub-requests executing at once
    pub max_workers: usize,
    /// Deadline applied by `dispatch` when none is given (None = wait forever)
    pub default_timeout_ms: Option<u64>,
    /// Name prefix of the worker threads of an owned runtime
    pub thread_name: String,
}

impl DispatchConfig {
    /// Returns the default deadline as a `Duration`.
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            default_timeout_ms: None,
            thread_name: "tessera-worker".to_string(),
        }
    }
}

/// Partition layout configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// Physical storage allocated for new partitions
    pub default_storage: StorageKind,
    /// Column blocks used when a layout is built uniformly
    pub default_partitions: u64,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            default_storage: StorageKind::Sparse,
            default_partitions: 4,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Use JSON format for log output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = TesseraConfig::default();
        assert!(config.dispatch.max_workers >= 1);
        assert!(config.dispatch.default_timeout_ms.is_none());
        assert_eq!(config.layout.default_storage, StorageKind::Sparse);
        assert_eq!(config.layout.default_partitions, 4);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = TesseraConfig::load(Some("/nonexistent/tessera.toml")).unwrap();
        assert_eq!(config.layout, LayoutConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [dispatch]
            max_workers = 3
            default_timeout_ms = 250

            [layout]
            default_storage = "sorted_sparse"
            "#
        )
        .unwrap();

        let path = file.path().to_str().unwrap();
        let config = TesseraConfig::load(Some(path)).unwrap();
        assert_eq!(config.dispatch.max_workers, 3);
        assert_eq!(
            config.dispatch.default_timeout(),
            Some(Duration::from_millis(250))
        );
        assert_eq!(config.layout.default_storage, StorageKind::SortedSparse);
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[dispatch\nmax_workers = ").unwrap();
        let path = file.path().to_str().unwrap();
        assert!(matches!(
            TesseraConfig::load(Some(path)),
            Err(ConfigError::Parse(_))
        ));
    }

    // Overrides go through a lookup closure so tests don't race on process env.
    #[test]
    fn test_override_mechanism() {
        let vars: HashMap<&str, &str> = [
            ("DISPATCH__MAX_WORKERS", "16"),
            ("DISPATCH__DEFAULT_TIMEOUT_MS", "2000"),
            ("LAYOUT__DEFAULT_STORAGE", "dense"),
            ("LAYOUT__DEFAULT_PARTITIONS", "not-a-number"),
            ("LOGGING__JSON", "1"),
        ]
        .into_iter()
        .collect();

        let mut config = TesseraConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.dispatch.max_workers, 16);
        assert_eq!(config.dispatch.default_timeout_ms, Some(2000));
        assert_eq!(config.layout.default_storage, StorageKind::Dense);
        assert_eq!(config.layout.default_partitions, 4);
        assert!(config.logging.json);
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = TesseraConfig::default();
        config.dispatch.default_timeout_ms = Some(500);
        let toml_str = config.to_toml().unwrap();

        assert!(toml_str.contains("[dispatch]"));
        assert!(toml_str.contains("[layout]"));
        assert!(toml_str.contains("[logging]"));

        let parsed: TesseraConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }
}
