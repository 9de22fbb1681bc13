use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use super::cli::CliConfig;
use super::constants::CONFIG_FILE_NAME;
use crate::domain::traces::StorageConfig;

// =============================================================================
// File Config (JSON)
// =============================================================================

/// Storage section of the config file
#[derive(Debug, Default, Clone, Deserialize)]
pub struct StorageFileConfig {
    pub strict_trace_id: Option<bool>,
    pub search_enabled: Option<bool>,
    pub bucket_count: Option<u32>,
    pub index_cache_max: Option<usize>,
    pub index_cache_ttl_secs: Option<u64>,
    pub index_fetch_multiplier: Option<usize>,
    pub max_trace_cols: Option<usize>,
    pub names_ttl_secs: Option<u64>,
    pub names_cardinality: Option<usize>,
    pub autocomplete_keys: Option<Vec<String>>,
    pub autocomplete_ttl_secs: Option<u64>,
    pub autocomplete_cardinality: Option<usize>,
    pub span_ttl_secs: Option<u64>,
    pub index_ttl_secs: Option<u64>,
}

/// File-based configuration (JSON)
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub storage: Option<StorageFileConfig>,
    #[serde(flatten)]
    pub extra: serde_json::Value,
}

impl FileConfig {
    /// Load configuration from a JSON file
    fn load_from_file(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "Loading config file");
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        tracing::trace!(config = ?config, "Parsed config file");
        Ok(config)
    }

    /// Warn about unknown fields in the config
    fn warn_unknown_fields(&self) {
        if let serde_json::Value::Object(map) = &self.extra
            && !map.is_empty()
        {
            let keys_str: String = map
                .keys()
                .map(|k| k.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            tracing::warn!(
                fields = %keys_str,
                "Unknown fields in config file (possible typos)"
            );
        }
    }
}

// =============================================================================
// App Config
// =============================================================================

/// Final merged application configuration
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub storage: StorageConfig,
    /// Config file that was applied, if any
    pub source: Option<PathBuf>,
}

impl AppConfig {
    /// Load configuration from all sources
    ///
    /// Priority (lowest to highest):
    /// 1. Defaults
    /// 2. Local directory config OR CLI-specified config path
    /// 3. CLI arguments (which include env var fallbacks via clap)
    pub fn load(cli: &CliConfig) -> Result<Self> {
        tracing::debug!("Loading application configuration");
        tracing::trace!(cli = ?cli, "CLI config");

        let path = match &cli.config {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("Config file not found: {}", path.display());
                }
                Some(path.clone())
            }
            None => {
                let local = PathBuf::from(CONFIG_FILE_NAME);
                local.exists().then_some(local)
            }
        };
        let file_config = match &path {
            Some(path) => {
                let config = FileConfig::load_from_file(path)?;
                config.warn_unknown_fields();
                config
            }
            None => FileConfig::default(),
        };

        let config = Self::layer(file_config, cli, path);
        config
            .storage
            .validate()
            .context("Configuration error in storage section")?;
        tracing::debug!(source = ?config.source, storage = ?config.storage, "Configuration loaded");
        Ok(config)
    }

    /// Layer configs: defaults -> file config -> CLI/env overrides
    fn layer(file_config: FileConfig, cli: &CliConfig, source: Option<PathBuf>) -> Self {
        let file = file_config.storage.unwrap_or_default();
        let defaults = StorageConfig::default();

        let storage = StorageConfig {
            strict_trace_id: cli
                .strict_trace_id
                .or(file.strict_trace_id)
                .unwrap_or(defaults.strict_trace_id),
            search_enabled: cli
                .search_enabled
                .or(file.search_enabled)
                .unwrap_or(defaults.search_enabled),
            bucket_count: cli
                .bucket_count
                .or(file.bucket_count)
                .unwrap_or(defaults.bucket_count),
            index_cache_max: cli
                .index_cache_max
                .or(file.index_cache_max)
                .unwrap_or(defaults.index_cache_max),
            index_cache_ttl_secs: cli
                .index_cache_ttl_secs
                .or(file.index_cache_ttl_secs)
                .unwrap_or(defaults.index_cache_ttl_secs),
            index_fetch_multiplier: cli
                .index_fetch_multiplier
                .or(file.index_fetch_multiplier)
                .unwrap_or(defaults.index_fetch_multiplier),
            max_trace_cols: file.max_trace_cols.unwrap_or(defaults.max_trace_cols),
            names_ttl_secs: file.names_ttl_secs.unwrap_or(defaults.names_ttl_secs),
            names_cardinality: file.names_cardinality.unwrap_or(defaults.names_cardinality),
            autocomplete_keys: cli
                .autocomplete_keys
                .clone()
                .or(file.autocomplete_keys)
                .unwrap_or(defaults.autocomplete_keys),
            autocomplete_ttl_secs: file
                .autocomplete_ttl_secs
                .unwrap_or(defaults.autocomplete_ttl_secs),
            autocomplete_cardinality: file
                .autocomplete_cardinality
                .unwrap_or(defaults.autocomplete_cardinality),
            span_ttl_secs: file.span_ttl_secs.unwrap_or(defaults.span_ttl_secs),
            index_ttl_secs: file.index_ttl_secs.unwrap_or(defaults.index_ttl_secs),
        };
        Self { storage, source }
    }
}
