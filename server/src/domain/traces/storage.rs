//! Trace storage facade
//!
//! [`TraceStorage`] owns the process-wide caches for one keyspace and hands
//! out the write side ([`SpanConsumer`]) and read side ([`SpanStore`]). Schema
//! capabilities are probed once, on first use, and shared by both sides.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use super::autocomplete::AutocompleteTags;
use super::consumer::SpanConsumer;
use super::store::SpanStore;
use crate::core::constants::{
    DEFAULT_AUTOCOMPLETE_CARDINALITY, DEFAULT_AUTOCOMPLETE_TTL_SECS, DEFAULT_BUCKET_COUNT,
    DEFAULT_INDEX_CACHE_MAX, DEFAULT_INDEX_CACHE_TTL_SECS, DEFAULT_INDEX_FETCH_MULTIPLIER,
    DEFAULT_INDEX_TTL_SECS, DEFAULT_MAX_TRACE_COLS, DEFAULT_NAMES_CARDINALITY,
    DEFAULT_NAMES_TTL_SECS, DEFAULT_SPAN_TTL_SECS,
};
use crate::data::cache::RangeCache;
use crate::data::error::DataError;
use crate::data::schema::{self, Metadata};
use crate::data::session::{Session, Statement};

/// Storage behavior knobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Keep 128-bit trace ids apart even when their low 64 bits collide
    pub strict_trace_id: bool,
    /// Maintain and query the secondary indexes
    pub search_enabled: bool,
    pub bucket_count: u32,
    /// Range cache capacity, 0 disables gap widening
    pub index_cache_max: usize,
    pub index_cache_ttl_secs: u64,
    /// Index rows fetched per requested trace
    pub index_fetch_multiplier: usize,
    /// Span rows fetched per trace
    pub max_trace_cols: usize,
    pub names_ttl_secs: u64,
    pub names_cardinality: usize,
    pub autocomplete_keys: Vec<String>,
    pub autocomplete_ttl_secs: u64,
    pub autocomplete_cardinality: usize,
    /// Only used when the schema has no default TTL
    pub span_ttl_secs: u64,
    /// Only used when the schema has no default TTL
    pub index_ttl_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            strict_trace_id: true,
            search_enabled: true,
            bucket_count: DEFAULT_BUCKET_COUNT,
            index_cache_max: DEFAULT_INDEX_CACHE_MAX,
            index_cache_ttl_secs: DEFAULT_INDEX_CACHE_TTL_SECS,
            index_fetch_multiplier: DEFAULT_INDEX_FETCH_MULTIPLIER,
            max_trace_cols: DEFAULT_MAX_TRACE_COLS,
            names_ttl_secs: DEFAULT_NAMES_TTL_SECS,
            names_cardinality: DEFAULT_NAMES_CARDINALITY,
            autocomplete_keys: Vec::new(),
            autocomplete_ttl_secs: DEFAULT_AUTOCOMPLETE_TTL_SECS,
            autocomplete_cardinality: DEFAULT_AUTOCOMPLETE_CARDINALITY,
            span_ttl_secs: DEFAULT_SPAN_TTL_SECS,
            index_ttl_secs: DEFAULT_INDEX_TTL_SECS,
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<(), DataError> {
        let positive = [
            ("bucket_count", u64::from(self.bucket_count)),
            ("index_fetch_multiplier", self.index_fetch_multiplier as u64),
            ("max_trace_cols", self.max_trace_cols as u64),
            ("names_ttl_secs", self.names_ttl_secs),
            ("names_cardinality", self.names_cardinality as u64),
            ("autocomplete_ttl_secs", self.autocomplete_ttl_secs),
            ("autocomplete_cardinality", self.autocomplete_cardinality as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(DataError::invalid_argument(format!("{name} must be greater than 0")));
            }
        }
        if self.index_cache_max > 0 && self.index_cache_ttl_secs == 0 {
            return Err(DataError::invalid_argument(
                "index_cache_ttl_secs must be greater than 0 when the index cache is enabled",
            ));
        }
        Ok(())
    }
}

/// Write and read sides built for the probed schema
struct Components {
    metadata: Metadata,
    consumer: Arc<SpanConsumer>,
    store: SpanStore,
    autocomplete: AutocompleteTags,
}

/// Storage for one keyspace
pub struct TraceStorage {
    config: StorageConfig,
    session: Arc<dyn Session>,
    range_cache: Option<Arc<RangeCache>>,
    components: OnceCell<Components>,
    closed: AtomicBool,
}

impl std::fmt::Debug for TraceStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceStorage")
            .field("backend", &self.session.backend_name())
            .field("config", &self.config)
            .field("initialized", &self.components.initialized())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl TraceStorage {
    pub fn new(config: StorageConfig, session: Arc<dyn Session>) -> Result<Self, DataError> {
        config.validate()?;
        let range_cache = (config.search_enabled && config.index_cache_max > 0).then(|| {
            Arc::new(RangeCache::new(
                config.index_cache_max,
                Duration::from_secs(config.index_cache_ttl_secs),
            ))
        });
        Ok(Self {
            config,
            session,
            range_cache,
            components: OnceCell::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Schema capabilities, probing the keyspace on first use
    pub async fn metadata(&self) -> Result<Metadata, DataError> {
        Ok(self.components().await?.metadata)
    }

    pub async fn span_consumer(&self) -> Result<Arc<SpanConsumer>, DataError> {
        Ok(self.components().await?.consumer.clone())
    }

    pub async fn span_store(&self) -> Result<SpanStore, DataError> {
        Ok(self.components().await?.store.clone())
    }

    pub async fn autocomplete_tags(&self) -> Result<AutocompleteTags, DataError> {
        Ok(self.components().await?.autocomplete.clone())
    }

    /// Shared range cache, `None` when gap widening is disabled
    pub fn range_cache(&self) -> Option<&Arc<RangeCache>> {
        self.range_cache.as_ref()
    }

    /// Prove the keyspace is reachable by reading one span row
    pub async fn check(&self) -> Result<(), DataError> {
        self.ensure_open()?;
        self.session.execute(Statement::CheckTraces).await?;
        tracing::debug!(backend = self.session.backend_name(), "Storage check passed");
        Ok(())
    }

    /// Drop cached state. Later calls fail with [`DataError::Closed`].
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(cache) = &self.range_cache {
            cache.clear();
        }
        if let Some(components) = self.components.get() {
            components.consumer.clear_caches();
        }
        tracing::debug!(backend = self.session.backend_name(), "Trace storage closed");
    }

    fn ensure_open(&self) -> Result<(), DataError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DataError::Closed);
        }
        Ok(())
    }

    async fn components(&self) -> Result<&Components, DataError> {
        self.ensure_open()?;
        self.components
            .get_or_try_init(|| async {
                let metadata = schema::read_metadata(self.session.as_ref()).await?;
                let consumer = SpanConsumer::new(
                    self.session.clone(),
                    &self.config,
                    &metadata,
                    self.range_cache.clone(),
                )?;
                let store = SpanStore::new(self.session.clone(), &self.config, &metadata);
                let autocomplete = AutocompleteTags::new(
                    self.session.clone(),
                    self.config.autocomplete_keys.clone(),
                    metadata.has_autocomplete_tags,
                );
                tracing::debug!(
                    backend = self.session.backend_name(),
                    search_enabled = self.config.search_enabled,
                    gap_widening = self.range_cache.is_some(),
                    "Trace storage initialized"
                );
                Ok::<_, DataError>(Components {
                    metadata,
                    consumer: Arc::new(consumer),
                    store,
                    autocomplete,
                })
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::memory::MemorySession;
    use crate::data::schema::{AUTOCOMPLETE_TAGS, SERVICE_REMOTE_SERVICE_NAME_INDEX, SPAN_NAMES};

    #[test]
    fn test_config_validation() {
        assert!(StorageConfig::default().validate().is_ok());

        let config = StorageConfig {
            bucket_count: 0,
            ..StorageConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.to_string(), "Invalid argument: bucket_count must be greater than 0");

        let disabled_cache = StorageConfig {
            index_cache_max: 0,
            index_cache_ttl_secs: 0,
            ..StorageConfig::default()
        };
        assert!(disabled_cache.validate().is_ok());
    }

    #[test]
    fn test_config_from_partial_json() {
        let config: StorageConfig =
            serde_json::from_str(r#"{ "bucket_count": 4, "autocomplete_keys": ["env"] }"#).unwrap();
        assert_eq!(config.bucket_count, 4);
        assert_eq!(config.autocomplete_keys, vec!["env"]);
        assert_eq!(config.index_cache_max, DEFAULT_INDEX_CACHE_MAX);
    }

    #[tokio::test]
    async fn test_metadata_is_probed_once_and_degrades() {
        let session = MemorySession::builder()
            .without_table(SERVICE_REMOTE_SERVICE_NAME_INDEX)
            .without_table(AUTOCOMPLETE_TAGS)
            .build();
        let storage = TraceStorage::new(StorageConfig::default(), Arc::new(session)).unwrap();

        let metadata = storage.metadata().await.unwrap();
        assert!(!metadata.has_remote_service);
        assert!(!metadata.has_autocomplete_tags);
        let tags = storage.autocomplete_tags().await.unwrap();
        assert!(tags.get_keys().execute().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_core_table_fails() {
        let session = MemorySession::builder().without_table(SPAN_NAMES).build();
        let storage = TraceStorage::new(StorageConfig::default(), Arc::new(session)).unwrap();
        assert!(matches!(
            storage.span_consumer().await,
            Err(DataError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_close_rejects_further_use() {
        let storage =
            TraceStorage::new(StorageConfig::default(), Arc::new(MemorySession::default())).unwrap();
        storage.check().await.unwrap();
        storage.close();
        storage.close();
        assert!(matches!(storage.check().await, Err(DataError::Closed)));
        assert!(matches!(storage.span_store().await, Err(DataError::Closed)));
    }

    #[test]
    fn test_disabled_cache() {
        let config = StorageConfig {
            index_cache_max: 0,
            ..StorageConfig::default()
        };
        let storage = TraceStorage::new(config, Arc::new(MemorySession::default())).unwrap();
        assert!(storage.range_cache().is_none());
    }
}
