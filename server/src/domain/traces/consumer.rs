//! Span ingestion
//!
//! [`SpanConsumer::accept`] turns one batch of spans into a single void call:
//! one row per span in `traces`, deduplicated lookup-table rows, and the
//! gap-widened secondary index rows. Writes are independent; a failure of
//! one does not undo the others.

use std::sync::Arc;
use std::time::Duration;

use crate::call::{AggregateCall, Call, DeduplicatingCallFactory};
use crate::data::cache::{DelayLimiter, RangeCache};
use crate::data::error::DataError;
use crate::data::schema::{
    AUTOCOMPLETE_TAGS, Metadata, REMOTE_SERVICE_NAMES, SERVICE_NAMES, SPAN_NAMES,
};
use crate::data::session::{NameRow, Session, SpanRow, Statement};

use super::indexer::{CompositeIndexer, IndexWriteOptions};
use super::span::{self, Span};
use super::storage::StorageConfig;

/// Length of the content digest appended to span clustering keys
const DIGEST_HEX_LEN: usize = 16;

/// Write side of the trace storage
pub struct SpanConsumer {
    session: Arc<dyn Session>,
    span_ttl: Option<Duration>,
    search: Option<SearchWriters>,
}

/// Writers that only exist while search is enabled
struct SearchWriters {
    indexer: CompositeIndexer,
    names: DeduplicatingCallFactory<NameRow>,
    has_remote_service: bool,
    autocomplete: Option<AutocompleteWriter>,
}

struct AutocompleteWriter {
    keys: Vec<String>,
    rows: DeduplicatingCallFactory<NameRow>,
}

impl SpanConsumer {
    pub fn new(
        session: Arc<dyn Session>,
        config: &StorageConfig,
        metadata: &Metadata,
        range_cache: Option<Arc<RangeCache>>,
    ) -> Result<Self, DataError> {
        let explicit_ttl = |secs: u64| (!metadata.has_default_ttl).then(|| Duration::from_secs(secs));
        let search = if config.search_enabled {
            let indexer = CompositeIndexer::new(
                session.clone(),
                range_cache,
                metadata.has_remote_service,
                IndexWriteOptions {
                    bucket_count: config.bucket_count,
                    ttl: explicit_ttl(config.index_ttl_secs),
                },
            );
            let names = name_factory(
                session.clone(),
                DelayLimiter::builder()
                    .expire_after(Duration::from_secs(config.names_ttl_secs))
                    .maximum_size(config.names_cardinality)
                    .build()?,
            );
            let autocomplete = if metadata.has_autocomplete_tags && !config.autocomplete_keys.is_empty() {
                let limiter = DelayLimiter::builder()
                    .expire_after(Duration::from_secs(config.autocomplete_ttl_secs))
                    .maximum_size(config.autocomplete_cardinality)
                    .build()?;
                Some(AutocompleteWriter {
                    keys: config.autocomplete_keys.clone(),
                    rows: name_factory(session.clone(), limiter),
                })
            } else {
                None
            };
            Some(SearchWriters {
                indexer,
                names,
                has_remote_service: metadata.has_remote_service,
                autocomplete,
            })
        } else {
            None
        };

        Ok(Self {
            session,
            span_ttl: explicit_ttl(config.span_ttl_secs),
            search,
        })
    }

    /// Build the writes for one batch.
    ///
    /// Every span is normalized and encoded before any suppression cache is
    /// consulted, so a malformed span fails the batch without leaving names
    /// or index ranges marked as written.
    pub fn accept(&self, spans: &[Span]) -> Result<Call<()>, DataError> {
        if spans.is_empty() {
            return Ok(Call::create(()));
        }
        let spans = spans
            .iter()
            .map(Span::normalize)
            .collect::<Result<Vec<_>, _>>()?;
        let mut calls = spans
            .iter()
            .map(|span| self.store_span(span))
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(search) = &self.search {
            for span in &spans {
                search.lookup_rows(span, &mut calls);
            }
            calls.extend(search.indexer.index(&spans)?);
        }
        tracing::trace!(spans = spans.len(), calls = calls.len(), "Accepted span batch");
        Ok(AggregateCall::new_void_call(calls))
    }

    /// Forget every suppression decision, e.g. after the schema was reset
    pub fn clear_caches(&self) {
        if let Some(search) = &self.search {
            search.names.clear();
            if let Some(autocomplete) = &search.autocomplete {
                autocomplete.rows.clear();
            }
        }
    }

    fn store_span(&self, span: &Span) -> Result<Call<()>, DataError> {
        let span_bytes = span::encode(span)?;
        let digest = blake3::hash(&span_bytes).to_hex();
        let row = SpanRow {
            trace_id: span.trace_id_low()?,
            ts: span.guess_timestamp().unwrap_or(0),
            span_name: format!("{}_{}", span.id, &digest[..DIGEST_HEX_LEN]),
            span_bytes,
        };
        let session = self.session.clone();
        let ttl = self.span_ttl;
        Ok(Call::new("insert-span", move |_| {
            let session = session.clone();
            let statement = Statement::InsertSpan {
                row: row.clone(),
                ttl,
            };
            async move {
                session.execute(statement).await?;
                Ok(())
            }
        }))
    }
}

impl SearchWriters {
    fn lookup_rows(&self, span: &Span, calls: &mut Vec<Call<()>>) {
        let Some(service) = span.local_service_name() else {
            return;
        };
        calls.push(self.names.create(NameRow {
            table: SERVICE_NAMES,
            partition: None,
            value: service.to_string(),
        }));
        if let Some(span_name) = span.span_name() {
            calls.push(self.names.create(NameRow {
                table: SPAN_NAMES,
                partition: Some(service.to_string()),
                value: span_name,
            }));
        }
        if self.has_remote_service
            && let Some(remote) = span.remote_service_name()
        {
            calls.push(self.names.create(NameRow {
                table: REMOTE_SERVICE_NAMES,
                partition: Some(service.to_string()),
                value: remote.to_string(),
            }));
        }
        if let Some(autocomplete) = &self.autocomplete {
            for key in &autocomplete.keys {
                if let Some(value) = span.tags.get(key) {
                    calls.push(autocomplete.rows.create(NameRow {
                        table: AUTOCOMPLETE_TAGS,
                        partition: Some(key.clone()),
                        value: value.clone(),
                    }));
                }
            }
        }
    }
}

fn name_factory(
    session: Arc<dyn Session>,
    limiter: DelayLimiter<NameRow>,
) -> DeduplicatingCallFactory<NameRow> {
    DeduplicatingCallFactory::new(limiter, move |row: NameRow| {
        let session = session.clone();
        Call::new(format!("insert-{}", row.table), move |_| {
            let session = session.clone();
            let statement = Statement::InsertName(row.clone());
            async move {
                session.execute(statement).await?;
                Ok(())
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::memory::MemorySession;
    use crate::data::schema::{SERVICE_NAME_INDEX, TRACES};

    fn metadata() -> Metadata {
        Metadata {
            has_default_ttl: true,
            has_remote_service: true,
            has_autocomplete_tags: true,
            supports_multi_partition_in: true,
        }
    }

    fn span(id: &str, ts: u64) -> Span {
        Span::new("463ac35c9f6413ad", id)
            .unwrap()
            .with_name("get")
            .with_timestamp(ts, 100)
            .with_local_service("frontend")
            .with_remote_service("db")
            .with_tag("env", "prod")
    }

    fn consumer(session: &Arc<MemorySession>, config: &StorageConfig) -> SpanConsumer {
        let cache = Arc::new(RangeCache::new(100, Duration::from_secs(60)));
        SpanConsumer::new(session.clone(), config, &metadata(), Some(cache)).unwrap()
    }

    #[tokio::test]
    async fn test_accept_writes_every_table() {
        let session = Arc::new(MemorySession::default());
        let config = StorageConfig {
            autocomplete_keys: vec!["env".into()],
            ..StorageConfig::default()
        };
        let consumer = consumer(&session, &config);

        consumer
            .accept(&[span("a", 1_000_000)])
            .unwrap()
            .execute()
            .await
            .unwrap();

        assert_eq!(session.writes(TRACES), 1);
        assert_eq!(session.writes(SERVICE_NAMES), 1);
        assert_eq!(session.writes(SPAN_NAMES), 1);
        assert_eq!(session.writes(REMOTE_SERVICE_NAMES), 1);
        assert_eq!(session.writes(AUTOCOMPLETE_TAGS), 1);
        assert_eq!(session.writes(SERVICE_NAME_INDEX), 1);
    }

    #[tokio::test]
    async fn test_lookup_rows_are_deduplicated() {
        let session = Arc::new(MemorySession::default());
        let consumer = consumer(&session, &StorageConfig::default());

        for (id, ts) in [("a", 1_000_000), ("b", 1_000_000)] {
            consumer.accept(&[span(id, ts)]).unwrap().execute().await.unwrap();
        }
        assert_eq!(session.writes(TRACES), 2);
        assert_eq!(session.writes(SERVICE_NAMES), 1);
        assert_eq!(session.writes(SERVICE_NAME_INDEX), 1);
        assert_eq!(session.writes(AUTOCOMPLETE_TAGS), 0);
    }

    #[tokio::test]
    async fn test_search_disabled_writes_spans_only() {
        let session = Arc::new(MemorySession::default());
        let config = StorageConfig {
            search_enabled: false,
            ..StorageConfig::default()
        };
        let consumer = consumer(&session, &config);
        consumer.accept(&[span("a", 1)]).unwrap().execute().await.unwrap();
        assert_eq!(session.total_writes(), 1);
        assert_eq!(session.writes(TRACES), 1);
    }

    #[tokio::test]
    async fn test_span_versions_coexist() {
        let session = Arc::new(MemorySession::default());
        let consumer = consumer(&session, &StorageConfig::default());
        let first = span("a", 1_000);
        let second = first.clone().with_tag("error", "true");
        consumer.accept(&[first, second]).unwrap().execute().await.unwrap();

        let rows = session
            .execute(Statement::SelectSpans {
                trace_ids: vec![0x463ac35c9f6413ad],
                limit: 10,
            })
            .await
            .unwrap()
            .into_spans("memory")
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.span_name.starts_with("000000000000000a_")));
    }

    #[tokio::test]
    async fn test_rejected_batch_leaves_names_unsuppressed() {
        let session = Arc::new(MemorySession::default());
        let consumer = consumer(&session, &StorageConfig::default());
        let mut bad = span("b", 2_000_000);
        bad.trace_id = "not-hex".into();
        assert!(consumer.accept(&[span("a", 1_000_000), bad]).is_err());

        consumer
            .accept(&[span("a", 1_000_000)])
            .unwrap()
            .execute()
            .await
            .unwrap();
        assert_eq!(session.writes(SERVICE_NAMES), 1);
        assert_eq!(session.writes(SPAN_NAMES), 1);
        assert_eq!(session.writes(SERVICE_NAME_INDEX), 1);
    }

    #[tokio::test]
    async fn test_decoded_spans_are_stored_normalized() {
        let session = Arc::new(MemorySession::default());
        let consumer = consumer(&session, &StorageConfig::default());
        let mut decoded = span("a", 1_000_000);
        decoded.trace_id = "463AC35C9F6413AD".into();
        decoded.local_endpoint = Some(span::Endpoint {
            service_name: Some("Frontend".into()),
            ..Default::default()
        });
        consumer.accept(&[decoded]).unwrap().execute().await.unwrap();

        let indexed: usize = (0..10)
            .map(|bucket| session.index_rows(SERVICE_NAME_INDEX, "frontend", Some(bucket)).len())
            .sum();
        assert_eq!(indexed, 1);
        let rows = session
            .execute(Statement::SelectSpans {
                trace_ids: vec![0x463ac35c9f6413ad],
                limit: 10,
            })
            .await
            .unwrap()
            .into_spans("memory")
            .unwrap();
        let stored = span::decode(&rows[0].span_bytes).unwrap();
        assert_eq!(stored.trace_id, "463ac35c9f6413ad");
        assert_eq!(stored.local_service_name(), Some("frontend"));
    }

    #[tokio::test]
    async fn test_malformed_trace_id_fails_before_any_write() {
        let session = Arc::new(MemorySession::default());
        let consumer = consumer(&session, &StorageConfig::default());
        let mut bad = span("a", 1);
        bad.trace_id = "not-hex".into();
        assert!(consumer.accept(&[bad]).is_err());
        assert_eq!(session.total_writes(), 0);
    }
}
