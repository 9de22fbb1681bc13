//! Trace search
//!
//! A query becomes one index scan per predicate. Scans of bucketed tables fan
//! out over every bucket, since writes pick buckets at random. Several scans
//! are intersected, the surviving ids are truncated to the request limit and
//! resolved to spans.

use std::sync::Arc;

use super::indexer::{RemoteServiceNameIndex, SpanNameIndex};
use super::query::QueryRequest;
use super::select::{IntersectTraceIds, TraceSelector, sort_trace_ids_by_desc_timestamp};
use super::span::Span;
use super::storage::StorageConfig;
use crate::call::{AggregateCall, Call};
use crate::core::constants::MAX_NAMES;
use crate::data::error::DataError;
use crate::data::schema::{
    ANNOTATIONS_INDEX, Metadata, REMOTE_SERVICE_NAMES, SERVICE_NAME_INDEX, SERVICE_NAMES,
    SERVICE_REMOTE_SERVICE_NAME_INDEX, SERVICE_SPAN_NAME_INDEX, SPAN_NAMES,
};
use crate::data::session::{Session, Statement, TraceIdScan};

type TraceIdPairs = Vec<(u64, u64)>;

/// Read side of the trace storage
#[derive(Clone)]
pub struct SpanStore {
    session: Arc<dyn Session>,
    selector: TraceSelector,
    search_enabled: bool,
    bucket_count: u32,
    fetch_multiplier: usize,
    has_remote_service: bool,
    supports_multi_partition_in: bool,
}

/// Index scan before it is bound to a time window
struct Predicate {
    table: &'static str,
    partition_keys: Vec<String>,
    bucketed: bool,
}

impl SpanStore {
    pub fn new(session: Arc<dyn Session>, config: &StorageConfig, metadata: &Metadata) -> Self {
        Self {
            selector: TraceSelector::new(session.clone(), config.strict_trace_id, config.max_trace_cols),
            session,
            search_enabled: config.search_enabled,
            bucket_count: config.bucket_count.max(1),
            fetch_multiplier: config.index_fetch_multiplier.max(1),
            has_remote_service: metadata.has_remote_service,
            supports_multi_partition_in: metadata.supports_multi_partition_in,
        }
    }

    /// Traces matching every criterion of `request`, newest first.
    ///
    /// Invalid criteria combinations fail here, before any call exists.
    pub fn get_traces(&self, request: &QueryRequest) -> Result<Call<Vec<Vec<Span>>>, DataError> {
        if !self.search_enabled {
            return Ok(Call::empty_list());
        }
        self.validate(request)?;
        tracing::debug!(
            service = ?request.service_name,
            annotations = ?request.annotation_query_string(),
            limit = request.limit,
            "Planning trace query"
        );

        let ids = match &request.service_name {
            Some(service) => {
                let scans: Vec<_> = self
                    .predicates(service, request)
                    .into_iter()
                    .map(|predicate| self.scan(predicate, request))
                    .collect();
                intersect(scans)
            }
            None => {
                let store = self.clone();
                let scoped = request.clone();
                self.get_service_names().flat_map(move |services| {
                    if services.is_empty() {
                        return Call::empty_list();
                    }
                    let predicate = Predicate {
                        table: SERVICE_NAME_INDEX,
                        partition_keys: services,
                        bucketed: true,
                    };
                    store.scan(predicate, &scoped).map(sort_trace_ids_by_desc_timestamp)
                })
            }
        };

        let selector = self.selector.clone();
        let request = request.clone();
        Ok(ids.flat_map(move |trace_ids| selector.traces(trace_ids, &request)))
    }

    /// Spans of one trace, empty when unknown
    pub fn get_trace(&self, trace_id: &str) -> Result<Call<Vec<Span>>, DataError> {
        self.selector.trace(trace_id)
    }

    /// Spans of several traces, concatenated in the order given
    pub fn get_traces_by_ids(&self, trace_ids: &[String]) -> Result<Call<Vec<Span>>, DataError> {
        let calls = trace_ids
            .iter()
            .map(|id| self.selector.trace(id))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(AggregateCall::concat_lists(calls))
    }

    pub fn get_service_names(&self) -> Call<Vec<String>> {
        if !self.search_enabled {
            return Call::empty_list();
        }
        self.names(SERVICE_NAMES, None)
    }

    pub fn get_span_names(&self, service_name: &str) -> Call<Vec<String>> {
        match clean(service_name) {
            Some(service) if self.search_enabled => self.names(SPAN_NAMES, Some(service)),
            _ => Call::empty_list(),
        }
    }

    pub fn get_remote_service_names(&self, service_name: &str) -> Call<Vec<String>> {
        match clean(service_name) {
            Some(service) if self.search_enabled && self.has_remote_service => {
                self.names(REMOTE_SERVICE_NAMES, Some(service))
            }
            _ => Call::empty_list(),
        }
    }

    fn validate(&self, request: &QueryRequest) -> Result<(), DataError> {
        if request.service_name.is_none() {
            if !request.annotation_query.is_empty() {
                return Err(DataError::invalid_argument(
                    "annotation query requires a service name",
                ));
            }
            if request.span_name.is_some() || request.remote_service_name.is_some() {
                return Err(DataError::invalid_argument(
                    "span or remote service name requires a service name",
                ));
            }
            if !self.supports_multi_partition_in {
                return Err(DataError::unsupported(
                    "queries without a service name need multi-partition IN support",
                ));
            }
        }
        if request.remote_service_name.is_some() && !self.has_remote_service {
            return Err(DataError::unsupported(format!(
                "remote service queries need the {SERVICE_REMOTE_SERVICE_NAME_INDEX} table"
            )));
        }
        Ok(())
    }

    /// One scan per criterion, or the service index alone when there are none
    fn predicates(&self, service: &str, request: &QueryRequest) -> Vec<Predicate> {
        let mut predicates = Vec::new();
        if let Some(span_name) = &request.span_name {
            predicates.push(Predicate {
                table: SERVICE_SPAN_NAME_INDEX,
                partition_keys: vec![SpanNameIndex::partition_key(service, span_name)],
                bucketed: false,
            });
        }
        if let Some(remote) = &request.remote_service_name {
            predicates.push(Predicate {
                table: SERVICE_REMOTE_SERVICE_NAME_INDEX,
                partition_keys: vec![RemoteServiceNameIndex::partition_key(service, remote)],
                bucketed: true,
            });
        }
        let mut annotations: Vec<String> = request
            .annotation_query
            .iter()
            .map(|(key, value)| {
                if value.is_empty() {
                    format!("{service}:{key}")
                } else {
                    format!("{service}:{key}:{value}")
                }
            })
            .collect();
        annotations.sort();
        predicates.extend(annotations.into_iter().map(|annotation| Predicate {
            table: ANNOTATIONS_INDEX,
            partition_keys: vec![annotation],
            bucketed: true,
        }));
        if predicates.is_empty() {
            predicates.push(Predicate {
                table: SERVICE_NAME_INDEX,
                partition_keys: vec![service.to_string()],
                bucketed: true,
            });
        }
        predicates
    }

    /// Scan one predicate over the request window.
    ///
    /// Without multi-partition IN support, each partition and bucket gets its
    /// own statement and the results are concatenated.
    fn scan(&self, predicate: Predicate, request: &QueryRequest) -> Call<TraceIdPairs> {
        let buckets: Vec<u32> = if predicate.bucketed {
            (0..self.bucket_count).collect()
        } else {
            Vec::new()
        };
        let template = TraceIdScan {
            table: predicate.table,
            partition_keys: predicate.partition_keys,
            buckets,
            ts_lo: request.start_ts().saturating_mul(1000),
            ts_hi: request.end_ts.saturating_mul(1000),
            limit: request.limit.saturating_mul(self.fetch_multiplier),
        };

        let fan_out = template.partition_keys.len() * template.buckets.len().max(1);
        if self.supports_multi_partition_in || fan_out <= 1 {
            return self.scan_call(template);
        }
        let bucket_sets: Vec<Vec<u32>> = if template.buckets.is_empty() {
            vec![Vec::new()]
        } else {
            template.buckets.iter().map(|bucket| vec![*bucket]).collect()
        };
        let mut calls = Vec::with_capacity(fan_out);
        for key in &template.partition_keys {
            for buckets in &bucket_sets {
                calls.push(self.scan_call(TraceIdScan {
                    partition_keys: vec![key.clone()],
                    buckets: buckets.clone(),
                    ..template.clone()
                }));
            }
        }
        AggregateCall::concat_lists(calls)
    }

    fn scan_call(&self, scan: TraceIdScan) -> Call<TraceIdPairs> {
        let session = self.session.clone();
        Call::new(format!("select-trace-ids[{}]", scan.table), move |_| {
            let session = session.clone();
            let statement = Statement::SelectTraceIds(scan.clone());
            async move {
                let backend = session.backend_name();
                session.execute(statement).await?.into_trace_ids(backend)
            }
        })
    }

    fn names(&self, table: &'static str, partition: Option<String>) -> Call<Vec<String>> {
        let session = self.session.clone();
        Call::new(format!("select-{table}"), move |_| {
            let session = session.clone();
            let statement = Statement::SelectNames {
                table,
                partition: partition.clone(),
                limit: MAX_NAMES,
            };
            async move {
                let backend = session.backend_name();
                let mut names = session.execute(statement).await?.into_names(backend)?;
                names.sort();
                names.dedup();
                Ok(names)
            }
        })
    }
}

/// A single scan is only ordered, several are intersected
fn intersect(mut scans: Vec<Call<TraceIdPairs>>) -> Call<Vec<u64>> {
    if scans.len() == 1 {
        return scans.remove(0).map(sort_trace_ids_by_desc_timestamp);
    }
    AggregateCall::create(scans, IntersectTraceIds)
}

fn clean(name: &str) -> Option<String> {
    let name = name.trim();
    (!name.is_empty()).then(|| name.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::memory::MemorySession;
    use crate::data::session::{IndexRow, NameRow};
    use crate::domain::traces::query::QueryRequestBuilder;

    const END_TS: u64 = 1_700_000_000_000;

    fn metadata(supports_in: bool) -> Metadata {
        Metadata {
            has_default_ttl: true,
            has_remote_service: true,
            has_autocomplete_tags: true,
            supports_multi_partition_in: supports_in,
        }
    }

    async fn index(
        session: &MemorySession,
        table: &'static str,
        key: &str,
        bucket: Option<u32>,
        ts_ms: u64,
        trace_id: u64,
    ) {
        session
            .execute(Statement::InsertIndex {
                row: IndexRow {
                    table,
                    partition_key: key.into(),
                    bucket,
                    ts: ts_ms * 1000,
                    trace_id,
                },
                ttl: None,
            })
            .await
            .unwrap();
    }

    fn request() -> QueryRequestBuilder {
        QueryRequest::builder().end_ts(END_TS).lookback(60_000)
    }

    #[test]
    fn test_validation_happens_before_any_call() {
        let session = Arc::new(MemorySession::default());
        let store = SpanStore::new(session.clone(), &StorageConfig::default(), &metadata(false));

        let annotation_only = request().annotation("error", "").build().unwrap();
        assert!(matches!(
            store.get_traces(&annotation_only),
            Err(DataError::InvalidArgument(_))
        ));

        let no_service = request().build().unwrap();
        assert!(matches!(
            store.get_traces(&no_service),
            Err(DataError::Unsupported(_))
        ));
        assert_eq!(session.total_writes(), 0);
    }

    #[test]
    fn test_remote_query_needs_remote_index() {
        let session = Arc::new(MemorySession::default());
        let metadata = Metadata {
            has_remote_service: false,
            ..metadata(true)
        };
        let store = SpanStore::new(session, &StorageConfig::default(), &metadata);
        let query = request()
            .service_name("frontend")
            .remote_service_name("db")
            .build()
            .unwrap();
        assert!(matches!(store.get_traces(&query), Err(DataError::Unsupported(_))));
    }

    #[test]
    fn test_predicates_per_criterion() {
        let session = Arc::new(MemorySession::default());
        let store = SpanStore::new(session, &StorageConfig::default(), &metadata(true));
        let query = request()
            .service_name("frontend")
            .span_name("get")
            .annotation("http.method", "GET")
            .annotation("error", "")
            .build()
            .unwrap();
        let predicates = store.predicates("frontend", &query);
        let keys: Vec<_> = predicates
            .iter()
            .map(|p| (p.table, p.partition_keys[0].as_str(), p.bucketed))
            .collect();
        assert_eq!(
            keys,
            vec![
                (SERVICE_SPAN_NAME_INDEX, "frontend.get", false),
                (ANNOTATIONS_INDEX, "frontend:error", true),
                (ANNOTATIONS_INDEX, "frontend:http.method:GET", true),
            ]
        );

        let bare = request().service_name("frontend").build().unwrap();
        let predicates = store.predicates("frontend", &bare);
        assert_eq!(predicates.len(), 1);
        assert_eq!(predicates[0].table, SERVICE_NAME_INDEX);
    }

    #[tokio::test]
    async fn test_scan_without_in_support_fans_out_per_bucket() {
        let session = Arc::new(MemorySession::builder().supports_multi_partition_in(false).build());
        for bucket in [0, 4, 9] {
            let trace_id = u64::from(bucket) + 1;
            index(&session, SERVICE_NAME_INDEX, "frontend", Some(bucket), END_TS - 1_000, trace_id).await;
        }
        let store = SpanStore::new(session, &StorageConfig::default(), &metadata(false));
        let query = request().service_name("frontend").build().unwrap();
        let predicate = Predicate {
            table: SERVICE_NAME_INDEX,
            partition_keys: vec!["frontend".into()],
            bucketed: true,
        };
        let mut ids: Vec<u64> = store
            .scan(predicate, &query)
            .execute()
            .await
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec![1, 5, 10]);
    }

    #[tokio::test]
    async fn test_names_are_sorted_and_blank_service_is_empty() {
        let session = Arc::new(MemorySession::default());
        for value in ["web", "api"] {
            session
                .execute(Statement::InsertName(NameRow {
                    table: SERVICE_NAMES,
                    partition: None,
                    value: value.into(),
                }))
                .await
                .unwrap();
        }
        let store = SpanStore::new(session, &StorageConfig::default(), &metadata(true));
        assert_eq!(store.get_service_names().execute().await.unwrap(), vec!["api", "web"]);
        assert!(store.get_span_names("  ").execute().await.unwrap().is_empty());
        assert!(store.get_remote_service_names("").execute().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_search_disabled_returns_empty() {
        let session = Arc::new(MemorySession::default());
        index(&session, SERVICE_NAME_INDEX, "frontend", Some(0), END_TS - 1_000, 1).await;
        let config = StorageConfig {
            search_enabled: false,
            ..StorageConfig::default()
        };
        let store = SpanStore::new(session, &config, &metadata(true));
        let query = request().service_name("frontend").build().unwrap();
        assert!(store.get_traces(&query).unwrap().execute().await.unwrap().is_empty());
        assert!(store.get_service_names().execute().await.unwrap().is_empty());
    }
}
