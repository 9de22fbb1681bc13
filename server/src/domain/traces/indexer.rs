//! Secondary index writes with gap widening
//!
//! Each index table implements [`IndexSupport`], which derives partition keys
//! from a span. [`CompositeIndexer`] fans a span batch out over every enabled
//! index, and [`TraceIdIndexer`] decides, per table, which `(key, ts)` rows are
//! worth writing: only timestamps that became a boundary of the key's known
//! range in the shared [`RangeCache`].
//!
//! A query window that falls strictly inside an already widened range may
//! miss the trace through this index. Windows are nearly always contiguous
//! with ingestion time, so the saved writes are worth it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use super::span::{CORE_ANNOTATIONS, Span};
use crate::call::Call;
use crate::core::constants::LONGEST_VALUE_TO_INDEX;
use crate::data::cache::{IndexKey, RangeCache};
use crate::data::error::DataError;
use crate::data::schema::{
    ANNOTATIONS_INDEX, SERVICE_NAME_INDEX, SERVICE_REMOTE_SERVICE_NAME_INDEX,
    SERVICE_SPAN_NAME_INDEX,
};
use crate::data::session::{IndexRow, Session, Statement};

// ============================================================================
// Index Support
// ============================================================================

/// How one index table keys spans
pub trait IndexSupport: Send + Sync {
    fn table(&self) -> &'static str;

    /// Whether rows are spread over random buckets
    fn bucketed(&self) -> bool;

    /// Distinct partition keys for `span`, in a stable order
    fn partition_keys(&self, span: &Span) -> Vec<String>;
}

/// `service_name_index`, keyed by local service
pub struct ServiceNameIndex;

impl IndexSupport for ServiceNameIndex {
    fn table(&self) -> &'static str {
        SERVICE_NAME_INDEX
    }

    fn bucketed(&self) -> bool {
        true
    }

    fn partition_keys(&self, span: &Span) -> Vec<String> {
        span.local_service_name()
            .map(|service| vec![service.to_string()])
            .unwrap_or_default()
    }
}

/// `service_remote_service_name_index`, keyed by `local.remote`
pub struct RemoteServiceNameIndex;

impl RemoteServiceNameIndex {
    pub fn partition_key(service: &str, remote_service: &str) -> String {
        format!("{service}.{remote_service}")
    }
}

impl IndexSupport for RemoteServiceNameIndex {
    fn table(&self) -> &'static str {
        SERVICE_REMOTE_SERVICE_NAME_INDEX
    }

    fn bucketed(&self) -> bool {
        true
    }

    fn partition_keys(&self, span: &Span) -> Vec<String> {
        match (span.local_service_name(), span.remote_service_name()) {
            (Some(local), Some(remote)) => vec![Self::partition_key(local, remote)],
            _ => Vec::new(),
        }
    }
}

/// `service_span_name_index`, keyed by `local.spanName`
pub struct SpanNameIndex;

impl SpanNameIndex {
    pub fn partition_key(service: &str, span_name: &str) -> String {
        format!("{service}.{span_name}")
    }
}

impl IndexSupport for SpanNameIndex {
    fn table(&self) -> &'static str {
        SERVICE_SPAN_NAME_INDEX
    }

    fn bucketed(&self) -> bool {
        false
    }

    fn partition_keys(&self, span: &Span) -> Vec<String> {
        match (span.local_service_name(), span.span_name()) {
            (Some(local), Some(name)) => vec![Self::partition_key(local, &name)],
            _ => Vec::new(),
        }
    }
}

/// `annotations_index`, keyed by annotation values and tags
pub struct AnnotationIndex;

impl IndexSupport for AnnotationIndex {
    fn table(&self) -> &'static str {
        ANNOTATIONS_INDEX
    }

    fn bucketed(&self) -> bool {
        true
    }

    fn partition_keys(&self, span: &Span) -> Vec<String> {
        annotation_keys(span)
    }
}

/// `service:value` for annotations, `service:key` and `service:key:value`
/// for tags. Core annotations and long tag values are skipped.
pub fn annotation_keys(span: &Span) -> Vec<String> {
    let Some(service) = span.local_service_name() else {
        return Vec::new();
    };
    let mut keys = Vec::new();
    let mut seen = HashSet::new();
    let mut push = |key: String| {
        if seen.insert(key.clone()) {
            keys.push(key);
        }
    };
    for annotation in &span.annotations {
        if CORE_ANNOTATIONS.contains(&annotation.value.as_str()) {
            continue;
        }
        push(format!("{service}:{}", annotation.value));
    }
    for (key, value) in &span.tags {
        if value.chars().count() > LONGEST_VALUE_TO_INDEX {
            continue;
        }
        push(format!("{service}:{key}"));
        push(format!("{service}:{key}:{value}"));
    }
    keys
}

// ============================================================================
// Gap Widening
// ============================================================================

/// One candidate index row
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexInput {
    pub key: IndexKey,
    /// Microseconds truncated to milliseconds
    pub ts: u64,
}

/// Collects one batch of inputs for a table and keeps only those that widen
/// a key's known range.
pub struct TraceIdIndexer<'a> {
    cache: Option<&'a RangeCache>,
    inputs: Vec<IndexInput>,
    seen: HashSet<IndexInput>,
}

impl<'a> TraceIdIndexer<'a> {
    /// `None` disables gap widening; every distinct input is then written.
    pub fn new(cache: Option<&'a RangeCache>) -> Self {
        Self {
            cache,
            inputs: Vec::new(),
            seen: HashSet::new(),
        }
    }

    pub fn add(&mut self, input: IndexInput) {
        if self.seen.insert(input.clone()) {
            self.inputs.push(input);
        }
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Inputs to write, in the order their timestamps first occurred.
    ///
    /// The whole batch is folded into the cache before anything is chosen,
    /// so a boundary reached by several spans is written once. A timestamp is
    /// written when it ends up as the low or high end of a range this batch
    /// changed. Ranges missing from the cache afterwards (trimmed by another
    /// batch) are treated as boundaries.
    pub fn into_writes(self) -> Vec<IndexInput> {
        let Some(cache) = self.cache else {
            return self.inputs;
        };

        let mut changed: HashSet<&IndexKey> = HashSet::new();
        for input in &self.inputs {
            if cache.widen(&input.key, input.ts).changed() {
                changed.insert(&input.key);
            }
        }

        let mut ranges = HashMap::new();
        let mut writes = Vec::new();
        for input in &self.inputs {
            if !changed.contains(&input.key) {
                continue;
            }
            let range = *ranges
                .entry(&input.key)
                .or_insert_with(|| cache.get(&input.key));
            let is_boundary = range.is_none_or(|r| r.lo == input.ts || r.hi == input.ts);
            if is_boundary {
                writes.push(input.clone());
            }
        }
        writes
    }
}

// ============================================================================
// Composite Indexer
// ============================================================================

/// Settings shared by every index write
#[derive(Debug, Clone, Copy)]
pub struct IndexWriteOptions {
    pub bucket_count: u32,
    /// Row TTL, set only when the schema has no default TTL
    pub ttl: Option<Duration>,
}

/// Fans spans out to every enabled index
pub struct CompositeIndexer {
    session: Arc<dyn Session>,
    cache: Option<Arc<RangeCache>>,
    indexes: Vec<Box<dyn IndexSupport>>,
    options: IndexWriteOptions,
}

impl CompositeIndexer {
    pub fn new(
        session: Arc<dyn Session>,
        cache: Option<Arc<RangeCache>>,
        has_remote_service: bool,
        options: IndexWriteOptions,
    ) -> Self {
        let mut indexes: Vec<Box<dyn IndexSupport>> =
            vec![Box::new(ServiceNameIndex), Box::new(SpanNameIndex)];
        if has_remote_service {
            indexes.push(Box::new(RemoteServiceNameIndex));
        }
        indexes.push(Box::new(AnnotationIndex));
        Self {
            session,
            cache,
            indexes,
            options,
        }
    }

    pub fn tables(&self) -> Vec<&'static str> {
        self.indexes.iter().map(|index| index.table()).collect()
    }

    /// Index writes for one batch of spans.
    ///
    /// Spans without a usable timestamp are not indexed.
    pub fn index(&self, spans: &[Span]) -> Result<Vec<Call<()>>, DataError> {
        let cache = self.cache.as_deref();
        if let Some(cache) = cache {
            cache.trim();
        }

        let mut calls = Vec::new();
        for index in &self.indexes {
            let mut indexer = TraceIdIndexer::new(cache);
            for span in spans {
                let Some(timestamp) = span.guess_timestamp() else {
                    continue;
                };
                let ts = 1000 * (timestamp / 1000);
                let trace_id = span.trace_id_low()?;
                for partition_key in index.partition_keys(span) {
                    indexer.add(IndexInput {
                        key: IndexKey::new(index.table(), partition_key, trace_id),
                        ts,
                    });
                }
            }
            let candidates = indexer.len();
            let writes = indexer.into_writes();
            if writes.len() < candidates {
                tracing::debug!(
                    table = index.table(),
                    optimized = candidates - writes.len(),
                    candidates,
                    "Optimized out index inserts"
                );
            }
            calls.extend(
                writes
                    .into_iter()
                    .map(|input| self.index_call(input, index.bucketed())),
            );
        }
        Ok(calls)
    }

    /// Write call for one row. The bucket is drawn each time the call runs,
    /// and a failed write forgets its range so it is not suppressed later.
    fn index_call(&self, input: IndexInput, bucketed: bool) -> Call<()> {
        let session = self.session.clone();
        let bucket_count = self.options.bucket_count.max(1);
        let ttl = self.options.ttl;
        let key = input.key.clone();
        let call: Call<()> = Call::new(format!("index-trace-id[{}]", input.key.table), move |_| {
            let session = session.clone();
            let bucket = bucketed.then(|| rand::thread_rng().gen_range(0..bucket_count));
            let row = IndexRow {
                table: input.key.table,
                partition_key: input.key.partition_key.clone(),
                bucket,
                ts: input.ts,
                trace_id: input.key.trace_id,
            };
            async move {
                session.execute(Statement::InsertIndex { row, ttl }).await?;
                Ok(())
            }
        });
        match &self.cache {
            Some(cache) => {
                let cache = cache.clone();
                call.release_on_failure(move || cache.invalidate(&key))
            }
            None => call,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(partition: &str, trace_id: u64, ts: u64) -> IndexInput {
        IndexInput {
            key: IndexKey::new(SERVICE_NAME_INDEX, partition, trace_id),
            ts,
        }
    }

    fn timestamps(writes: &[IndexInput]) -> Vec<u64> {
        writes.iter().map(|w| w.ts).collect()
    }

    #[tokio::test]
    async fn test_widening_across_batches() {
        let cache = RangeCache::new(100, Duration::from_secs(60));
        let mut writes = Vec::new();
        for ts in [100, 150, 120] {
            let mut indexer = TraceIdIndexer::new(Some(&cache));
            indexer.add(input("frontend", 1, ts));
            writes.extend(indexer.into_writes());
        }
        assert_eq!(timestamps(&writes), vec![100, 150]);
    }

    #[tokio::test]
    async fn test_batch_writes_only_boundaries() {
        let cache = RangeCache::new(100, Duration::from_secs(60));
        let mut indexer = TraceIdIndexer::new(Some(&cache));
        for ts in [300, 100, 200, 400, 100] {
            indexer.add(input("frontend", 1, ts));
        }
        assert_eq!(indexer.len(), 4);
        assert_eq!(timestamps(&indexer.into_writes()), vec![100, 400]);
    }

    #[tokio::test]
    async fn test_both_ends_move_once() {
        let cache = RangeCache::new(100, Duration::from_secs(60));
        let mut first = TraceIdIndexer::new(Some(&cache));
        first.add(input("frontend", 1, 200));
        assert_eq!(timestamps(&first.into_writes()), vec![200]);

        let mut second = TraceIdIndexer::new(Some(&cache));
        second.add(input("frontend", 1, 300));
        second.add(input("frontend", 1, 100));
        second.add(input("frontend", 1, 250));
        assert_eq!(timestamps(&second.into_writes()), vec![300, 100]);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let cache = RangeCache::new(100, Duration::from_secs(60));
        let mut indexer = TraceIdIndexer::new(Some(&cache));
        indexer.add(input("frontend", 1, 100));
        indexer.add(input("frontend", 2, 100));
        indexer.add(input("backend", 1, 100));
        assert_eq!(indexer.into_writes().len(), 3);
    }

    #[tokio::test]
    async fn test_disabled_cache_writes_every_distinct_input() {
        let mut indexer = TraceIdIndexer::new(None);
        for ts in [100, 150, 120, 150] {
            indexer.add(input("frontend", 1, ts));
        }
        assert_eq!(timestamps(&indexer.into_writes()), vec![100, 150, 120]);
    }

    #[test]
    fn test_annotation_keys() {
        let long = "x".repeat(LONGEST_VALUE_TO_INDEX + 1);
        let span = Span::new("1", "1")
            .unwrap()
            .with_local_service("frontend")
            .with_annotation(1, "cs")
            .with_annotation(2, "retry")
            .with_annotation(3, "retry")
            .with_tag("http.method", "GET")
            .with_tag("sql.query", &long);
        assert_eq!(
            annotation_keys(&span),
            vec![
                "frontend:retry",
                "frontend:http.method",
                "frontend:http.method:GET"
            ]
        );
    }

    #[test]
    fn test_partition_keys_need_a_service() {
        let span = Span::new("1", "1")
            .unwrap()
            .with_name("get")
            .with_remote_service("db");
        assert!(ServiceNameIndex.partition_keys(&span).is_empty());
        assert!(SpanNameIndex.partition_keys(&span).is_empty());
        assert!(RemoteServiceNameIndex.partition_keys(&span).is_empty());
        assert!(annotation_keys(&span).is_empty());

        let span = span.with_local_service("frontend");
        assert_eq!(SpanNameIndex.partition_keys(&span), vec!["frontend.get"]);
        assert_eq!(RemoteServiceNameIndex.partition_keys(&span), vec!["frontend.db"]);
    }
}
