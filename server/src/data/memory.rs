//! In-memory column store
//!
//! Implements [`Session`] over `DashMap` partitions with the same read
//! semantics the storage core expects from the real database: upserts by
//! primary key, time-windowed index scans with `IN` over partitions and
//! buckets, newest-first ordering and row limits. Expired rows are hidden
//! on read and dropped whenever their partition is written or scanned.
//!
//! Besides serving single-process deployments it doubles as a test double:
//! per-table write counters, injectable failures and artificial latency.
//! Writes are applied after the latency elapses, so a canceled statement
//! leaves no trace.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::data::error::DataError;
use crate::data::schema::{
    ANNOTATIONS_INDEX, AUTOCOMPLETE_TAGS, REMOTE_SERVICE_NAMES, SERVICE_NAME_INDEX, SERVICE_NAMES,
    SERVICE_REMOTE_SERVICE_NAME_INDEX, SERVICE_SPAN_NAME_INDEX, SPAN_NAMES, TRACES,
};
use crate::data::session::{
    IndexRow, KeyspaceMetadata, NameRow, Rows, Session, SpanRow, Statement, TraceIdScan,
};

const BACKEND: &str = "memory";

/// Failure to raise for statements against one table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    Overloaded,
    Timeout,
    Unavailable,
    Database,
}

impl InjectedFailure {
    fn to_error(self, table: &str) -> DataError {
        match self {
            Self::Overloaded => DataError::overloaded(BACKEND, format!("{table} is shedding load")),
            Self::Timeout => DataError::timeout(BACKEND, 0),
            Self::Unavailable => {
                DataError::backend_unavailable(BACKEND, format!("{table} has no live replica"))
            }
            Self::Database => DataError::database(BACKEND, format!("write to {table} failed")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PartitionId {
    table: &'static str,
    key: String,
    bucket: Option<u32>,
}

/// `(ts, span_name)` clustering key to blob and expiry
type SpanPartition = BTreeMap<(u64, String), (Vec<u8>, Option<Instant>)>;
/// `(ts, trace_id)` clustering key to expiry
type IndexPartition = BTreeMap<(u64, u64), Option<Instant>>;

/// Builder for [`MemorySession`]
#[derive(Debug, Clone)]
pub struct MemorySessionBuilder {
    tables: BTreeMap<String, u64>,
    supports_multi_partition_in: bool,
    latency: Duration,
}

impl Default for MemorySessionBuilder {
    fn default() -> Self {
        let tables = [
            TRACES,
            SERVICE_NAME_INDEX,
            SERVICE_REMOTE_SERVICE_NAME_INDEX,
            SERVICE_SPAN_NAME_INDEX,
            ANNOTATIONS_INDEX,
            SERVICE_NAMES,
            REMOTE_SERVICE_NAMES,
            SPAN_NAMES,
            AUTOCOMPLETE_TAGS,
        ]
        .into_iter()
        .map(|table| (table.to_string(), 0))
        .collect();
        Self {
            tables,
            supports_multi_partition_in: true,
            latency: Duration::ZERO,
        }
    }
}

impl MemorySessionBuilder {
    /// Drop a table from the schema
    pub fn without_table(mut self, table: &str) -> Self {
        self.tables.remove(table);
        self
    }

    /// Default TTL of the `traces` table
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        if let Some(entry) = self.tables.get_mut(TRACES) {
            *entry = ttl.as_secs();
        }
        self
    }

    pub fn supports_multi_partition_in(mut self, supported: bool) -> Self {
        self.supports_multi_partition_in = supported;
        self
    }

    /// Delay applied before every statement takes effect
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn build(self) -> MemorySession {
        MemorySession {
            tables: self.tables,
            supports_multi_partition_in: self.supports_multi_partition_in,
            latency: self.latency,
            spans: DashMap::new(),
            indexes: DashMap::new(),
            names: DashMap::new(),
            writes: DashMap::new(),
            failures: DashMap::new(),
        }
    }
}

/// In-memory [`Session`]
pub struct MemorySession {
    tables: BTreeMap<String, u64>,
    supports_multi_partition_in: bool,
    latency: Duration,
    spans: DashMap<u64, SpanPartition>,
    indexes: DashMap<PartitionId, IndexPartition>,
    names: DashMap<(&'static str, Option<String>), BTreeSet<String>>,
    writes: DashMap<&'static str, u64>,
    failures: DashMap<&'static str, InjectedFailure>,
}

impl Default for MemorySession {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl std::fmt::Debug for MemorySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySession")
            .field("tables", &self.tables.keys().collect::<Vec<_>>())
            .field("traces", &self.spans.len())
            .field("index_partitions", &self.indexes.len())
            .finish()
    }
}

impl MemorySession {
    pub fn builder() -> MemorySessionBuilder {
        MemorySessionBuilder::default()
    }

    /// Mutations applied to `table` so far
    pub fn writes(&self, table: &str) -> u64 {
        self.writes.get(table).map(|count| *count).unwrap_or(0)
    }

    pub fn total_writes(&self) -> u64 {
        self.writes.iter().map(|entry| *entry.value()).sum()
    }

    /// Fail every statement against `table` until cleared
    pub fn inject_failure(&self, table: &'static str, failure: InjectedFailure) {
        self.failures.insert(table, failure);
    }

    pub fn clear_failures(&self) {
        self.failures.clear();
    }

    /// Index rows currently stored in one partition, newest first
    pub fn index_rows(&self, table: &'static str, key: &str, bucket: Option<u32>) -> Vec<IndexRow> {
        let id = PartitionId {
            table,
            key: key.to_string(),
            bucket,
        };
        let now = Instant::now();
        self.indexes
            .get(&id)
            .map(|partition| {
                partition
                    .iter()
                    .rev()
                    .filter(|(_, expires)| is_live(**expires, now))
                    .map(|((ts, trace_id), _)| IndexRow {
                        table,
                        partition_key: key.to_string(),
                        bucket,
                        ts: *ts,
                        trace_id: *trace_id,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn require_table(&self, table: &str) -> Result<(), DataError> {
        if self.tables.contains_key(table) {
            Ok(())
        } else {
            Err(DataError::database(BACKEND, format!("unconfigured table {table}")))
        }
    }

    fn count_write(&self, table: &'static str) {
        *self.writes.entry(table).or_insert(0) += 1;
    }

    fn insert_span(&self, row: SpanRow, ttl: Option<Duration>) {
        let now = Instant::now();
        let expires = ttl.map(|ttl| now + ttl);
        let mut partition = self.spans.entry(row.trace_id).or_default();
        partition.retain(|_, (_, expires)| is_live(*expires, now));
        partition.insert((row.ts, row.span_name), (row.span_bytes, expires));
        drop(partition);
        self.count_write(TRACES);
    }

    fn insert_index(&self, row: IndexRow, ttl: Option<Duration>) {
        let now = Instant::now();
        let expires = ttl.map(|ttl| now + ttl);
        let id = PartitionId {
            table: row.table,
            key: row.partition_key,
            bucket: row.bucket,
        };
        let mut partition = self.indexes.entry(id).or_default();
        partition.retain(|_, expires| is_live(*expires, now));
        partition.insert((row.ts, row.trace_id), expires);
        drop(partition);
        self.count_write(row.table);
    }

    fn insert_name(&self, row: NameRow) {
        self.names
            .entry((row.table, row.partition))
            .or_default()
            .insert(row.value);
        self.count_write(row.table);
    }

    fn select_trace_ids(&self, scan: &TraceIdScan) -> Result<Vec<(u64, u64)>, DataError> {
        let fan_out = scan.partition_keys.len() * scan.buckets.len().max(1);
        if fan_out > 1 && !self.supports_multi_partition_in {
            return Err(DataError::unsupported(format!(
                "{BACKEND} cannot scan {fan_out} partitions of {} in one statement",
                scan.table
            )));
        }
        if scan.ts_lo > scan.ts_hi {
            return Ok(Vec::new());
        }
        let buckets: Vec<Option<u32>> = if scan.buckets.is_empty() {
            vec![None]
        } else {
            scan.buckets.iter().copied().map(Some).collect()
        };

        let now = Instant::now();
        let mut pairs = Vec::new();
        for key in &scan.partition_keys {
            for bucket in &buckets {
                let id = PartitionId {
                    table: scan.table,
                    key: key.clone(),
                    bucket: *bucket,
                };
                self.purge_index(&id, now);
                if let Some(partition) = self.indexes.get(&id) {
                    pairs.extend(
                        partition
                            .range((scan.ts_lo, 0)..=(scan.ts_hi, u64::MAX))
                            .filter(|(_, expires)| is_live(**expires, now))
                            .map(|((ts, trace_id), _)| (*trace_id, *ts)),
                    );
                }
            }
        }
        pairs.sort_by(|a, b| b.1.cmp(&a.1).then(b.0.cmp(&a.0)));
        pairs.truncate(scan.limit);
        Ok(pairs)
    }

    fn select_spans(&self, trace_ids: &[u64], limit: usize) -> Vec<SpanRow> {
        let now = Instant::now();
        let mut seen = HashSet::new();
        let mut rows = Vec::new();
        for trace_id in trace_ids {
            if !seen.insert(*trace_id) {
                continue;
            }
            self.purge_spans(*trace_id, now);
            let Some(partition) = self.spans.get(trace_id) else {
                continue;
            };
            for ((ts, span_name), (bytes, expires)) in partition.iter() {
                if rows.len() >= limit {
                    return rows;
                }
                if !is_live(*expires, now) {
                    continue;
                }
                rows.push(SpanRow {
                    trace_id: *trace_id,
                    ts: *ts,
                    span_name: span_name.clone(),
                    span_bytes: bytes.clone(),
                });
            }
        }
        rows
    }

    /// Drop expired rows of one index partition, and the partition once empty
    fn purge_index(&self, id: &PartitionId, now: Instant) {
        if let Some(mut partition) = self.indexes.get_mut(id) {
            partition.retain(|_, expires| is_live(*expires, now));
        }
        self.indexes.remove_if(id, |_, partition| partition.is_empty());
    }

    fn purge_spans(&self, trace_id: u64, now: Instant) {
        if let Some(mut partition) = self.spans.get_mut(&trace_id) {
            partition.retain(|_, (_, expires)| is_live(*expires, now));
        }
        self.spans.remove_if(&trace_id, |_, partition| partition.is_empty());
    }

    fn select_names(&self, table: &'static str, partition: Option<String>, limit: usize) -> Vec<String> {
        self.names
            .get(&(table, partition))
            .map(|values| values.iter().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    fn check_traces(&self) -> Vec<SpanRow> {
        let first = self.spans.iter().next().map(|entry| *entry.key());
        first
            .map(|trace_id| self.select_spans(&[trace_id], 1))
            .unwrap_or_default()
    }
}

fn is_live(expires: Option<Instant>, now: Instant) -> bool {
    expires.is_none_or(|at| at > now)
}

#[async_trait]
impl Session for MemorySession {
    async fn execute(&self, statement: Statement) -> Result<Rows, DataError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let table = statement.table();
        self.require_table(table)?;
        if let Some(failure) = self.failures.get(table).map(|f| *f) {
            return Err(failure.to_error(table));
        }

        let rows = match statement {
            Statement::InsertSpan { row, ttl } => {
                self.insert_span(row, ttl);
                Rows::Applied
            }
            Statement::InsertIndex { row, ttl } => {
                self.require_table(row.table)?;
                self.insert_index(row, ttl);
                Rows::Applied
            }
            Statement::InsertName(row) => {
                self.insert_name(row);
                Rows::Applied
            }
            Statement::SelectTraceIds(scan) => Rows::TraceIds(self.select_trace_ids(&scan)?),
            Statement::SelectSpans { trace_ids, limit } => {
                Rows::Spans(self.select_spans(&trace_ids, limit))
            }
            Statement::SelectNames {
                table,
                partition,
                limit,
            } => Rows::Names(self.select_names(table, partition, limit)),
            Statement::CheckTraces => Rows::Spans(self.check_traces()),
        };
        Ok(rows)
    }

    async fn keyspace_metadata(&self) -> Result<KeyspaceMetadata, DataError> {
        Ok(KeyspaceMetadata {
            tables: self.tables.clone(),
            supports_multi_partition_in: self.supports_multi_partition_in,
        })
    }

    fn backend_name(&self) -> &'static str {
        BACKEND
    }
}
