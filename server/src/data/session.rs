//! Database client seam
//!
//! The storage core never talks to a driver directly. It builds [`Statement`]s
//! and hands them to a [`Session`], which answers with [`Rows`]. The statement
//! set mirrors the column-store schema: one span row table, several
//! time-ranged index tables and a handful of low-cardinality name tables.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::data::error::DataError;

// ============================================================================
// Rows
// ============================================================================

/// One row of the `traces` table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanRow {
    /// Low 64 bits of the trace id (partition key)
    pub trace_id: u64,
    /// Span timestamp in microseconds, 0 when unknown
    pub ts: u64,
    /// Clustering key distinguishing spans (and span versions) within a trace
    pub span_name: String,
    /// Encoded span
    pub span_bytes: Vec<u8>,
}

/// One row of a time-ranged index table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRow {
    pub table: &'static str,
    pub partition_key: String,
    /// Load-spreading shard, absent for unbucketed tables
    pub bucket: Option<u32>,
    pub ts: u64,
    pub trace_id: u64,
}

/// One row of a lookup table, e.g. `span_names(service_name, span_name)`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NameRow {
    pub table: &'static str,
    /// Partition column, absent for single-column tables like `service_names`
    pub partition: Option<String>,
    pub value: String,
}

/// Scan of an index table over partition keys, buckets and a time window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceIdScan {
    pub table: &'static str,
    pub partition_keys: Vec<String>,
    /// Buckets to fan out over; empty for unbucketed tables
    pub buckets: Vec<u32>,
    pub ts_lo: u64,
    pub ts_hi: u64,
    pub limit: usize,
}

// ============================================================================
// Statements
// ============================================================================

/// Work the core asks the database to do
#[derive(Debug, Clone)]
pub enum Statement {
    InsertSpan {
        row: SpanRow,
        ttl: Option<Duration>,
    },
    InsertIndex {
        row: IndexRow,
        ttl: Option<Duration>,
    },
    InsertName(NameRow),
    /// Trace id and timestamp pairs, newest first
    SelectTraceIds(TraceIdScan),
    /// Span rows for the given trace ids, at most `limit` rows
    SelectSpans { trace_ids: Vec<u64>, limit: usize },
    /// Distinct values of a lookup table, optionally within one partition
    SelectNames {
        table: &'static str,
        partition: Option<String>,
        limit: usize,
    },
    /// Read a single span row to prove the keyspace is reachable
    CheckTraces,
}

impl Statement {
    /// Table the statement reads or writes
    pub fn table(&self) -> &'static str {
        use crate::data::schema::TRACES;
        match self {
            Self::InsertSpan { .. } | Self::SelectSpans { .. } | Self::CheckTraces => TRACES,
            Self::InsertIndex { row, .. } => row.table,
            Self::InsertName(row) => row.table,
            Self::SelectTraceIds(scan) => scan.table,
            Self::SelectNames { table, .. } => table,
        }
    }
}

/// Database answer to a [`Statement`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rows {
    Applied,
    /// `(trace_id, ts)` pairs
    TraceIds(Vec<(u64, u64)>),
    Spans(Vec<SpanRow>),
    Names(Vec<String>),
}

impl Rows {
    pub fn into_trace_ids(self, backend: &'static str) -> Result<Vec<(u64, u64)>, DataError> {
        match self {
            Self::TraceIds(pairs) => Ok(pairs),
            _ => Err(DataError::UnexpectedRows {
                backend,
                expected: "trace ids",
            }),
        }
    }

    pub fn into_spans(self, backend: &'static str) -> Result<Vec<SpanRow>, DataError> {
        match self {
            Self::Spans(rows) => Ok(rows),
            _ => Err(DataError::UnexpectedRows {
                backend,
                expected: "span rows",
            }),
        }
    }

    pub fn into_names(self, backend: &'static str) -> Result<Vec<String>, DataError> {
        match self {
            Self::Names(names) => Ok(names),
            _ => Err(DataError::UnexpectedRows {
                backend,
                expected: "names",
            }),
        }
    }
}

// ============================================================================
// Keyspace Metadata
// ============================================================================

/// Raw schema facts reported by the database
#[derive(Debug, Clone, Default)]
pub struct KeyspaceMetadata {
    /// Table name to its default row TTL in seconds (0 = none)
    pub tables: BTreeMap<String, u64>,
    /// Whether `IN` may span several partitions in one statement
    pub supports_multi_partition_in: bool,
}

// ============================================================================
// Session Trait
// ============================================================================

/// Connection to the column store
///
/// Implementations must be safe to share across tasks; dropping the future
/// returned by [`Session::execute`] must abandon the statement.
#[async_trait]
pub trait Session: Send + Sync {
    async fn execute(&self, statement: Statement) -> Result<Rows, DataError>;

    async fn keyspace_metadata(&self) -> Result<KeyspaceMetadata, DataError>;

    /// Short backend name used in errors and logs
    fn backend_name(&self) -> &'static str;
}
