//! Domain logic for trace storage
//!
//! - `traces` - span ingestion, secondary indexes and trace search

pub mod traces;

pub use traces::{QueryRequest, Span, SpanConsumer, SpanStore, StorageConfig, TraceStorage};
