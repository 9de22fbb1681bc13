//! Span storage and search
//!
//! - `span` / `trace_id` - span model, blob codec and id helpers
//! - `indexer` - secondary index writes with gap widening
//! - `consumer` - write side: span rows, lookup rows, index rows
//! - `query` / `select` / `store` - read side: predicates, intersection, span fetch
//! - `autocomplete` - autocomplete tag lookups
//! - `storage` - facade owning caches and schema capabilities

pub mod autocomplete;
pub mod consumer;
pub mod indexer;
pub mod query;
pub mod select;
pub mod span;
pub mod storage;
pub mod store;
pub mod trace_id;

pub use autocomplete::AutocompleteTags;
pub use consumer::SpanConsumer;
pub use query::{QueryRequest, QueryRequestBuilder};
pub use span::{Annotation, Endpoint, Kind, Span};
pub use storage::{StorageConfig, TraceStorage};
pub use store::SpanStore;
