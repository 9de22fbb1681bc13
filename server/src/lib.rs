//! Storage and indexing core for a distributed-tracing backend
//!
//! - `call` - deferred, cancelable database operations and their fan-in
//! - `data` - database client seam, in-memory backend, schema probe, caches
//! - `domain` - span ingestion, secondary indexes and trace search
//! - `core` - configuration, CLI and command output

pub mod app;
pub mod call;
pub mod core;
pub mod data;
pub mod domain;
