//! Data storage layer
//!
//! - `session` - database client seam: statements, rows, keyspace facts
//! - `memory` - in-memory column store implementing `Session`
//! - `schema` - table names and capability probe
//! - `cache` - suppression and range caches shared by the write path
//! - `error` - unified error type for all backends

pub mod cache;
pub mod error;
pub mod memory;
pub mod schema;
pub mod session;

pub use error::DataError;
pub use memory::{InjectedFailure, MemorySession};
pub use schema::Metadata;
pub use session::{KeyspaceMetadata, Rows, Session, Statement};
