//! Table names and schema capability probe
//!
//! Capabilities are read once per storage instance. Missing optional tables
//! disable the paths that need them and are reported with a single warning;
//! only a missing core table is an error.

use crate::data::error::DataError;
use crate::data::session::{KeyspaceMetadata, Session};

pub const TRACES: &str = "traces";
pub const SERVICE_NAME_INDEX: &str = "service_name_index";
pub const SERVICE_REMOTE_SERVICE_NAME_INDEX: &str = "service_remote_service_name_index";
pub const SERVICE_SPAN_NAME_INDEX: &str = "service_span_name_index";
pub const ANNOTATIONS_INDEX: &str = "annotations_index";
pub const SERVICE_NAMES: &str = "service_names";
pub const REMOTE_SERVICE_NAMES: &str = "remote_service_names";
pub const SPAN_NAMES: &str = "span_names";
pub const AUTOCOMPLETE_TAGS: &str = "autocomplete_tags";

/// Tables every deployment must have
pub const REQUIRED_TABLES: &[&str] = &[
    TRACES,
    SERVICE_NAME_INDEX,
    SERVICE_SPAN_NAME_INDEX,
    ANNOTATIONS_INDEX,
    SERVICE_NAMES,
    SPAN_NAMES,
];

/// Capabilities that gate optional indexing and query paths
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    /// The `traces` table expires rows on its own
    pub has_default_ttl: bool,
    /// Both remote service tables exist
    pub has_remote_service: bool,
    pub has_autocomplete_tags: bool,
    /// `IN` over several partitions in one statement
    pub supports_multi_partition_in: bool,
}

impl Metadata {
    /// Derive capabilities from raw keyspace facts
    pub fn from_keyspace(keyspace: &KeyspaceMetadata) -> Result<Self, DataError> {
        let missing: Vec<&str> = REQUIRED_TABLES
            .iter()
            .copied()
            .filter(|table| !keyspace.tables.contains_key(*table))
            .collect();
        if !missing.is_empty() {
            return Err(DataError::unsupported(format!(
                "schema is missing required tables: {}",
                missing.join(", ")
            )));
        }

        let has_table = |table: &str| keyspace.tables.contains_key(table);
        Ok(Self {
            has_default_ttl: keyspace.tables.get(TRACES).is_some_and(|ttl| *ttl > 0),
            has_remote_service: has_table(SERVICE_REMOTE_SERVICE_NAME_INDEX)
                && has_table(REMOTE_SERVICE_NAMES),
            has_autocomplete_tags: has_table(AUTOCOMPLETE_TAGS),
            supports_multi_partition_in: keyspace.supports_multi_partition_in,
        })
    }

    fn warn_degraded(&self, backend: &str) {
        if !self.has_default_ttl {
            tracing::warn!(
                backend,
                table = TRACES,
                "No default TTL on the traces table; rows will be written with explicit TTLs"
            );
        }
        if !self.has_remote_service {
            tracing::warn!(
                backend,
                table = SERVICE_REMOTE_SERVICE_NAME_INDEX,
                "Remote service tables are missing; remote service indexing and queries are disabled"
            );
        }
        if !self.has_autocomplete_tags {
            tracing::warn!(
                backend,
                table = AUTOCOMPLETE_TAGS,
                "Autocomplete table is missing; autocomplete tags are disabled"
            );
        }
        if !self.supports_multi_partition_in {
            tracing::warn!(
                backend,
                "Backend cannot run IN over several partitions; queries without a service name are disabled"
            );
        }
    }
}

/// Probe the session's keyspace and log any degraded capability.
pub async fn read_metadata(session: &dyn Session) -> Result<Metadata, DataError> {
    let keyspace = session.keyspace_metadata().await?;
    let metadata = Metadata::from_keyspace(&keyspace)?;
    metadata.warn_degraded(session.backend_name());
    tracing::debug!(
        backend = session.backend_name(),
        tables = keyspace.tables.len(),
        ?metadata,
        "Read keyspace metadata"
    );
    Ok(metadata)
}
