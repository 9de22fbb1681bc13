// =============================================================================
// Application Identity
// =============================================================================

/// Application name in lowercase (for paths, identifiers and log filters)
pub const APP_NAME_LOWER: &str = "spanindex";

// =============================================================================
// Configuration Files
// =============================================================================

/// Config file name, looked up in the working directory
pub const CONFIG_FILE_NAME: &str = "spanindex.json";

/// Environment variable for config file path
pub const ENV_CONFIG: &str = "SPANINDEX_CONFIG";

/// Environment variable for log level/filter
pub const ENV_LOG: &str = "SPANINDEX_LOG";

// =============================================================================
// Environment Variables - Storage
// =============================================================================

pub const ENV_STRICT_TRACE_ID: &str = "SPANINDEX_STRICT_TRACE_ID";
pub const ENV_SEARCH_ENABLED: &str = "SPANINDEX_SEARCH_ENABLED";
pub const ENV_BUCKET_COUNT: &str = "SPANINDEX_BUCKET_COUNT";
pub const ENV_INDEX_CACHE_MAX: &str = "SPANINDEX_INDEX_CACHE_MAX";
pub const ENV_INDEX_CACHE_TTL_SECS: &str = "SPANINDEX_INDEX_CACHE_TTL_SECS";
pub const ENV_INDEX_FETCH_MULTIPLIER: &str = "SPANINDEX_INDEX_FETCH_MULTIPLIER";
pub const ENV_AUTOCOMPLETE_KEYS: &str = "SPANINDEX_AUTOCOMPLETE_KEYS";

// =============================================================================
// Storage Defaults
// =============================================================================

/// Physical partitions each bucketed index key is spread over
pub const DEFAULT_BUCKET_COUNT: u32 = 10;

/// Range cache capacity (keys across every index table)
pub const DEFAULT_INDEX_CACHE_MAX: usize = 100_000;

/// Range cache entry lifetime, refreshed on every touch
pub const DEFAULT_INDEX_CACHE_TTL_SECS: u64 = 60;

/// Index rows are not distinct per trace, so scans over-fetch
pub const DEFAULT_INDEX_FETCH_MULTIPLIER: usize = 3;

/// Span rows fetched per trace
pub const DEFAULT_MAX_TRACE_COLS: usize = 100_000;

/// Suppression window for service, span and remote service names
pub const DEFAULT_NAMES_TTL_SECS: u64 = 3600;

/// Distinct names remembered by the suppression cache
pub const DEFAULT_NAMES_CARDINALITY: usize = 20_000;

pub const DEFAULT_AUTOCOMPLETE_TTL_SECS: u64 = 3600;
pub const DEFAULT_AUTOCOMPLETE_CARDINALITY: usize = 20_000;

/// Span row TTL when the schema has no default (7 days)
pub const DEFAULT_SPAN_TTL_SECS: u64 = 7 * 24 * 3600;

/// Index row TTL when the schema has no default (3 days)
pub const DEFAULT_INDEX_TTL_SECS: u64 = 3 * 24 * 3600;

/// Fallbacks for a [`DelayLimiter`](crate::data::cache::DelayLimiter) built without settings
pub const DEFAULT_LIMITER_TTL_SECS: u64 = 3600;
pub const DEFAULT_LIMITER_CARDINALITY: usize = 5 * 4000;

/// Tag values longer than this are not indexed
pub const LONGEST_VALUE_TO_INDEX: usize = 256;

/// Row cap for lookup table reads
pub const MAX_NAMES: usize = 10_000;

// =============================================================================
// Query Defaults
// =============================================================================

/// Default query window (1 day)
pub const DEFAULT_QUERY_LOOKBACK_MS: u64 = 86_400_000;

pub const DEFAULT_QUERY_LIMIT: usize = 10;

// =============================================================================
// Simulation Defaults
// =============================================================================

pub const DEFAULT_SIMULATE_TRACES: usize = 200;
pub const DEFAULT_SIMULATE_SPANS_PER_TRACE: usize = 8;
pub const DEFAULT_SIMULATE_SERVICES: usize = 4;
