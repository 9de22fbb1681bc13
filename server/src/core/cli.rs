use clap::{Parser, Subcommand};

use std::path::PathBuf;

use super::constants::{
    DEFAULT_SIMULATE_SERVICES, DEFAULT_SIMULATE_SPANS_PER_TRACE, DEFAULT_SIMULATE_TRACES,
    ENV_AUTOCOMPLETE_KEYS, ENV_BUCKET_COUNT, ENV_CONFIG, ENV_INDEX_CACHE_MAX,
    ENV_INDEX_CACHE_TTL_SECS, ENV_INDEX_FETCH_MULTIPLIER, ENV_SEARCH_ENABLED,
    ENV_STRICT_TRACE_ID,
};

#[derive(Parser)]
#[command(name = "spanindex")]
#[command(version, about = "Span storage and search index", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to config file
    #[arg(long, short = 'c', global = true, env = ENV_CONFIG)]
    pub config: Option<PathBuf>,

    /// Keep 128-bit trace ids apart when their low 64 bits collide
    #[arg(long, global = true, env = ENV_STRICT_TRACE_ID)]
    pub strict_trace_id: Option<bool>,

    /// Maintain and query the secondary indexes
    #[arg(long, global = true, env = ENV_SEARCH_ENABLED)]
    pub search_enabled: Option<bool>,

    /// Buckets each index key is spread over
    #[arg(long, global = true, env = ENV_BUCKET_COUNT)]
    pub bucket_count: Option<u32>,

    /// Index range cache capacity (0 disables gap widening)
    #[arg(long, global = true, env = ENV_INDEX_CACHE_MAX)]
    pub index_cache_max: Option<usize>,

    /// Index range cache entry lifetime in seconds
    #[arg(long, global = true, env = ENV_INDEX_CACHE_TTL_SECS)]
    pub index_cache_ttl_secs: Option<u64>,

    /// Index rows fetched per requested trace
    #[arg(long, global = true, env = ENV_INDEX_FETCH_MULTIPLIER)]
    pub index_fetch_multiplier: Option<usize>,

    /// Tag keys recorded for autocomplete, comma separated
    #[arg(long, global = true, env = ENV_AUTOCOMPLETE_KEYS, value_delimiter = ',')]
    pub autocomplete_keys: Option<Vec<String>>,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Probe the schema and report its capabilities (default command)
    Check,
    /// Ingest synthetic spans into an in-memory store and report index writes
    Simulate {
        /// Number of traces to generate
        #[arg(long, default_value_t = DEFAULT_SIMULATE_TRACES)]
        traces: usize,
        /// Spans per trace
        #[arg(long, default_value_t = DEFAULT_SIMULATE_SPANS_PER_TRACE)]
        spans_per_trace: usize,
        /// Distinct services spans are spread over
        #[arg(long, default_value_t = DEFAULT_SIMULATE_SERVICES)]
        services: usize,
    },
}

/// Configuration derived from CLI arguments
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub config: Option<PathBuf>,
    pub strict_trace_id: Option<bool>,
    pub search_enabled: Option<bool>,
    pub bucket_count: Option<u32>,
    pub index_cache_max: Option<usize>,
    pub index_cache_ttl_secs: Option<u64>,
    pub index_fetch_multiplier: Option<usize>,
    pub autocomplete_keys: Option<Vec<String>>,
}

/// Parse CLI arguments and return config with command
pub fn parse() -> (CliConfig, Option<Commands>) {
    let cli = Cli::parse();
    let config = CliConfig {
        config: cli.config,
        strict_trace_id: cli.strict_trace_id,
        search_enabled: cli.search_enabled,
        bucket_count: cli.bucket_count,
        index_cache_max: cli.index_cache_max,
        index_cache_ttl_secs: cli.index_cache_ttl_secs,
        index_fetch_multiplier: cli.index_fetch_multiplier,
        autocomplete_keys: cli.autocomplete_keys,
    };
    (config, cli.command)
}
