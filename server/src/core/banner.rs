//! Command output

use super::simulate::SimulationReport;
use crate::data::schema::Metadata;
use crate::domain::traces::StorageConfig;

// Label width: "Multi-partition IN:" is 19 chars, pad to 21 for alignment
const W: usize = 21;

fn print_header(title: &str) {
    println!();
    println!(
        "  \x1b[1m\x1b[36mspanindex\x1b[0m \x1b[90mv{}\x1b[0m  {}",
        env!("CARGO_PKG_VERSION"),
        title
    );
    println!();
}

fn print_flag(label: &str, enabled: bool) {
    let (mark, value) = if enabled {
        ("\x1b[32m➜\x1b[0m", "yes")
    } else {
        ("\x1b[33m➜\x1b[0m", "no")
    };
    println!("  {mark}  \x1b[1m{label:<W$}\x1b[0m {value}");
}

fn print_value(label: &str, value: impl std::fmt::Display) {
    println!("  \x1b[32m➜\x1b[0m  \x1b[1m{label:<W$}\x1b[0m {value}");
}

/// Print schema capabilities and the effective storage settings
pub fn print_capabilities(backend: &str, metadata: &Metadata, config: &StorageConfig) {
    print_header("schema check");
    print_value("Backend:", backend);
    print_flag("Default TTL:", metadata.has_default_ttl);
    print_flag("Remote services:", metadata.has_remote_service);
    print_flag("Autocomplete tags:", metadata.has_autocomplete_tags);
    print_flag("Multi-partition IN:", metadata.supports_multi_partition_in);
    print_flag("Search:", config.search_enabled);
    print_value("Buckets:", config.bucket_count);
    if config.index_cache_max > 0 {
        print_value(
            "Gap widening:",
            format!(
                "{} keys, {}s TTL",
                config.index_cache_max, config.index_cache_ttl_secs
            ),
        );
    } else {
        print_flag("Gap widening:", false);
    }
    println!();
}

/// Print per-table write counts and the sample query result
pub fn print_simulation(report: &SimulationReport) {
    print_header("simulation");
    print_value("Spans:", report.spans);
    for (table, writes) in &report.writes {
        println!("  \x1b[90m➜  {:<W$} {}\x1b[0m", format!("{table}:"), writes);
    }
    print_value(
        "Index writes:",
        format!(
            "{} of {} ({} optimized out)",
            report.index_writes,
            report.baseline_index_writes,
            report.optimized_index_writes()
        ),
    );
    print_value("Cached ranges:", report.cached_ranges);
    print_value(
        "Sample query:",
        format!(
            "{} traces for {}",
            report.sample_traces, report.sample_service
        ),
    );
    println!();
}
