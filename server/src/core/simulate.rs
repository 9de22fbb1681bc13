//! Synthetic ingestion workload
//!
//! Generates traces over a few services, ingests them twice against fresh
//! in-memory sessions (once with gap widening as configured, once without)
//! and reports how many index writes were saved.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use rand::Rng;

use crate::data::memory::MemorySession;
use crate::data::schema::{
    ANNOTATIONS_INDEX, AUTOCOMPLETE_TAGS, REMOTE_SERVICE_NAMES, SERVICE_NAME_INDEX, SERVICE_NAMES,
    SERVICE_REMOTE_SERVICE_NAME_INDEX, SERVICE_SPAN_NAME_INDEX, SPAN_NAMES, TRACES,
};
use crate::domain::traces::{Kind, QueryRequest, Span, StorageConfig, TraceStorage, trace_id};

const INDEX_TABLES: &[&str] = &[
    SERVICE_NAME_INDEX,
    SERVICE_REMOTE_SERVICE_NAME_INDEX,
    SERVICE_SPAN_NAME_INDEX,
    ANNOTATIONS_INDEX,
];

const REPORTED_TABLES: &[&str] = &[
    TRACES,
    SERVICE_NAME_INDEX,
    SERVICE_REMOTE_SERVICE_NAME_INDEX,
    SERVICE_SPAN_NAME_INDEX,
    ANNOTATIONS_INDEX,
    SERVICE_NAMES,
    REMOTE_SERVICE_NAMES,
    SPAN_NAMES,
    AUTOCOMPLETE_TAGS,
];

#[derive(Debug, Clone, Copy)]
pub struct SimulateOptions {
    pub traces: usize,
    pub spans_per_trace: usize,
    pub services: usize,
}

#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub spans: usize,
    /// Mutations per table with the configured storage
    pub writes: BTreeMap<&'static str, u64>,
    pub index_writes: u64,
    /// Index mutations with gap widening disabled
    pub baseline_index_writes: u64,
    pub cached_ranges: usize,
    pub sample_service: String,
    pub sample_traces: usize,
}

impl SimulationReport {
    pub fn optimized_index_writes(&self) -> u64 {
        self.baseline_index_writes.saturating_sub(self.index_writes)
    }
}

pub async fn run(config: &StorageConfig, options: SimulateOptions) -> Result<SimulationReport> {
    if options.traces == 0 || options.spans_per_trace == 0 || options.services == 0 {
        anyhow::bail!("traces, spans_per_trace and services must be greater than 0");
    }
    let now_ms = u64::try_from(chrono::Utc::now().timestamp_millis())
        .context("System clock is before the epoch")?;
    let batches = generate(options, now_ms * 1000);
    let spans = batches.iter().map(Vec::len).sum();
    tracing::debug!(traces = options.traces, spans, "Generated synthetic traces");

    let (session, storage) = ingest(config.clone(), &batches).await?;
    let baseline = StorageConfig {
        index_cache_max: 0,
        ..config.clone()
    };
    let (baseline_session, _) = ingest(baseline, &batches).await?;

    let sample_service = service_name(0);
    let request = QueryRequest::builder()
        .service_name(&sample_service)
        .end_ts(now_ms + 60_000)
        .lookback(3_600_000)
        .build()?;
    let sample_traces = storage
        .span_store()
        .await?
        .get_traces(&request)?
        .execute()
        .await
        .context("Sample query failed")?
        .len();

    let writes = REPORTED_TABLES
        .iter()
        .map(|table| (*table, session.writes(table)))
        .collect();
    let index_writes = INDEX_TABLES.iter().map(|table| session.writes(table)).sum();
    let baseline_index_writes = INDEX_TABLES
        .iter()
        .map(|table| baseline_session.writes(table))
        .sum();
    let cached_ranges = storage.range_cache().map(|cache| cache.len()).unwrap_or(0);
    storage.close();

    Ok(SimulationReport {
        spans,
        writes,
        index_writes,
        baseline_index_writes,
        cached_ranges,
        sample_service,
        sample_traces,
    })
}

async fn ingest(
    config: StorageConfig,
    batches: &[Vec<Span>],
) -> Result<(Arc<MemorySession>, TraceStorage)> {
    let session = Arc::new(MemorySession::default());
    let storage = TraceStorage::new(config, session.clone())?;
    let consumer = storage.span_consumer().await?;
    for spans in batches {
        consumer
            .accept(spans)?
            .execute()
            .await
            .context("Failed to ingest synthetic trace")?;
    }
    Ok((session, storage))
}

fn service_name(index: usize) -> String {
    format!("svc-{index}")
}

/// Every trace starts at its root service and calls into random services.
/// Each trace yields two batches: its spans, then their late-arriving server
/// halves, so index keys repeat across batches.
fn generate(options: SimulateOptions, base_us: u64) -> Vec<Vec<Span>> {
    let mut rng = rand::thread_rng();
    let mut batches = Vec::with_capacity(options.traces * 2);
    for i in 0..options.traces {
        let trace_id = if i % 4 == 0 {
            format!("{:016x}{:016x}", rng.r#gen::<u64>() | 1, rng.r#gen::<u64>())
        } else {
            trace_id::to_hex(rng.r#gen::<u64>() | 1)
        };
        let start = base_us.saturating_sub((options.traces - i) as u64 * 100_000);
        let root_service = service_name(i % options.services);
        let mut spans = Vec::with_capacity(options.spans_per_trace);
        let mut late = Vec::with_capacity(options.spans_per_trace);
        for j in 0..options.spans_per_trace {
            let Ok(span) = Span::new(&trace_id, &format!("{:x}", j + 1)) else {
                continue;
            };
            let service = if j == 0 {
                root_service.clone()
            } else {
                service_name(rng.gen_range(0..options.services))
            };
            let remote = service_name(rng.gen_range(0..options.services));
            let timestamp = start + j as u64 * 1_500;
            let mut span = span
                .with_name(&format!("op-{}", j % 3))
                .with_kind(Kind::Client)
                .with_timestamp(timestamp, 400)
                .with_local_service(&service)
                .with_remote_service(&remote)
                .with_tag("env", if rng.gen_bool(0.8) { "prod" } else { "dev" });
            if j > 0 {
                span = span.with_parent("1");
            }
            if rng.gen_bool(0.1) {
                span = span.with_annotation(timestamp + 1, "retry");
            }
            late.push(
                span.clone()
                    .with_kind(Kind::Server)
                    .with_timestamp(timestamp + 400, 100),
            );
            spans.push(span);
        }
        batches.push(spans);
        batches.push(late);
    }
    batches
}
