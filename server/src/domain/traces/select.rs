//! Trace id ordering, intersection and resolution to spans
//!
//! Index scans yield `(trace_id, ts)` pairs. Several scans are combined with
//! AND semantics by [`IntersectTraceIds`]: the first scan fixes the order
//! (newest first) and every later scan only removes ids. Surviving ids are
//! resolved to spans by [`TraceSelector`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rand::Rng;

use super::query::QueryRequest;
use super::span::{self, Span};
use super::trace_id;
use crate::call::{Aggregator, Call};
use crate::data::error::DataError;
use crate::data::session::{Session, Statement};

/// Order trace ids by descending timestamp, dropping repeats.
///
/// Rows may share a timestamp, so each one gets a random 31-bit suffix
/// before sorting. Relative chronological order is unaffected.
pub fn sort_trace_ids_by_desc_timestamp(pairs: Vec<(u64, u64)>) -> Vec<u64> {
    let mut rng = rand::thread_rng();
    let mut keyed: Vec<(u128, u64)> = pairs
        .into_iter()
        .map(|(trace_id, ts)| {
            let tiebreak = u128::from(rng.gen_range(0..=i32::MAX as u32));
            ((u128::from(ts) << 31) + tiebreak, trace_id)
        })
        .collect();
    keyed.sort_unstable_by(|a, b| b.0.cmp(&a.0));

    let mut seen = HashSet::with_capacity(keyed.len());
    keyed
        .into_iter()
        .filter_map(|(_, trace_id)| seen.insert(trace_id).then_some(trace_id))
        .collect()
}

/// AND over index scans, seeded by the first scan's ordering
pub struct IntersectTraceIds;

impl Aggregator<Vec<(u64, u64)>, Vec<u64>> for IntersectTraceIds {
    fn new_output(&self) -> Vec<u64> {
        Vec::new()
    }

    fn append(&self, index: usize, input: Vec<(u64, u64)>, output: &mut Vec<u64>) {
        if index == 0 {
            *output = sort_trace_ids_by_desc_timestamp(input);
            return;
        }
        let present: HashSet<u64> = input.into_iter().map(|(trace_id, _)| trace_id).collect();
        output.retain(|trace_id| present.contains(trace_id));
    }
}

/// Resolves trace ids to spans from the `traces` table
#[derive(Clone)]
pub struct TraceSelector {
    session: Arc<dyn Session>,
    strict_trace_id: bool,
    max_trace_cols: usize,
}

impl TraceSelector {
    pub fn new(session: Arc<dyn Session>, strict_trace_id: bool, max_trace_cols: usize) -> Self {
        Self {
            session,
            strict_trace_id,
            max_trace_cols,
        }
    }

    /// Spans of one trace. In strict mode, spans whose full id differs are dropped.
    pub fn trace(&self, hex_trace_id: &str) -> Result<Call<Vec<Span>>, DataError> {
        let normalized = trace_id::normalize(hex_trace_id)?;
        let low = trace_id::lower_64_bits(&normalized)?;
        let call = self.spans(vec![low], self.max_trace_cols);
        if !self.strict_trace_id {
            return Ok(call);
        }
        Ok(call.map(move |mut spans| {
            spans.retain(|span| {
                trace_id::normalize(&span.trace_id).is_ok_and(|id| id == normalized)
            });
            spans
        }))
    }

    /// Spans of the first `limit` ids, grouped per trace in id order.
    ///
    /// In strict mode, 128-bit traces are re-checked against `request`,
    /// since the index only matched their low 64 bits.
    pub fn traces(&self, mut trace_ids: Vec<u64>, request: &QueryRequest) -> Call<Vec<Vec<Span>>> {
        if trace_ids.is_empty() {
            return Call::empty_list();
        }
        trace_ids.truncate(request.limit);
        let row_cap = trace_ids.len().saturating_mul(self.max_trace_cols);
        let strict = self.strict_trace_id;
        let order = trace_ids.clone();
        let request = request.clone();
        self.spans(trace_ids, row_cap).map(move |spans| {
            let mut traces = group_by_trace_id(spans, &order, strict);
            if strict {
                traces.retain(|trace| {
                    let is_128 = trace
                        .first()
                        .is_some_and(|s| trace_id::is_128_bit(&s.trace_id));
                    !is_128 || request.test(trace)
                });
            }
            traces
        })
    }

    fn spans(&self, trace_ids: Vec<u64>, limit: usize) -> Call<Vec<Span>> {
        let session = self.session.clone();
        Call::new("select-from-traces", move |_| {
            let session = session.clone();
            let statement = Statement::SelectSpans {
                trace_ids: trace_ids.clone(),
                limit,
            };
            async move {
                let backend = session.backend_name();
                let rows = session.execute(statement).await?.into_spans(backend)?;
                rows.iter().map(|row| span::decode(&row.span_bytes)).collect()
            }
        })
    }
}

/// Group spans per trace, ordered by position of their low 64 bits in `order`.
///
/// Strict grouping keeps 128-bit ids that share low bits apart.
fn group_by_trace_id(spans: Vec<Span>, order: &[u64], strict: bool) -> Vec<Vec<Span>> {
    let rank: HashMap<u64, usize> = order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
    let mut groups: Vec<(usize, String, Vec<Span>)> = Vec::new();
    let mut by_key: HashMap<String, usize> = HashMap::new();

    for span in spans {
        let low = trace_id::lower_64_bits(&span.trace_id).unwrap_or_default();
        let key = if strict {
            trace_id::normalize(&span.trace_id).unwrap_or_else(|_| span.trace_id.clone())
        } else {
            trace_id::to_hex(low)
        };
        match by_key.get(&key) {
            Some(slot) => groups[*slot].2.push(span),
            None => {
                let position = rank.get(&low).copied().unwrap_or(usize::MAX);
                by_key.insert(key.clone(), groups.len());
                groups.push((position, key, vec![span]));
            }
        }
    }
    groups.sort_by_key(|(position, _, _)| *position);
    groups.into_iter().map(|(_, _, spans)| spans).collect()
}
