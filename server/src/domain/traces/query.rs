//! Trace search requests
//!
//! A [`QueryRequest`] is validated when built: names are lowercased, blank
//! strings count as absent and numeric bounds must be positive. Checks that
//! depend on the schema (annotation queries need a service name, remote
//! service queries need the remote index) happen in the span store, still
//! before any call is created.

use crate::core::constants::{DEFAULT_QUERY_LIMIT, DEFAULT_QUERY_LOOKBACK_MS};
use crate::data::error::DataError;

use super::span::Span;

/// Search criteria for [`SpanStore::get_traces`](super::store::SpanStore::get_traces)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub service_name: Option<String>,
    pub remote_service_name: Option<String>,
    pub span_name: Option<String>,
    /// Annotation values or tag keys mapped to a tag value, empty meaning
    /// "present with any value". Insertion order is kept.
    pub annotation_query: Vec<(String, String)>,
    /// Upper bound of the window, epoch milliseconds
    pub end_ts: u64,
    /// Window length in milliseconds
    pub lookback: u64,
    pub limit: usize,
}

impl QueryRequest {
    pub fn builder() -> QueryRequestBuilder {
        QueryRequestBuilder::default()
    }

    /// Window start in epoch milliseconds
    pub fn start_ts(&self) -> u64 {
        self.end_ts.saturating_sub(self.lookback)
    }

    /// Render the annotation query as `key and key=value`
    pub fn annotation_query_string(&self) -> Option<String> {
        if self.annotation_query.is_empty() {
            return None;
        }
        let parts: Vec<String> = self
            .annotation_query
            .iter()
            .map(|(key, value)| {
                if value.is_empty() {
                    key.clone()
                } else {
                    format!("{key}={value}")
                }
            })
            .collect();
        Some(parts.join(" and "))
    }

    /// Whether the spans of one trace satisfy every criterion.
    ///
    /// The trace timestamp is the root span's, else the earliest known one.
    pub fn test(&self, spans: &[Span]) -> bool {
        let mut timestamp = 0u64;
        for span in spans.iter().filter(|s| s.timestamp != 0) {
            if span.parent_id.is_none() {
                timestamp = span.timestamp;
                break;
            }
            if timestamp == 0 || timestamp > span.timestamp {
                timestamp = span.timestamp;
            }
        }
        if timestamp == 0
            || timestamp < self.start_ts().saturating_mul(1000)
            || timestamp > self.end_ts.saturating_mul(1000)
        {
            return false;
        }

        let mut service_seen = self.service_name.is_none();
        let mut span_name_pending = self.span_name.as_deref();
        let mut remote_pending = self.remote_service_name.as_deref();
        let mut remaining: Vec<&(String, String)> = self.annotation_query.iter().collect();

        for span in spans {
            let local = span.local_service_name();
            let in_scope = match self.service_name.as_deref() {
                None => true,
                Some(wanted) => local == Some(wanted),
            };
            if !in_scope {
                continue;
            }
            service_seen = true;

            remaining.retain(|(key, value)| {
                let annotated =
                    value.is_empty() && span.annotations.iter().any(|a| a.value == *key);
                let tagged = span
                    .tags
                    .get(key)
                    .is_some_and(|tag| value.is_empty() || tag == value);
                !(annotated || tagged)
            });
            if span_name_pending.is_some() && span.span_name().as_deref() == span_name_pending {
                span_name_pending = None;
            }
            if remote_pending.is_some() && span.remote_service_name() == remote_pending {
                remote_pending = None;
            }
        }

        service_seen && span_name_pending.is_none() && remote_pending.is_none() && remaining.is_empty()
    }
}

/// Builder for [`QueryRequest`]
#[derive(Debug, Clone)]
pub struct QueryRequestBuilder {
    service_name: Option<String>,
    remote_service_name: Option<String>,
    span_name: Option<String>,
    annotation_query: Vec<(String, String)>,
    end_ts: u64,
    lookback: u64,
    limit: usize,
}

impl Default for QueryRequestBuilder {
    fn default() -> Self {
        Self {
            service_name: None,
            remote_service_name: None,
            span_name: None,
            annotation_query: Vec::new(),
            end_ts: 0,
            lookback: DEFAULT_QUERY_LOOKBACK_MS,
            limit: DEFAULT_QUERY_LIMIT,
        }
    }
}

impl QueryRequestBuilder {
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    pub fn remote_service_name(mut self, name: impl Into<String>) -> Self {
        self.remote_service_name = Some(name.into());
        self
    }

    pub fn span_name(mut self, name: impl Into<String>) -> Self {
        self.span_name = Some(name.into());
        self
    }

    /// Add one annotation value (empty `value`) or tag key/value criterion
    pub fn annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        match self.annotation_query.iter_mut().find(|(k, _)| *k == key) {
            Some(existing) => existing.1 = value,
            None => self.annotation_query.push((key, value)),
        }
        self
    }

    /// Parse `"error and http.method=GET"` style criteria
    pub fn parse_annotation_query(mut self, query: &str) -> Self {
        for term in query.split(" and ") {
            let (key, value) = match term.split_once('=') {
                Some((key, value)) => (key, value),
                None => (term, ""),
            };
            self = self.annotation(key.trim(), value.trim());
        }
        self
    }

    pub fn end_ts(mut self, end_ts: u64) -> Self {
        self.end_ts = end_ts;
        self
    }

    pub fn lookback(mut self, lookback: u64) -> Self {
        self.lookback = lookback;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn build(self) -> Result<QueryRequest, DataError> {
        if self.end_ts == 0 {
            return Err(DataError::invalid_argument("end_ts <= 0"));
        }
        if self.lookback == 0 {
            return Err(DataError::invalid_argument("lookback <= 0"));
        }
        if self.limit == 0 {
            return Err(DataError::invalid_argument("limit <= 0"));
        }
        let span_name = clean(self.span_name).filter(|name| name != "all");
        let annotation_query = self
            .annotation_query
            .into_iter()
            .filter(|(key, _)| !key.is_empty())
            .collect();
        Ok(QueryRequest {
            service_name: clean(self.service_name),
            remote_service_name: clean(self.remote_service_name),
            span_name,
            annotation_query,
            end_ts: self.end_ts,
            lookback: self.lookback,
            limit: self.limit,
        })
    }
}

fn clean(name: Option<String>) -> Option<String> {
    name.map(|n| n.trim().to_lowercase()).filter(|n| !n.is_empty())
}
