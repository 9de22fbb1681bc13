//! Span model and blob codec
//!
//! Spans arrive from the ingestion front ends already decoded. The storage
//! core only reads the fields it indexes and keeps the whole span as an
//! opaque JSON blob in the `traces` table.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::trace_id;
use crate::data::error::DataError;

/// Client send annotation
pub const CLIENT_SEND: &str = "cs";
/// Server receive annotation
pub const SERVER_RECV: &str = "sr";

/// Protocol annotations that are never useful to search by
pub const CORE_ANNOTATIONS: &[&str] = &["cs", "cr", "ss", "sr", "ms", "mr", "ws", "wr"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Kind {
    Client,
    Server,
    Producer,
    Consumer,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl Endpoint {
    /// Endpoint for `service_name`, lowercased. Blank names are dropped.
    pub fn service(service_name: &str) -> Self {
        let name = service_name.trim();
        Self {
            service_name: (!name.is_empty()).then(|| name.to_lowercase()),
            ..Self::default()
        }
    }

    fn normalized(&self) -> Self {
        let name = self.service_name.as_deref().map(str::trim).unwrap_or_default();
        Self {
            service_name: (!name.is_empty()).then(|| name.to_lowercase()),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    /// Microseconds since epoch
    pub timestamp: u64,
    pub value: String,
}

/// A span as stored and returned by queries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Span {
    /// 16 or 32 lowercase hex characters
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<Kind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Microseconds since epoch, 0 when unknown
    #[serde(default, skip_serializing_if = "is_zero")]
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub duration: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_endpoint: Option<Endpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_endpoint: Option<Endpoint>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<Annotation>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

impl Span {
    /// Span with a normalized trace id and span id
    pub fn new(trace_id: &str, id: &str) -> Result<Self, DataError> {
        Ok(Self {
            trace_id: trace_id::normalize(trace_id)?,
            id: trace_id::normalize_span_id(id)?,
            ..Self::default()
        })
    }

    /// Copy with canonical ids and service names.
    ///
    /// Spans decoded by an ingestion codec carry whatever casing and padding
    /// the reporter used. Storage keys and strict id checks rely on the forms
    /// [`Span::new`] and [`Endpoint::service`] produce.
    pub fn normalize(&self) -> Result<Self, DataError> {
        Ok(Self {
            trace_id: trace_id::normalize(&self.trace_id)?,
            parent_id: self
                .parent_id
                .as_deref()
                .map(trace_id::normalize_span_id)
                .transpose()?,
            id: trace_id::normalize_span_id(&self.id)?,
            local_endpoint: self.local_endpoint.as_ref().map(Endpoint::normalized),
            remote_endpoint: self.remote_endpoint.as_ref().map(Endpoint::normalized),
            ..self.clone()
        })
    }

    pub fn local_service_name(&self) -> Option<&str> {
        self.local_endpoint
            .as_ref()
            .and_then(|e| e.service_name.as_deref())
    }

    pub fn remote_service_name(&self) -> Option<&str> {
        self.remote_endpoint
            .as_ref()
            .and_then(|e| e.service_name.as_deref())
    }

    /// Lowercased span name, `None` when blank
    pub fn span_name(&self) -> Option<String> {
        self.name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_lowercase)
    }

    /// Timestamp to index the span by.
    ///
    /// Falls back to the client send, then server receive annotation when
    /// the span carries no timestamp of its own.
    pub fn guess_timestamp(&self) -> Option<u64> {
        if self.timestamp != 0 {
            return Some(self.timestamp);
        }
        [CLIENT_SEND, SERVER_RECV].iter().find_map(|wanted| {
            self.annotations
                .iter()
                .find(|a| a.value == *wanted && a.timestamp != 0)
                .map(|a| a.timestamp)
        })
    }

    /// Low 64 bits of the trace id
    pub fn trace_id_low(&self) -> Result<u64, DataError> {
        trace_id::lower_64_bits(&self.trace_id)
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_parent(mut self, parent_id: &str) -> Self {
        self.parent_id = Some(parent_id.to_string());
        self
    }

    pub fn with_kind(mut self, kind: Kind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64, duration: u64) -> Self {
        self.timestamp = timestamp;
        self.duration = duration;
        self
    }

    pub fn with_local_service(mut self, service_name: &str) -> Self {
        self.local_endpoint = Some(Endpoint::service(service_name));
        self
    }

    pub fn with_remote_service(mut self, service_name: &str) -> Self {
        self.remote_endpoint = Some(Endpoint::service(service_name));
        self
    }

    pub fn with_annotation(mut self, timestamp: u64, value: &str) -> Self {
        self.annotations.push(Annotation {
            timestamp,
            value: value.to_string(),
        });
        self
    }

    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }
}

/// Encode a span for the `span_bytes` column
pub fn encode(span: &Span) -> Result<Vec<u8>, DataError> {
    Ok(serde_json::to_vec(span)?)
}

/// Decode a `span_bytes` column
pub fn decode(bytes: &[u8]) -> Result<Span, DataError> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guess_timestamp() {
        let span = Span::new("a", "b").unwrap();
        assert_eq!(span.guess_timestamp(), None);

        let span = span.with_annotation(200, "sr").with_annotation(100, "cs");
        assert_eq!(span.guess_timestamp(), Some(100));

        let span = span.with_timestamp(50, 10);
        assert_eq!(span.guess_timestamp(), Some(50));
    }

    #[test]
    fn test_service_names_are_lowercased() {
        let span = Span::new("1", "2")
            .unwrap()
            .with_local_service("Frontend")
            .with_remote_service("  ")
            .with_name(" GET ");
        assert_eq!(span.local_service_name(), Some("frontend"));
        assert_eq!(span.remote_service_name(), None);
        assert_eq!(span.span_name().as_deref(), Some("get"));
    }

    #[test]
    fn test_json_shape() {
        let span = Span::new("463ac35c9f6413ad48485a3953bb6124", "a")
            .unwrap()
            .with_kind(Kind::Server)
            .with_local_service("backend")
            .with_tag("http.method", "GET");
        let json: serde_json::Value = serde_json::from_slice(&encode(&span).unwrap()).unwrap();
        assert_eq!(json["traceId"], "463ac35c9f6413ad48485a3953bb6124");
        assert_eq!(json["id"], "000000000000000a");
        assert_eq!(json["kind"], "SERVER");
        assert_eq!(json["localEndpoint"]["serviceName"], "backend");
        assert!(json.get("timestamp").is_none());
        assert_eq!(decode(&encode(&span).unwrap()).unwrap(), span);
    }

    #[test]
    fn test_normalize_decoded_span() {
        let span: Span = serde_json::from_str(
            r#"{"traceId":"463AC35C9F6413AD","id":"A","parentId":"1",
                "localEndpoint":{"serviceName":" Frontend "},
                "remoteEndpoint":{"serviceName":"","ipv4":"10.0.0.1"}}"#,
        )
        .unwrap();
        let span = span.normalize().unwrap();
        assert_eq!(span.trace_id, "463ac35c9f6413ad");
        assert_eq!(span.id, "000000000000000a");
        assert_eq!(span.parent_id.as_deref(), Some("0000000000000001"));
        assert_eq!(span.local_service_name(), Some("frontend"));
        assert_eq!(span.remote_service_name(), None);
        assert_eq!(span.remote_endpoint.unwrap().ipv4.as_deref(), Some("10.0.0.1"));

        let mut bad = Span::new("1", "2").unwrap();
        bad.trace_id = "xyz".into();
        assert!(matches!(bad.normalize(), Err(DataError::InvalidArgument(_))));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode(b"not json"), Err(DataError::Codec(_))));
    }
}
