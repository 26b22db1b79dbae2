//! Event envelope and payloads used on the substrate.
//!
//! Envelopes are CloudEvents-shaped: `id`, `source`, `type`, `subject`
//! (the session id), `time`, `datacontenttype`, and a typed JSON
//! `data` payload. Both transport strategies speak this format; the
//! direct-HTTP strategy just never assigns broker event ids to logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The four event types the core produces and consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    RequestCreated,
    RequestProcessing,
    ResponseReady,
    DatabaseUpdate,
}

impl EventType {
    /// Suffix appended to the configured type prefix / broker subject
    /// prefix (e.g. `selfserve.request.created`).
    pub fn suffix(&self) -> &'static str {
        match self {
            EventType::RequestCreated => "request.created",
            EventType::RequestProcessing => "request.processing",
            EventType::ResponseReady => "response.ready",
            EventType::DatabaseUpdate => "request.database-update",
        }
    }

    pub fn from_suffix(s: &str) -> Option<Self> {
        match s {
            "request.created" => Some(EventType::RequestCreated),
            "request.processing" => Some(EventType::RequestProcessing),
            "response.ready" => Some(EventType::ResponseReady),
            "request.database-update" => Some(EventType::DatabaseUpdate),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.suffix())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// CloudEvents-shaped envelope carried on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    pub source: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Session id the event belongs to.
    pub subject: String,
    pub time: DateTime<Utc>,
    pub datacontenttype: String,
    pub data: Value,
}

impl EventEnvelope {
    pub fn new<T: Serialize>(
        source: &str,
        event_type: &str,
        subject: &str,
        data: &T,
    ) -> Result<Self> {
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            source: source.to_owned(),
            event_type: event_type.to_owned(),
            subject: subject.to_owned(),
            time: Utc::now(),
            datacontenttype: "application/json".to_owned(),
            data: serde_json::to_value(data)?,
        })
    }

    /// Deserialize the typed payload.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).map_err(Error::Json)
    }

    /// The event type suffix after the configured prefix, if any.
    pub fn type_suffix<'a>(&'a self, prefix: &str) -> &'a str {
        self.event_type
            .strip_prefix(prefix)
            .map(|s| s.trim_start_matches('.'))
            .unwrap_or(&self.event_type)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `response.ready` data: the worker's answer for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub request_id: Uuid,
    pub session_id: Uuid,
    #[serde(default)]
    pub agent_id: Option<String>,
    pub content: String,
    #[serde(default)]
    pub metadata: Value,
}

impl AgentResponse {
    /// True when the worker produced an error response (runtime failure
    /// or deadline exceeded) rather than agent content.
    pub fn is_error(&self) -> bool {
        self.metadata
            .get("kind")
            .and_then(|v| v.as_str())
            .map(|k| k == "error")
            .unwrap_or(false)
    }
}

/// `request.processing` data: a worker picked the request up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingNotice {
    pub request_id: Uuid,
    #[serde(default)]
    pub agent_id: Option<String>,
}

/// `request.database-update` data: merge this delta into the session
/// context bag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextUpdate {
    pub session_id: Uuid,
    pub context_delta: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SurfaceKind;
    use crate::request::NormalizedRequest;

    #[test]
    fn envelope_round_trips_payload() {
        let resp = AgentResponse {
            request_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            agent_id: Some("triage".into()),
            content: "done".into(),
            metadata: serde_json::json!({"tokens": 12}),
        };
        let env = EventEnvelope::new(
            "selfserve.worker",
            "selfserve.response.ready",
            &resp.session_id.to_string(),
            &resp,
        )
        .unwrap();
        assert_eq!(env.datacontenttype, "application/json");

        let back: AgentResponse = env.payload().unwrap();
        assert_eq!(back.request_id, resp.request_id);
        assert_eq!(back.content, "done");
    }

    #[test]
    fn type_suffix_strips_prefix() {
        let req = NormalizedRequest::new("alice", SurfaceKind::Web, "hi");
        let env = EventEnvelope::new(
            "selfserve.router",
            "selfserve.request.created",
            &Uuid::new_v4().to_string(),
            &req,
        )
        .unwrap();
        assert_eq!(env.type_suffix("selfserve"), "request.created");
        assert_eq!(
            EventType::from_suffix(env.type_suffix("selfserve")),
            Some(EventType::RequestCreated)
        );
    }

    #[test]
    fn error_kind_detected_from_metadata() {
        let mut resp = AgentResponse {
            request_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            agent_id: None,
            content: "runtime deadline exceeded".into(),
            metadata: serde_json::json!({"kind": "error"}),
        };
        assert!(resp.is_error());
        resp.metadata = serde_json::json!({});
        assert!(!resp.is_error());
    }
}
