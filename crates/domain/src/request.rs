//! The normalized request record — the single internal shape every
//! inbound surface converges on before dispatch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{IntegrationKind, SurfaceHandles, SurfaceKind};

/// Uniform internal record produced from any surface's raw payload.
///
/// The router assigns `request_id` and resolves `user_id` from the
/// authenticated credential — a `user_id` in the body is only ever a
/// cross-check, never a source of identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedRequest {
    pub request_id: Uuid,
    pub user_id: String,
    pub surface: SurfaceKind,
    #[serde(default)]
    pub handles: SurfaceHandles,
    pub content: String,
    /// Set when the caller forces delivery to a single kind.
    #[serde(default)]
    pub forced_integration: Option<IntegrationKind>,
    pub timestamp: DateTime<Utc>,
    /// Opaque per-surface context carried through to delivery.
    #[serde(default)]
    pub integration_context: Value,
}

impl NormalizedRequest {
    pub fn new(user_id: impl Into<String>, surface: SurfaceKind, content: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            user_id: user_id.into(),
            surface,
            handles: SurfaceHandles::default(),
            content: content.into(),
            forced_integration: None,
            timestamp: Utc::now(),
            integration_context: Value::Null,
        }
    }

    /// Validate the record against the wire bounds. Content is UTF-8 by
    /// construction; only the byte length needs checking.
    pub fn validate(&self, max_content_bytes: usize) -> Result<()> {
        if self.user_id.is_empty() {
            return Err(Error::BadRequest("user_id must not be empty".into()));
        }
        if self.content.is_empty() {
            return Err(Error::BadRequest("content must not be empty".into()));
        }
        if self.content.len() > max_content_bytes {
            return Err(Error::BadRequest(format!(
                "content exceeds {max_content_bytes} bytes"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_at_bound_passes() {
        let mut req = NormalizedRequest::new("alice", SurfaceKind::Web, "x".repeat(64));
        assert!(req.validate(64).is_ok());
        req.content.push('x');
        assert!(matches!(req.validate(64), Err(Error::BadRequest(_))));
    }

    #[test]
    fn empty_fields_reject() {
        let req = NormalizedRequest::new("", SurfaceKind::Web, "hello");
        assert!(req.validate(1024).is_err());
        let req = NormalizedRequest::new("alice", SurfaceKind::Web, "");
        assert!(req.validate(1024).is_err());
    }

    #[test]
    fn optional_fields_omitted_on_wire() {
        let req = NormalizedRequest::new("alice", SurfaceKind::Cli, "hi");
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("forced_integration").map_or(true, |v| v.is_null()));
        assert_eq!(json["surface"], "cli");
    }
}
