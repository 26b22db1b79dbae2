//! Persisted data model: sessions, request logs, integration configs,
//! and delivery attempt records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Surfaces
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where a request entered the system. Immutable for the lifetime of
/// a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SurfaceKind {
    Chat,
    Web,
    Cli,
    Tool,
    Generic,
}

impl SurfaceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SurfaceKind::Chat => "chat",
            SurfaceKind::Web => "web",
            SurfaceKind::Cli => "cli",
            SurfaceKind::Tool => "tool",
            SurfaceKind::Generic => "generic",
        }
    }
}

impl std::str::FromStr for SurfaceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(SurfaceKind::Chat),
            "web" => Ok(SurfaceKind::Web),
            "cli" => Ok(SurfaceKind::Cli),
            "tool" => Ok(SurfaceKind::Tool),
            "generic" => Ok(SurfaceKind::Generic),
            other => Err(format!("unknown surface kind: {other}")),
        }
    }
}

impl std::fmt::Display for SurfaceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Surface-specific routing handles. All optional; which ones are set
/// depends on the surface kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SurfaceHandles {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Inactive,
    Completed,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Inactive => "inactive",
            SessionStatus::Completed => "completed",
            SessionStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "inactive" => Ok(SessionStatus::Inactive),
            "completed" => Ok(SessionStatus::Completed),
            "error" => Ok(SessionStatus::Error),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// The unit of conversational continuity: one user on one surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: String,
    pub surface: SurfaceKind,
    #[serde(default)]
    pub handles: SurfaceHandles,
    #[serde(default)]
    pub current_agent_id: Option<String>,
    /// Agent-runtime conversation handle, minted on the first turn.
    #[serde(default)]
    pub runtime_handle: Option<String>,
    pub status: SessionStatus,
    /// Opaque conversation context, bounded in size.
    #[serde(default)]
    pub context: Value,
    #[serde(default)]
    pub integration_metadata: Value,
    #[serde(default)]
    pub user_context: Value,
    #[serde(default)]
    pub request_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request log
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Dispatched,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Dispatched => "dispatched",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "dispatched" => Ok(RequestStatus::Dispatched),
            "completed" => Ok(RequestStatus::Completed),
            "failed" => Ok(RequestStatus::Failed),
            other => Err(format!("unknown request status: {other}")),
        }
    }
}

/// One user turn: the normalized request, and, once the worker is
/// done, the response and timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLog {
    pub id: Uuid,
    pub session_id: Uuid,
    pub request: Value,
    #[serde(default)]
    pub response: Option<Value>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub processing_ms: Option<i64>,
    /// Transport event id/type; unset on the direct-HTTP strategy.
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub event_type: Option<String>,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Integrations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Known delivery channels. A closed union — adding a kind means
/// extending every exhaustive match, which is the point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationKind {
    Chat,
    Email,
    Webhook,
    Test,
}

impl IntegrationKind {
    pub const ALL: [IntegrationKind; 4] = [
        IntegrationKind::Chat,
        IntegrationKind::Email,
        IntegrationKind::Webhook,
        IntegrationKind::Test,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationKind::Chat => "chat",
            IntegrationKind::Email => "email",
            IntegrationKind::Webhook => "webhook",
            IntegrationKind::Test => "test",
        }
    }
}

impl std::str::FromStr for IntegrationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(IntegrationKind::Chat),
            "email" => Ok(IntegrationKind::Email),
            "webhook" => Ok(IntegrationKind::Webhook),
            "test" => Ok(IntegrationKind::Test),
            other => Err(format!("unknown integration kind: {other}")),
        }
    }
}

impl std::fmt::Display for IntegrationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry spacing shape for failed deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffShape {
    Linear,
    Exponential,
}

impl BackoffShape {
    /// Delay before the given attempt (1-based) with a base delay.
    pub fn delay_secs(&self, base_secs: u64, attempt: u32) -> u64 {
        match self {
            BackoffShape::Linear => base_secs,
            BackoffShape::Exponential => {
                base_secs.saturating_mul(1u64 << attempt.saturating_sub(1).min(16))
            }
        }
    }
}

/// Per-user override of the default delivery behavior for one kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserIntegrationConfig {
    pub user_id: String,
    pub kind: IntegrationKind,
    pub enabled: bool,
    /// Kind-specific settings (webhook url, email address, ...).
    #[serde(default)]
    pub config: Value,
    pub priority: i32,
    pub retry_count: u32,
    pub retry_delay_seconds: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// System-wide fallback for a kind, seeded from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationDefault {
    pub kind: IntegrationKind,
    pub enabled: bool,
    #[serde(default)]
    pub config: Value,
    pub priority: i32,
    pub retry_count: u32,
    pub retry_delay_seconds: u64,
    pub backoff: BackoffShape,
}

/// Where an effective config came from — user override or system
/// default, never a blend of both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    User,
    Default,
}

/// The delivery configuration actually used for `(user, kind)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub kind: IntegrationKind,
    pub enabled: bool,
    #[serde(default)]
    pub config: Value,
    pub priority: i32,
    pub retry_count: u32,
    pub retry_delay_seconds: u64,
    pub backoff: BackoffShape,
    pub source: ConfigSource,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Delivery log
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryOutcome {
    Success,
    Failed,
    Pending,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Success => "success",
            DeliveryOutcome::Failed => "failed",
            DeliveryOutcome::Pending => "pending",
        }
    }
}

impl std::str::FromStr for DeliveryOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(DeliveryOutcome::Success),
            "failed" => Ok(DeliveryOutcome::Failed),
            "pending" => Ok(DeliveryOutcome::Pending),
            other => Err(format!("unknown delivery outcome: {other}")),
        }
    }
}

/// One delivery attempt. Append-only; attempt indices are contiguous
/// starting at 1 per `(request, kind)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryLog {
    pub request_id: Uuid,
    pub user_id: String,
    pub kind: IntegrationKind,
    pub attempt: u32,
    pub outcome: DeliveryOutcome,
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn surface_kind_round_trips() {
        for kind in ["chat", "web", "cli", "tool", "generic"] {
            let parsed: SurfaceKind = kind.parse().unwrap();
            assert_eq!(parsed.as_str(), kind);
        }
        assert!("slack".parse::<SurfaceKind>().is_err());
    }

    #[test]
    fn integration_kind_covers_all() {
        for kind in IntegrationKind::ALL {
            let parsed: IntegrationKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn linear_backoff_is_flat() {
        let shape = BackoffShape::Linear;
        assert_eq!(shape.delay_secs(30, 1), 30);
        assert_eq!(shape.delay_secs(30, 5), 30);
    }

    #[test]
    fn exponential_backoff_doubles() {
        let shape = BackoffShape::Exponential;
        assert_eq!(shape.delay_secs(10, 1), 10);
        assert_eq!(shape.delay_secs(10, 2), 20);
        assert_eq!(shape.delay_secs(10, 4), 80);
    }

    #[test]
    fn session_serializes_with_lowercase_enums() {
        let json = serde_json::to_value(SessionStatus::Active).unwrap();
        assert_eq!(json, serde_json::json!("active"));
        let json = serde_json::to_value(SurfaceKind::Tool).unwrap();
        assert_eq!(json, serde_json::json!("tool"));
    }
}
