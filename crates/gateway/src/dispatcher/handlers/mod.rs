//! Delivery handlers — one per integration kind, behind a common
//! contract.
//!
//! The kind union is closed, so the kind → handler table is an
//! exhaustive match: adding a kind without wiring a handler is a
//! compile error, not a runtime surprise.

pub mod chat;
pub mod email;
pub mod test;
pub mod webhook;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use selfserve_domain::{Config, EffectiveConfig, IntegrationKind, Result, SurfaceHandles};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The canonical delivery envelope handed to every handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryPayload {
    pub request_id: Uuid,
    pub session_id: Uuid,
    pub user_id: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub metadata: Value,
    /// Originating surface handles (chat replies thread back here).
    #[serde(default)]
    pub handles: SurfaceHandles,
}

/// Why a delivery attempt failed, and whether another attempt could
/// succeed. Network failures, 5xx, and 429 are retryable; other 4xx
/// and configuration problems are terminal.
#[derive(Debug)]
pub struct DeliveryFailure {
    pub message: String,
    pub retryable: bool,
}

impl DeliveryFailure {
    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }
}

impl std::fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

pub type DeliveryResult = std::result::Result<(), DeliveryFailure>;

#[async_trait]
pub trait IntegrationHandler: Send + Sync {
    async fn deliver(
        &self,
        config: &EffectiveConfig,
        payload: &DeliveryPayload,
        idempotency_key: &str,
    ) -> DeliveryResult;
}

/// Classify an HTTP status from a delivery target.
pub fn classify_status(status: reqwest::StatusCode) -> DeliveryResult {
    if status.is_success() {
        return Ok(());
    }
    let message = format!("upstream returned {status}");
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        Err(DeliveryFailure::retryable(message))
    } else {
        Err(DeliveryFailure::terminal(message))
    }
}

/// Classify a reqwest transport error.
pub fn classify_transport(e: reqwest::Error) -> DeliveryFailure {
    if e.is_timeout() || e.is_connect() {
        DeliveryFailure::retryable(format!("network: {e}"))
    } else {
        DeliveryFailure::terminal(format!("request: {e}"))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler table
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct HandlerSet {
    chat: chat::ChatDeliveryHandler,
    email: email::EmailHandler,
    webhook: webhook::WebhookHandler,
    test: test::TestHandler,
}

impl HandlerSet {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            chat: chat::ChatDeliveryHandler::from_config(&config.integrations.chat)?,
            email: email::EmailHandler::from_config(&config.integrations.email)?,
            webhook: webhook::WebhookHandler::from_config(&config.integrations.webhook)?,
            test: test::TestHandler,
        })
    }

    /// Route a work item to its kind's handler. The idempotency key
    /// `{request_id}:{kind}:{attempt}` lets receivers deduplicate
    /// across our at-least-once retries.
    pub async fn deliver(
        &self,
        config: &EffectiveConfig,
        payload: &DeliveryPayload,
        attempt: u32,
    ) -> DeliveryResult {
        let idempotency_key = format!("{}:{}:{attempt}", payload.request_id, config.kind);
        match config.kind {
            IntegrationKind::Chat => self.chat.deliver(config, payload, &idempotency_key).await,
            IntegrationKind::Email => self.email.deliver(config, payload, &idempotency_key).await,
            IntegrationKind::Webhook => {
                self.webhook.deliver(config, payload, &idempotency_key).await
            }
            IntegrationKind::Test => self.test.deliver(config, payload, &idempotency_key).await,
        }
    }

    /// SMTP reachability probe backing the email auto-enable
    /// predicate.
    pub async fn email_reachable(&self) -> bool {
        self.email.probe().await
    }
}
