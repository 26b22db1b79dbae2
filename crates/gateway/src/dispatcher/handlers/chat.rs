//! Chat delivery: HMAC-signed outbound messages to the chat
//! platform's API, replying into the originating thread when the
//! session has one.

use async_trait::async_trait;

use selfserve_domain::config::ChatIntegrationConfig;
use selfserve_domain::{EffectiveConfig, Error, Result};

use crate::api::signature::sign;

use super::{classify_status, classify_transport, DeliveryFailure, DeliveryPayload, DeliveryResult, IntegrationHandler};

pub struct ChatDeliveryHandler {
    http: reqwest::Client,
    api_base_url: String,
    bot_token: Option<String>,
    signing_secret: Option<String>,
}

impl ChatDeliveryHandler {
    pub fn from_config(config: &ChatIntegrationConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Internal(format!("chat client: {e}")))?;

        Ok(Self {
            http,
            api_base_url: config.api_base_url.trim_end_matches('/').to_owned(),
            bot_token: std::env::var(&config.bot_token_env).ok().filter(|t| !t.is_empty()),
            signing_secret: std::env::var(&config.signing_secret_env)
                .ok()
                .filter(|s| !s.is_empty()),
        })
    }
}

#[async_trait]
impl IntegrationHandler for ChatDeliveryHandler {
    async fn deliver(
        &self,
        config: &EffectiveConfig,
        payload: &DeliveryPayload,
        idempotency_key: &str,
    ) -> DeliveryResult {
        if self.api_base_url.is_empty() {
            return Err(DeliveryFailure::terminal("chat api_base_url not configured"));
        }

        // Per-user channel override, else the originating channel,
        // else a DM to the user's platform identity.
        let target = config
            .config
            .get("channel")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .or_else(|| payload.handles.channel_id.clone())
            .or_else(|| payload.handles.external_user_id.clone())
            .ok_or_else(|| DeliveryFailure::terminal("no chat target for user"))?;

        let body = serde_json::json!({
            "channel": target,
            "thread_ts": payload.handles.thread_id,
            "text": payload.body,
        });
        let raw = serde_json::to_vec(&body)
            .map_err(|e| DeliveryFailure::terminal(format!("encode: {e}")))?;

        let mut request = self
            .http
            .post(format!("{}/v1/messages", self.api_base_url))
            .header("content-type", "application/json")
            .header("x-idempotency-key", idempotency_key);

        if let Some(ref token) = self.bot_token {
            request = request.bearer_auth(token);
        }
        if let Some(ref secret) = self.signing_secret {
            let timestamp = chrono::Utc::now().timestamp().to_string();
            request = request
                .header("x-signature", sign(secret, &timestamp, &raw))
                .header("x-timestamp", timestamp);
        }

        let response = request
            .body(raw)
            .send()
            .await
            .map_err(classify_transport)?;
        classify_status(response.status())
    }
}
