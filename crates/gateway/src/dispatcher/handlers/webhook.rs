//! Webhook delivery: configurable method, headers, auth, and TLS
//! verification, posting the canonical JSON envelope.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;

use selfserve_domain::config::WebhookIntegrationConfig;
use selfserve_domain::{EffectiveConfig, Error, Result};

use super::{classify_status, classify_transport, DeliveryFailure, DeliveryPayload, DeliveryResult, IntegrationHandler};

pub struct WebhookHandler {
    http: reqwest::Client,
    default_timeout: Duration,
    verify_tls_default: bool,
}

impl WebhookHandler {
    pub fn from_config(config: &WebhookIntegrationConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Internal(format!("webhook client: {e}")))?;
        Ok(Self {
            http,
            default_timeout: Duration::from_secs(config.timeout_secs),
            verify_tls_default: config.verify_tls,
        })
    }
}

#[async_trait]
impl IntegrationHandler for WebhookHandler {
    async fn deliver(
        &self,
        config: &EffectiveConfig,
        payload: &DeliveryPayload,
        idempotency_key: &str,
    ) -> DeliveryResult {
        let bag = &config.config;

        let url = bag
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DeliveryFailure::terminal("webhook config has no url"))?;

        let method = bag
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("POST")
            .parse::<Method>()
            .map_err(|_| DeliveryFailure::terminal("invalid webhook method"))?;

        let timeout = bag
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let verify_tls = bag
            .get("verify_tls")
            .and_then(|v| v.as_bool())
            .unwrap_or(self.verify_tls_default);

        // The pooled client verifies TLS; opting out needs a one-off
        // client for this destination.
        let mut request = if verify_tls {
            self.http.request(method, url)
        } else {
            let insecure = reqwest::Client::builder()
                .danger_accept_invalid_certs(true)
                .build()
                .map_err(|e| DeliveryFailure::terminal(format!("client build: {e}")))?;
            insecure.request(method, url)
        }
        .timeout(timeout)
        .header("x-idempotency-key", idempotency_key)
        .json(&serde_json::json!({
            "request_id": payload.request_id,
            "session_id": payload.session_id,
            "user_id": payload.user_id,
            "agent_id": payload.agent_id,
            "subject": payload.subject,
            "body": payload.body,
            "metadata": payload.metadata,
        }));

        if let Some(headers) = bag.get("headers").and_then(|v| v.as_object()) {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name, value);
                }
            }
        }

        if let Some(auth) = bag.get("auth").and_then(|v| v.as_object()) {
            let kind = auth.get("type").and_then(|v| v.as_str()).unwrap_or("");
            match kind {
                "bearer" => {
                    let token = auth.get("token").and_then(|v| v.as_str()).unwrap_or("");
                    request = request.bearer_auth(token);
                }
                "api_key" => {
                    let header = auth
                        .get("header")
                        .and_then(|v| v.as_str())
                        .unwrap_or("x-api-key");
                    let key = auth.get("key").and_then(|v| v.as_str()).unwrap_or("");
                    request = request.header(header, key);
                }
                "basic" => {
                    let username = auth.get("username").and_then(|v| v.as_str()).unwrap_or("");
                    let password = auth.get("password").and_then(|v| v.as_str());
                    request = request.basic_auth(username, password);
                }
                "" => {}
                other => {
                    return Err(DeliveryFailure::terminal(format!(
                        "unknown webhook auth type: {other}"
                    )))
                }
            }
        }

        let response = request.send().await.map_err(classify_transport)?;
        classify_status(response.status())
    }
}
