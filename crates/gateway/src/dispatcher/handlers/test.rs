//! Console test sink: a structured log line on stdout, nothing else.

use async_trait::async_trait;

use selfserve_domain::EffectiveConfig;

use super::{DeliveryPayload, DeliveryResult, IntegrationHandler};

pub struct TestHandler;

#[async_trait]
impl IntegrationHandler for TestHandler {
    async fn deliver(
        &self,
        _config: &EffectiveConfig,
        payload: &DeliveryPayload,
        idempotency_key: &str,
    ) -> DeliveryResult {
        tracing::info!(
            target: "delivery.test",
            request_id = %payload.request_id,
            session_id = %payload.session_id,
            user_id = %payload.user_id,
            agent_id = payload.agent_id.as_deref().unwrap_or("-"),
            idempotency_key,
            body = %payload.body,
            "test delivery"
        );
        Ok(())
    }
}
