//! Email delivery over SMTP submission with STARTTLS.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use selfserve_domain::config::EmailIntegrationConfig;
use selfserve_domain::{EffectiveConfig, Error, Result};

use super::{DeliveryFailure, DeliveryPayload, DeliveryResult, IntegrationHandler};

pub struct EmailHandler {
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
    from: Option<Mailbox>,
    reply_to: Option<Mailbox>,
}

impl EmailHandler {
    /// Build the SMTP transport once. Credentials come from env vars
    /// named in config; the handler goes inert (terminal failures)
    /// when the relay is unconfigured.
    pub fn from_config(config: &EmailIntegrationConfig) -> Result<Self> {
        if config.smtp_host.is_empty() {
            return Ok(Self {
                transport: None,
                from: None,
                reply_to: None,
            });
        }

        let mut builder =
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
                .map_err(|e| Error::Config(format!("smtp relay: {e}")))?
                .port(config.smtp_port);

        let username = std::env::var(&config.username_env).unwrap_or_default();
        let password = std::env::var(&config.password_env).unwrap_or_default();
        if !username.is_empty() && !password.is_empty() {
            builder = builder.credentials(Credentials::new(username, password));
        }

        let from = config
            .from
            .parse::<Mailbox>()
            .map_err(|e| Error::Config(format!("email from address: {e}")))?;
        let reply_to = match config.reply_to {
            Some(ref addr) => Some(
                addr.parse::<Mailbox>()
                    .map_err(|e| Error::Config(format!("email reply-to address: {e}")))?,
            ),
            None => None,
        };

        Ok(Self {
            transport: Some(builder.build()),
            from: Some(from),
            reply_to,
        })
    }

    /// SMTP reachability probe for the auto-enable predicate.
    pub async fn probe(&self) -> bool {
        match self.transport {
            Some(ref transport) => transport.test_connection().await.unwrap_or(false),
            None => false,
        }
    }
}

#[async_trait]
impl IntegrationHandler for EmailHandler {
    async fn deliver(
        &self,
        config: &EffectiveConfig,
        payload: &DeliveryPayload,
        idempotency_key: &str,
    ) -> DeliveryResult {
        let transport = self
            .transport
            .as_ref()
            .ok_or_else(|| DeliveryFailure::terminal("smtp relay not configured"))?;
        let from = self
            .from
            .as_ref()
            .ok_or_else(|| DeliveryFailure::terminal("email from address not configured"))?;

        let to = config
            .config
            .get("address")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DeliveryFailure::terminal("email config has no address"))?
            .parse::<Mailbox>()
            .map_err(|e| DeliveryFailure::terminal(format!("bad recipient address: {e}")))?;

        let mut builder = Message::builder()
            .from(from.clone())
            .to(to)
            .subject(payload.subject.clone());
        if let Some(ref reply_to) = self.reply_to {
            builder = builder.reply_to(reply_to.clone());
        }

        let message = builder
            .header(ContentType::TEXT_PLAIN)
            .body(format!(
                "{}\n\n-- \nrequest {} · delivery {}",
                payload.body, payload.request_id, idempotency_key
            ))
            .map_err(|e| DeliveryFailure::terminal(format!("message build: {e}")))?;

        // SMTP failures are overwhelmingly transient (connection,
        // greylisting, relay hiccups); address-level problems were
        // caught above, so classify the rest retryable.
        transport
            .send(message)
            .await
            .map(|_| ())
            .map_err(|e| DeliveryFailure::retryable(format!("smtp: {e}")))
    }
}
