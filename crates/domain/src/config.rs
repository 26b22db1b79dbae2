//! Workspace configuration, loaded from TOML with env overrides.
//!
//! Every field has a serde default so a minimal config file (or none)
//! still boots a dev setup: direct-HTTP transport, SQLite under
//! `./data`, API-key auth. `Config::validate()` reports issues with
//! severities; the services refuse to start on errors.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::model::BackoffShape;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub chat: ChatSurfaceConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub integrations: IntegrationsConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Router service
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_8080")]
    pub port: u16,
    #[serde(default)]
    pub cors: CorsConfig,
    /// Per-IP token-bucket rate limiting. `None` disables it.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default = "d_256")]
    pub max_concurrent: usize,
    /// How long a synchronous surface waits for `response.ready`.
    #[serde(default = "d_120")]
    pub response_timeout_secs: u64,
    /// Upper bound on normalized request content, in KiB.
    #[serde(default = "d_64")]
    pub max_content_kb: usize,
    /// The unauthenticated generic endpoint. Off unless explicitly
    /// enabled; hardened deployments keep it off.
    #[serde(default)]
    pub generic_enabled: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: 8080,
            cors: CorsConfig::default(),
            rate_limit: None,
            max_concurrent: 256,
            response_timeout_secs: 120,
            max_content_kb: 64,
            generic_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Origins allowed for CORS. Defaults to localhost-only.
    #[serde(default = "d_cors_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: d_cors_origins(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_second: u64,
    pub burst_size: u32,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Worker / dispatcher services
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_8081")]
    pub port: u16,
    /// Bound on concurrently processed `request.created` events.
    #[serde(default = "d_16")]
    pub max_in_flight: usize,
    /// Cap on internal re-dispatches when agents hand a session off.
    #[serde(default = "d_3")]
    pub routing_hop_limit: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: 8081,
            max_in_flight: 16,
            routing_hop_limit: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_8082")]
    pub port: u16,
    #[serde(default = "d_16")]
    pub max_in_flight: usize,
    /// Interval between scans of the persistent retry queue.
    #[serde(default = "d_5")]
    pub retry_tick_secs: u64,
    /// Stable instance identifier used for atomic event claims.
    /// Defaults to a random id minted at boot.
    #[serde(default)]
    pub instance_id: Option<String>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: 8082,
            max_in_flight: 16,
            retry_tick_secs: 5,
            instance_id: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Which communication substrate strategy the process boots with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportStrategy {
    Broker,
    DirectHttp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "d_strategy")]
    pub strategy: TransportStrategy,
    #[serde(default)]
    pub nats: NatsConfig,
    /// Direct-HTTP strategy: where the worker listens.
    #[serde(default = "d_worker_url")]
    pub worker_url: String,
    /// Direct-HTTP strategy: where the dispatcher listens.
    #[serde(default = "d_dispatcher_url")]
    pub dispatcher_url: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            strategy: TransportStrategy::DirectHttp,
            nats: NatsConfig::default(),
            worker_url: d_worker_url(),
            dispatcher_url: d_dispatcher_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    #[serde(default = "d_nats_url")]
    pub url: String,
    /// Subject and event-type prefix (`{prefix}.request.created`, ...).
    #[serde(default = "d_prefix")]
    pub prefix: String,
    /// Env var holding the connection token, if the broker requires one.
    #[serde(default = "d_nats_token_env")]
    pub token_env: String,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: d_nats_url(),
            prefix: d_prefix(),
            token_env: d_nats_token_env(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "d_store_path")]
    pub path: PathBuf,
    #[serde(default = "d_5000")]
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: d_store_path(),
            busy_timeout_ms: 5000,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Authentication
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub jwt: JwtConfig,
    #[serde(default)]
    pub api_keys: ApiKeysConfig,
    /// Accept `x-user-id` / `x-user-email` / `x-user-groups` injected
    /// by a trusted upstream reverse proxy. Off by default — enabling
    /// this without an actual trusted proxy is an auth bypass.
    #[serde(default)]
    pub trusted_proxy_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub issuers: Vec<JwtIssuerConfig>,
    #[serde(default = "d_30")]
    pub leeway_seconds: u64,
    /// Algorithm whitelist applied to every issuer.
    #[serde(default = "d_algorithms")]
    pub algorithms: Vec<String>,
    /// How long fetched JWKS documents stay fresh.
    #[serde(default = "d_300")]
    pub jwks_ttl_secs: u64,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            issuers: Vec::new(),
            leeway_seconds: 30,
            algorithms: d_algorithms(),
            jwks_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtIssuerConfig {
    pub issuer: String,
    pub audience: String,
    pub jwks_url: String,
    /// Claim that becomes the user id.
    #[serde(default = "d_sub")]
    pub subject_claim: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeysConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    #[serde(default)]
    pub keys: Vec<ApiKeyEntry>,
}

impl Default for ApiKeysConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keys: Vec::new(),
        }
    }
}

/// Scope of an API key. Web keys authenticate human users on the
/// web/cli surfaces; tool keys authenticate system principals on the
/// tool surface. Scopes never cross.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyScope {
    Web,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyEntry {
    /// The literal key. Only its SHA-256 digest is kept in memory
    /// after startup.
    pub key: String,
    /// User id (web scope) or system principal (tool scope).
    pub principal: String,
    pub scope: ApiKeyScope,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Chat surface
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSurfaceConfig {
    /// Env var holding the platform signing secret.
    #[serde(default = "d_chat_secret_env")]
    pub signing_secret_env: String,
    /// Reject signed payloads whose timestamp is further than this
    /// from wall clock.
    #[serde(default = "d_300")]
    pub timestamp_tolerance_secs: u64,
    /// TTL for the inbound event-id dedupe window.
    #[serde(default = "d_3600")]
    pub dedupe_ttl_secs: u64,
}

impl Default for ChatSurfaceConfig {
    fn default() -> Self {
        Self {
            signing_secret_env: d_chat_secret_env(),
            timestamp_tolerance_secs: 300,
            dedupe_ttl_secs: 3600,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session lifecycle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// A session past this idle window is not reused and is swept to
    /// `inactive`.
    #[serde(default = "d_30")]
    pub idle_ttl_minutes: u64,
    /// Hard retention bound; sessions idle past it are closed.
    #[serde(default = "d_72")]
    pub retention_hours: u64,
    #[serde(default = "d_60")]
    pub sweep_interval_secs: u64,
    /// Upper bound on the serialized session context bag, in KiB.
    #[serde(default = "d_32")]
    pub max_context_kb: usize,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            idle_ttl_minutes: 30,
            retention_hours: 72,
            sweep_interval_secs: 60,
            max_context_kb: 32,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent runtime boundary
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "d_runtime_url")]
    pub base_url: String,
    /// Hard deadline on a single runtime invocation.
    #[serde(default = "d_60")]
    pub timeout_secs: u64,
    /// Retries on transport errors only; semantic errors are terminal.
    #[serde(default = "d_2")]
    pub max_retries: u32,
    /// Default agent for sessions with no routing decision yet.
    #[serde(default = "d_default_agent")]
    pub default_agent_id: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            base_url: d_runtime_url(),
            timeout_secs: 60,
            max_retries: 2,
            default_agent_id: d_default_agent(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Integration defaults
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IntegrationsConfig {
    #[serde(default)]
    pub chat: ChatIntegrationConfig,
    #[serde(default)]
    pub email: EmailIntegrationConfig,
    #[serde(default)]
    pub webhook: WebhookIntegrationConfig,
    #[serde(default)]
    pub test: TestIntegrationConfig,
}

impl IntegrationsConfig {
    /// Materialize the system-wide fallbacks the store overlays user
    /// rows on. Transport-level settings (SMTP relay, chat API) stay
    /// out of the per-user config bags — handlers own those.
    pub fn defaults(&self) -> Vec<crate::model::IntegrationDefault> {
        use crate::model::{IntegrationDefault, IntegrationKind};

        let entry = |kind, enabled, policy: &DeliveryPolicy| IntegrationDefault {
            kind,
            enabled,
            config: serde_json::json!({}),
            priority: policy.priority,
            retry_count: policy.retry_count,
            retry_delay_seconds: policy.retry_delay_seconds,
            backoff: policy.backoff,
        };

        vec![
            entry(IntegrationKind::Chat, self.chat.enabled, &self.chat.policy),
            entry(IntegrationKind::Email, self.email.enabled, &self.email.policy),
            entry(IntegrationKind::Webhook, self.webhook.enabled, &self.webhook.policy),
            entry(IntegrationKind::Test, self.test.enabled, &self.test.policy),
        ]
    }
}

/// Retry/priority knobs shared by every integration default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryPolicy {
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "d_3u32")]
    pub retry_count: u32,
    #[serde(default = "d_30")]
    pub retry_delay_seconds: u64,
    #[serde(default = "d_backoff")]
    pub backoff: BackoffShape,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            priority: 0,
            retry_count: 3,
            retry_delay_seconds: 30,
            backoff: BackoffShape::Linear,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatIntegrationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(flatten)]
    pub policy: DeliveryPolicy,
    #[serde(default)]
    pub api_base_url: String,
    #[serde(default = "d_chat_bot_token_env")]
    pub bot_token_env: String,
    #[serde(default = "d_chat_secret_env")]
    pub signing_secret_env: String,
}

impl Default for ChatIntegrationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            policy: DeliveryPolicy {
                priority: 100,
                ..DeliveryPolicy::default()
            },
            api_base_url: String::new(),
            bot_token_env: d_chat_bot_token_env(),
            signing_secret_env: d_chat_secret_env(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailIntegrationConfig {
    #[serde(default)]
    pub enabled: bool,
    /// When set, enablement additionally requires the SMTP relay to be
    /// reachable at dispatcher boot.
    #[serde(default = "d_true")]
    pub auto_enable: bool,
    #[serde(flatten)]
    pub policy: DeliveryPolicy,
    #[serde(default)]
    pub smtp_host: String,
    #[serde(default = "d_587")]
    pub smtp_port: u16,
    #[serde(default = "d_smtp_user_env")]
    pub username_env: String,
    #[serde(default = "d_smtp_pass_env")]
    pub password_env: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub reply_to: Option<String>,
}

impl Default for EmailIntegrationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            auto_enable: true,
            policy: DeliveryPolicy {
                priority: 50,
                ..DeliveryPolicy::default()
            },
            smtp_host: String::new(),
            smtp_port: 587,
            username_env: d_smtp_user_env(),
            password_env: d_smtp_pass_env(),
            from: String::new(),
            reply_to: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookIntegrationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(flatten)]
    pub policy: DeliveryPolicy,
    #[serde(default = "d_10")]
    pub timeout_secs: u64,
    #[serde(default = "d_true")]
    pub verify_tls: bool,
}

impl Default for WebhookIntegrationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            policy: DeliveryPolicy {
                priority: 10,
                ..DeliveryPolicy::default()
            },
            timeout_secs: 10,
            verify_tls: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestIntegrationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(flatten)]
    pub policy: DeliveryPolicy,
}

impl Default for TestIntegrationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            policy: DeliveryPolicy {
                priority: 0,
                retry_count: 0,
                ..DeliveryPolicy::default()
            },
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        let mut err = |field: &str, message: String| {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: field.into(),
                message,
            });
        };

        if self.router.port == 0 {
            err("router.port", "port must be greater than 0".into());
        }
        if self.router.host.is_empty() {
            err("router.host", "host must not be empty".into());
        }
        if self.router.max_content_kb == 0 {
            err("router.max_content_kb", "content bound must be > 0".into());
        }

        if self.transport.strategy == TransportStrategy::Broker {
            if self.transport.nats.url.is_empty() {
                err("transport.nats.url", "broker strategy needs a NATS url".into());
            }
            if self.transport.nats.prefix.is_empty() {
                err("transport.nats.prefix", "subject prefix must not be empty".into());
            }
        } else {
            for (field, url) in [
                ("transport.worker_url", &self.transport.worker_url),
                ("transport.dispatcher_url", &self.transport.dispatcher_url),
            ] {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    err(field, format!("must start with http:// or https:// (got \"{url}\")"));
                }
            }
        }

        if !self.runtime.base_url.starts_with("http://")
            && !self.runtime.base_url.starts_with("https://")
        {
            err(
                "runtime.base_url",
                format!(
                    "must start with http:// or https:// (got \"{}\")",
                    self.runtime.base_url
                ),
            );
        }

        if self.auth.jwt.enabled && self.auth.jwt.issuers.is_empty() {
            err("auth.jwt.issuers", "jwt enabled but no issuers configured".into());
        }
        for (i, issuer) in self.auth.jwt.issuers.iter().enumerate() {
            if issuer.jwks_url.is_empty() {
                err(
                    &format!("auth.jwt.issuers[{i}].jwks_url"),
                    "jwks_url must not be empty".into(),
                );
            }
        }
        for (i, entry) in self.auth.api_keys.keys.iter().enumerate() {
            if entry.key.is_empty() {
                err(&format!("auth.api_keys.keys[{i}].key"), "key must not be empty".into());
            }
            if entry.principal.is_empty() {
                err(
                    &format!("auth.api_keys.keys[{i}].principal"),
                    "principal must not be empty".into(),
                );
            }
        }

        if self.integrations.email.enabled && self.integrations.email.smtp_host.is_empty() {
            err(
                "integrations.email.smtp_host",
                "email integration enabled but smtp_host is empty".into(),
            );
        }
        if self.integrations.email.enabled && self.integrations.email.from.is_empty() {
            err(
                "integrations.email.from",
                "email integration enabled but from address is empty".into(),
            );
        }
        if self.integrations.chat.enabled && self.integrations.chat.api_base_url.is_empty() {
            err(
                "integrations.chat.api_base_url",
                "chat integration enabled but api_base_url is empty".into(),
            );
        }

        if self.router.generic_enabled {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "router.generic_enabled".into(),
                message: "the unauthenticated generic endpoint is enabled".into(),
            });
        }
        if !self.auth.jwt.enabled && self.auth.api_keys.keys.is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "auth".into(),
                message: "no JWT issuers and no API keys — only chat/generic surfaces will work"
                    .into(),
            });
        }

        errors
    }

    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: &std::path::Path) -> crate::error::Result<Self> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| crate::error::Error::Config(e.to_string()))
    }

    pub fn max_content_bytes(&self) -> usize {
        self.router.max_content_kb * 1024
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// serde default helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_8080() -> u16 {
    8080
}
fn d_8081() -> u16 {
    8081
}
fn d_8082() -> u16 {
    8082
}
fn d_587() -> u16 {
    587
}
fn d_2() -> u32 {
    2
}
fn d_3() -> u32 {
    3
}
fn d_3u32() -> u32 {
    3
}
fn d_5() -> u64 {
    5
}
fn d_10() -> u64 {
    10
}
fn d_16() -> usize {
    16
}
fn d_30() -> u64 {
    30
}
fn d_32() -> usize {
    32
}
fn d_60() -> u64 {
    60
}
fn d_64() -> usize {
    64
}
fn d_72() -> u64 {
    72
}
fn d_120() -> u64 {
    120
}
fn d_256() -> usize {
    256
}
fn d_300() -> u64 {
    300
}
fn d_3600() -> u64 {
    3600
}
fn d_5000() -> u64 {
    5000
}
fn d_true() -> bool {
    true
}
fn d_sub() -> String {
    "sub".into()
}
fn d_algorithms() -> Vec<String> {
    vec!["RS256".into(), "ES256".into()]
}
fn d_backoff() -> BackoffShape {
    BackoffShape::Linear
}
fn d_strategy() -> TransportStrategy {
    TransportStrategy::DirectHttp
}
fn d_cors_origins() -> Vec<String> {
    vec!["http://localhost:*".into(), "http://127.0.0.1:*".into()]
}
fn d_nats_url() -> String {
    "nats://127.0.0.1:4222".into()
}
fn d_prefix() -> String {
    "selfserve".into()
}
fn d_nats_token_env() -> String {
    "SELFSERVE_NATS_TOKEN".into()
}
fn d_worker_url() -> String {
    "http://127.0.0.1:8081".into()
}
fn d_dispatcher_url() -> String {
    "http://127.0.0.1:8082".into()
}
fn d_store_path() -> PathBuf {
    PathBuf::from("./data/selfserve.db")
}
fn d_runtime_url() -> String {
    "http://127.0.0.1:9090".into()
}
fn d_default_agent() -> String {
    "default".into()
}
fn d_chat_secret_env() -> String {
    "SELFSERVE_CHAT_SIGNING_SECRET".into()
}
fn d_chat_bot_token_env() -> String {
    "SELFSERVE_CHAT_BOT_TOKEN".into()
}
fn d_smtp_user_env() -> String {
    "SELFSERVE_SMTP_USERNAME".into()
}
fn d_smtp_pass_env() -> String {
    "SELFSERVE_SMTP_PASSWORD".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_with_warnings_only() {
        let config = Config::default();
        let issues = config.validate();
        assert!(issues.iter().all(|i| i.severity == ConfigSeverity::Warning));
    }

    #[test]
    fn empty_toml_parses_to_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.router.port, 8080);
        assert_eq!(config.transport.strategy, TransportStrategy::DirectHttp);
        assert!(!config.router.generic_enabled);
    }

    #[test]
    fn broker_strategy_requires_nats_url() {
        let mut config = Config::default();
        config.transport.strategy = TransportStrategy::Broker;
        config.transport.nats.url = String::new();
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error && i.field == "transport.nats.url"));
    }

    #[test]
    fn integration_policy_flattens_in_toml() {
        let raw = r#"
            [integrations.webhook]
            enabled = true
            priority = 20
            retry_count = 5
            retry_delay_seconds = 10
            backoff = "exponential"
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert!(config.integrations.webhook.enabled);
        assert_eq!(config.integrations.webhook.policy.retry_count, 5);
        assert_eq!(
            config.integrations.webhook.policy.backoff,
            BackoffShape::Exponential
        );
    }

    #[test]
    fn jwt_enabled_without_issuers_is_an_error() {
        let mut config = Config::default();
        config.auth.jwt.enabled = true;
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error && i.field == "auth.jwt.issuers"));
    }
}
