//! Credential resolution for the authenticated surfaces.
//!
//! Three validators, tried in order, short-circuiting on success:
//!
//! 1. **Bearer JWT** — signature against the issuer's JWKS, `iss` /
//!    `aud` / `exp` with bounded leeway, algorithm whitelist.
//! 2. **Static API key** — constant-time compare against SHA-256
//!    digests computed once at startup. Web keys and tool keys are
//!    separate sets; scopes never cross.
//! 3. **Upstream-injected headers** — `x-user-id` et al., accepted
//!    only behind `trusted_proxy_enabled`.
//!
//! Failure is always the bare `unauthorized` — nothing reveals which
//! validator refused.

use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;

use selfserve_domain::config::{ApiKeyScope, AuthConfig, JwtIssuerConfig};
use selfserve_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Principal
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrincipalScope {
    WebUser,
    ToolPrincipal,
}

/// The authenticated identity a request runs as.
#[derive(Debug, Clone)]
pub struct Principal {
    pub subject: String,
    pub scope: PrincipalScope,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Resolver
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct HashedKey {
    digest: Vec<u8>,
    principal: String,
}

pub struct CredentialResolver {
    jwt: Option<JwtValidator>,
    web_keys: Vec<HashedKey>,
    tool_keys: Vec<HashedKey>,
    trusted_proxy: bool,
}

impl CredentialResolver {
    /// Hash the configured keys and set up JWKS state. Key material is
    /// dropped after hashing; only digests stay in memory.
    pub fn from_config(auth: &AuthConfig) -> Self {
        let mut web_keys = Vec::new();
        let mut tool_keys = Vec::new();

        if auth.api_keys.enabled {
            for entry in &auth.api_keys.keys {
                let hashed = HashedKey {
                    digest: Sha256::digest(entry.key.as_bytes()).to_vec(),
                    principal: entry.principal.clone(),
                };
                match entry.scope {
                    ApiKeyScope::Web => web_keys.push(hashed),
                    ApiKeyScope::Tool => tool_keys.push(hashed),
                }
            }
        }

        let jwt = if auth.jwt.enabled {
            Some(JwtValidator::new(
                &auth.jwt.issuers,
                auth.jwt.leeway_seconds,
                &auth.jwt.algorithms,
                Duration::from_secs(auth.jwt.jwks_ttl_secs),
            ))
        } else {
            None
        };

        tracing::info!(
            jwt_enabled = jwt.is_some(),
            web_keys = web_keys.len(),
            tool_keys = tool_keys.len(),
            trusted_proxy = auth.trusted_proxy_enabled,
            "credential resolver ready"
        );

        Self {
            jwt,
            web_keys,
            tool_keys,
            trusted_proxy: auth.trusted_proxy_enabled,
        }
    }

    /// Resolve a web/cli caller: bearer JWT, then bearer static key,
    /// then trusted-proxy headers.
    pub async fn resolve_web(&self, headers: &HeaderMap) -> Result<Principal> {
        if let Some(token) = bearer_token(headers) {
            if let Some(ref jwt) = self.jwt {
                if let Ok(subject) = jwt.validate(token).await {
                    return Ok(Principal {
                        subject,
                        scope: PrincipalScope::WebUser,
                    });
                }
            }
            if let Some(principal) = match_key(&self.web_keys, token) {
                return Ok(Principal {
                    subject: principal,
                    scope: PrincipalScope::WebUser,
                });
            }
        }

        if self.trusted_proxy {
            if let Some(user_id) = header_str(headers, "x-user-id") {
                return Ok(Principal {
                    subject: user_id.to_owned(),
                    scope: PrincipalScope::WebUser,
                });
            }
        }

        Err(Error::Unauthorized)
    }

    /// Resolve a tool caller from `X-API-Key`. Tool keys only — a web
    /// key presented here never authenticates.
    pub fn resolve_tool(&self, headers: &HeaderMap) -> Result<Principal> {
        let key = header_str(headers, "x-api-key").ok_or(Error::Unauthorized)?;
        match match_key(&self.tool_keys, key) {
            Some(principal) => Ok(Principal {
                subject: principal,
                scope: PrincipalScope::ToolPrincipal,
            }),
            None => Err(Error::Unauthorized),
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

/// Constant-time lookup: hash the candidate once, compare against
/// every digest. No early exit on match position within a digest.
fn match_key(keys: &[HashedKey], candidate: &str) -> Option<String> {
    let digest = Sha256::digest(candidate.as_bytes());
    let mut found: Option<String> = None;
    for key in keys {
        if bool::from(digest.ct_eq(key.digest.as_slice())) {
            found = Some(key.principal.clone());
        }
    }
    found
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// JWT validation with JWKS caching
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct CachedJwks {
    set: JwkSet,
    fetched_at: Instant,
}

struct IssuerState {
    config: JwtIssuerConfig,
    jwks: RwLock<Option<CachedJwks>>,
}

pub struct JwtValidator {
    issuers: Vec<IssuerState>,
    leeway_seconds: u64,
    algorithms: Vec<Algorithm>,
    jwks_ttl: Duration,
    http: reqwest::Client,
}

impl JwtValidator {
    fn new(
        issuers: &[JwtIssuerConfig],
        leeway_seconds: u64,
        algorithms: &[String],
        jwks_ttl: Duration,
    ) -> Self {
        let algorithms = algorithms
            .iter()
            .filter_map(|name| match name.parse::<Algorithm>() {
                Ok(alg) => Some(alg),
                Err(_) => {
                    tracing::warn!(algorithm = %name, "unknown JWT algorithm in whitelist, skipping");
                    None
                }
            })
            .collect();

        Self {
            issuers: issuers
                .iter()
                .map(|config| IssuerState {
                    config: config.clone(),
                    jwks: RwLock::new(None),
                })
                .collect(),
            leeway_seconds,
            algorithms,
            jwks_ttl,
            http: reqwest::Client::new(),
        }
    }

    /// Validate a token against every configured issuer; the first
    /// success yields the subject claim.
    pub async fn validate(&self, token: &str) -> Result<String> {
        let header = decode_header(token).map_err(|_| Error::Unauthorized)?;
        if !self.algorithms.contains(&header.alg) {
            return Err(Error::Unauthorized);
        }
        let kid = header.kid.as_deref().ok_or(Error::Unauthorized)?;

        for issuer in &self.issuers {
            let key = match self.decoding_key(issuer, kid).await {
                Some(key) => key,
                None => continue,
            };

            let mut validation = Validation::new(header.alg);
            validation.set_issuer(&[&issuer.config.issuer]);
            validation.set_audience(&[&issuer.config.audience]);
            validation.leeway = self.leeway_seconds;

            let data = match decode::<serde_json::Value>(token, &key, &validation) {
                Ok(data) => data,
                Err(_) => continue,
            };

            let subject = data
                .claims
                .get(&issuer.config.subject_claim)
                .and_then(|v| v.as_str())
                .map(str::to_owned);

            if let Some(subject) = subject {
                return Ok(subject);
            }
        }

        Err(Error::Unauthorized)
    }

    /// Key lookup with TTL'd caching and lazy refresh on `kid` miss.
    async fn decoding_key(&self, issuer: &IssuerState, kid: &str) -> Option<DecodingKey> {
        {
            let cached = issuer.jwks.read().await;
            if let Some(ref jwks) = *cached {
                if jwks.fetched_at.elapsed() < self.jwks_ttl {
                    if let Some(jwk) = jwks.set.find(kid) {
                        return DecodingKey::from_jwk(jwk).ok();
                    }
                    // Fall through: kid miss forces a refresh.
                }
            }
        }

        let fresh = match self
            .http
            .get(&issuer.config.jwks_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            Ok(response) => match response.json::<JwkSet>().await {
                Ok(set) => set,
                Err(e) => {
                    tracing::warn!(issuer = %issuer.config.issuer, error = %e, "bad JWKS document");
                    return None;
                }
            },
            Err(e) => {
                tracing::warn!(issuer = %issuer.config.issuer, error = %e, "JWKS fetch failed");
                return None;
            }
        };

        let key = fresh.find(kid).and_then(|jwk| DecodingKey::from_jwk(jwk).ok());
        *issuer.jwks.write().await = Some(CachedJwks {
            set: fresh,
            fetched_at: Instant::now(),
        });
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use selfserve_domain::config::{ApiKeyEntry, ApiKeysConfig};

    fn resolver_with_keys() -> CredentialResolver {
        let auth = AuthConfig {
            api_keys: ApiKeysConfig {
                enabled: true,
                keys: vec![
                    ApiKeyEntry {
                        key: "KEY_ALICE".into(),
                        principal: "alice".into(),
                        scope: ApiKeyScope::Web,
                    },
                    ApiKeyEntry {
                        key: "TOOL_KEY_SNOW".into(),
                        principal: "svc-snow".into(),
                        scope: ApiKeyScope::Tool,
                    },
                ],
            },
            ..AuthConfig::default()
        };
        CredentialResolver::from_config(&auth)
    }

    fn headers_with(name: &str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
            value.parse().unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn web_key_resolves_web_principal() {
        let resolver = resolver_with_keys();
        let headers = headers_with("authorization", "Bearer KEY_ALICE");
        let principal = resolver.resolve_web(&headers).await.unwrap();
        assert_eq!(principal.subject, "alice");
        assert_eq!(principal.scope, PrincipalScope::WebUser);
    }

    #[tokio::test]
    async fn wrong_bearer_is_unauthorized() {
        let resolver = resolver_with_keys();
        let headers = headers_with("authorization", "Bearer WRONG");
        assert!(matches!(
            resolver.resolve_web(&headers).await,
            Err(Error::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn scopes_do_not_cross() {
        let resolver = resolver_with_keys();

        // A tool key on the web surface fails.
        let headers = headers_with("authorization", "Bearer TOOL_KEY_SNOW");
        assert!(resolver.resolve_web(&headers).await.is_err());

        // A web key on the tool surface fails.
        let headers = headers_with("x-api-key", "KEY_ALICE");
        assert!(resolver.resolve_tool(&headers).is_err());

        // The tool key on the tool surface succeeds.
        let headers = headers_with("x-api-key", "TOOL_KEY_SNOW");
        let principal = resolver.resolve_tool(&headers).unwrap();
        assert_eq!(principal.subject, "svc-snow");
        assert_eq!(principal.scope, PrincipalScope::ToolPrincipal);
    }

    #[tokio::test]
    async fn proxy_headers_ignored_unless_trusted() {
        let resolver = resolver_with_keys();
        let headers = headers_with("x-user-id", "mallory");
        assert!(resolver.resolve_web(&headers).await.is_err());

        let auth = AuthConfig {
            trusted_proxy_enabled: true,
            ..AuthConfig::default()
        };
        let trusting = CredentialResolver::from_config(&auth);
        let principal = trusting.resolve_web(&headers).await.unwrap();
        assert_eq!(principal.subject, "mallory");
    }

    #[tokio::test]
    async fn missing_credentials_are_unauthorized() {
        let resolver = resolver_with_keys();
        assert!(resolver.resolve_web(&HeaderMap::new()).await.is_err());
        assert!(resolver.resolve_tool(&HeaderMap::new()).is_err());
    }
}
