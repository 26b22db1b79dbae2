//! CORS policy for the router's public surface.
//!
//! Allowed origins come from config as either exact values
//! (`https://portal.example.com`) or any-port forms for local tooling
//! (`http://localhost:*`). A lone `"*"` opens everything, which is
//! only sensible in development.

use axum::http::Method;
use tower_http::cors::{AllowOrigin, CorsLayer};

use selfserve_domain::config::CorsConfig;

/// One configured origin rule.
#[derive(Debug, Clone, PartialEq, Eq)]
enum OriginPattern {
    Exact(String),
    /// Scheme+host stem; any numeric port matches.
    AnyPort(String),
}

impl OriginPattern {
    fn parse(raw: &str) -> Option<Self> {
        if raw.is_empty() {
            return None;
        }
        match raw.strip_suffix(":*") {
            Some(stem) if !stem.is_empty() => Some(OriginPattern::AnyPort(stem.to_owned())),
            Some(_) => None,
            None => Some(OriginPattern::Exact(raw.to_owned())),
        }
    }

    fn matches(&self, origin: &str) -> bool {
        match self {
            OriginPattern::Exact(allowed) => origin == allowed,
            OriginPattern::AnyPort(stem) => {
                // Split at the origin's own port separator and demand
                // an all-digit port. An attacker-controlled host like
                // `http://localhost:3000.evil.com` splits into a port
                // of `3000.evil.com` and fails the digit test.
                match origin.rsplit_once(':') {
                    Some((host, port)) => {
                        host == stem
                            && !port.is_empty()
                            && port.bytes().all(|b| b.is_ascii_digit())
                    }
                    None => false,
                }
            }
        }
    }
}

/// Build the [`CorsLayer`] from the configured allowed origins.
pub fn build_cors_layer(cors: &CorsConfig) -> CorsLayer {
    let methods = [Method::GET, Method::POST, Method::OPTIONS];
    let headers = [
        axum::http::header::CONTENT_TYPE,
        axum::http::header::AUTHORIZATION,
    ];

    if cors.allowed_origins.iter().any(|o| o == "*") {
        tracing::warn!("CORS configured with wildcard \"*\" — all origins allowed");
        return CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods(methods)
            .allow_headers(headers);
    }

    let patterns: Vec<OriginPattern> = cors
        .allowed_origins
        .iter()
        .filter_map(|raw| match OriginPattern::parse(raw) {
            Some(pattern) => Some(pattern),
            None => {
                tracing::warn!(origin = %raw, "invalid CORS origin, skipping");
                None
            }
        })
        .collect();

    let allow_origin = AllowOrigin::predicate(move |origin, _| {
        origin
            .to_str()
            .map(|value| patterns.iter().any(|pattern| pattern.matches(value)))
            .unwrap_or(false)
    });

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(methods)
        .allow_headers(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_origin_matches_itself_only() {
        let pattern = OriginPattern::parse("https://portal.example.com").unwrap();
        assert!(pattern.matches("https://portal.example.com"));
        assert!(!pattern.matches("https://portal.example.com:8443"));
        assert!(!pattern.matches("https://portal.example.com.evil.com"));
    }

    #[test]
    fn any_port_accepts_numeric_ports() {
        let pattern = OriginPattern::parse("http://localhost:*").unwrap();
        assert!(pattern.matches("http://localhost:3000"));
        assert!(pattern.matches("http://localhost:8080"));
    }

    #[test]
    fn any_port_rejects_host_suffix_spoofing() {
        let pattern = OriginPattern::parse("http://localhost:*").unwrap();
        assert!(!pattern.matches("http://localhost:3000.evil.com"));
        assert!(!pattern.matches("http://localhost.evil.com:3000"));
        assert!(!pattern.matches("http://localhost"));
        assert!(!pattern.matches("http://localhost:"));
    }

    #[test]
    fn bare_wildcard_suffix_is_invalid() {
        assert_eq!(OriginPattern::parse(":*"), None);
        assert_eq!(OriginPattern::parse(""), None);
    }

    #[test]
    fn default_config_patterns_cover_local_dev() {
        let cors = CorsConfig::default();
        let patterns: Vec<OriginPattern> = cors
            .allowed_origins
            .iter()
            .filter_map(|raw| OriginPattern::parse(raw))
            .collect();
        assert!(patterns
            .iter()
            .any(|p| p.matches("http://localhost:5173")));
        assert!(patterns
            .iter()
            .any(|p| p.matches("http://127.0.0.1:8080")));
        assert!(!patterns
            .iter()
            .any(|p| p.matches("http://attacker.example")));
    }
}
