//! Shared error type carrying the closed taxonomy exposed at the API
//! boundary plus the internal causes that collapse into `internal`.

/// Shared error type used across all selfserve crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// No or invalid credential. Deliberately carries no detail.
    #[error("unauthorized")]
    Unauthorized,

    /// Authenticated, but the credential's scope does not cover the request.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Schema violation, oversized payload, or unknown kind.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// A turn is already in flight for the session.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Deadline exceeded while awaiting a response.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Transient dependency failure; the caller may retry.
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("store: {0}")]
    Store(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("config: {0}")]
    Config(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The taxonomy label that crosses the API boundary.
    ///
    /// Internal causes (store, IO, JSON, ...) all collapse into
    /// `internal`; details stay in the server log, keyed by a
    /// correlation id.
    pub fn public_label(&self) -> &'static str {
        match self {
            Error::Unauthorized => "unauthorized",
            Error::Forbidden(_) => "forbidden",
            Error::BadRequest(_) => "bad_request",
            Error::Conflict(_) => "conflict",
            Error::Timeout(_) => "timeout",
            Error::Unavailable(_) | Error::Transport(_) => "unavailable",
            _ => "internal",
        }
    }

    /// HTTP status code for the taxonomy label.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Unauthorized => 401,
            Error::Forbidden(_) => 403,
            Error::BadRequest(_) => 400,
            Error::Conflict(_) => 409,
            Error::Timeout(_) => 504,
            Error::Unavailable(_) | Error::Transport(_) => 503,
            _ => 500,
        }
    }

    /// Whether a retry may succeed (network-shaped failures only).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Unavailable(_) | Error::Transport(_) | Error::Timeout(_) | Error::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_match_status_codes() {
        let cases: Vec<(Error, &str, u16)> = vec![
            (Error::Unauthorized, "unauthorized", 401),
            (Error::Forbidden("scope".into()), "forbidden", 403),
            (Error::BadRequest("field".into()), "bad_request", 400),
            (Error::Conflict("turn".into()), "conflict", 409),
            (Error::Timeout("await".into()), "timeout", 504),
            (Error::Unavailable("db".into()), "unavailable", 503),
            (Error::Store("locked".into()), "internal", 500),
            (Error::Internal("boom".into()), "internal", 500),
        ];
        for (err, label, status) in cases {
            assert_eq!(err.public_label(), label);
            assert_eq!(err.status_code(), status);
        }
    }

    #[test]
    fn internal_label_never_leaks_detail() {
        let err = Error::Store("table request_logs is locked".into());
        assert!(!err.public_label().contains("request_logs"));
    }
}
