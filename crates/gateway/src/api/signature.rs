//! Chat-platform request signing.
//!
//! The platform signs `v0:{timestamp}:{raw_body}` with HMAC-SHA256
//! and sends the hex digest in `X-Signature` (optionally prefixed
//! `v0=`) plus the timestamp in `X-Timestamp`. Verification is
//! constant-time, and payloads older or newer than the tolerance
//! window are rejected outright to blunt replay.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use selfserve_domain::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

pub fn verify_signature(
    secret: &str,
    timestamp: &str,
    signature: &str,
    body: &[u8],
    tolerance_secs: u64,
) -> Result<()> {
    let ts: i64 = timestamp.parse().map_err(|_| Error::Unauthorized)?;
    let now = chrono::Utc::now().timestamp();
    if (now - ts).unsigned_abs() > tolerance_secs {
        return Err(Error::Unauthorized);
    }

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(format!("v0:{timestamp}:").as_bytes());
    mac.update(body);
    let computed = hex::encode(mac.finalize().into_bytes());

    let provided = signature.strip_prefix("v0=").unwrap_or(signature);

    // Constant-time comparison to prevent timing attacks.
    if computed.as_bytes().ct_eq(provided.as_bytes()).unwrap_u8() != 1 {
        return Err(Error::Unauthorized);
    }
    Ok(())
}

/// Compute the signature the way the platform does — used for
/// outbound chat deliveries and in tests.
pub fn sign(secret: &str, timestamp: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(format!("v0:{timestamp}:").as_bytes());
    mac.update(body);
    format!("v0={}", hex::encode(mac.finalize().into_bytes()))
}
