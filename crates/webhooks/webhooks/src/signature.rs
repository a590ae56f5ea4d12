//! HMAC signature generation and verification.
//!
//! Signatures are computed over `"<unix_ts>.<payload>"` and rendered as a
//! header value of the form `t=<unix_ts>,v1=<hex_digest>`, so receivers can
//! recompute the digest, compare it in constant time and reject stale
//! timestamps.

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{WebhookError, WebhookResult};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the `t=<ts>,v1=<hex>` signature.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Signature version for webhook payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignatureVersion {
    /// Version 1: HMAC-SHA256
    #[default]
    V1,
}

impl SignatureVersion {
    /// Key used for this version inside the signature header.
    pub fn key(&self) -> &'static str {
        match self {
            SignatureVersion::V1 => "v1",
        }
    }
}

/// Webhook signer for generating and verifying signatures.
///
/// The MAC is keyed once at construction; an empty or blank secret is
/// rejected there, so a constructed signer can always sign.
#[derive(Clone)]
pub struct WebhookSigner {
    mac: HmacSha256,
    version: SignatureVersion,
}

impl std::fmt::Debug for WebhookSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookSigner")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl WebhookSigner {
    /// Creates a new signer with the given secret.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::Configuration`] if the secret is empty or blank.
    pub fn new(secret: &str) -> WebhookResult<Self> {
        Self::with_version(secret, SignatureVersion::V1)
    }

    /// Creates a signer with a specific version.
    pub fn with_version(secret: &str, version: SignatureVersion) -> WebhookResult<Self> {
        if secret.trim().is_empty() {
            return Err(WebhookError::Configuration(
                "webhook secret must not be empty".to_string(),
            ));
        }

        let mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| WebhookError::Configuration(format!("unusable webhook secret: {e}")))?;

        Ok(Self { mac, version })
    }

    /// Generates the hex digest for the given payload and timestamp.
    pub fn sign(&self, timestamp: i64, payload: &[u8]) -> String {
        match self.version {
            SignatureVersion::V1 => self.sign_v1(timestamp, payload),
        }
    }

    /// Generates a full signature header value.
    pub fn sign_header(&self, timestamp: i64, payload: &[u8]) -> String {
        let signature = self.sign(timestamp, payload);
        format!("t={},{}={}", timestamp, self.version.key(), signature)
    }

    /// Verifies a signature against the payload.
    pub fn verify(&self, signature: &str, timestamp: i64, payload: &[u8]) -> bool {
        let expected = self.sign(timestamp, payload);
        constant_time_compare(&expected, signature)
    }

    /// Parses and verifies a signature header.
    ///
    /// `now` is the receiver's current unix time; headers whose timestamp is
    /// further than `tolerance_secs` away from it are rejected as expired.
    pub fn verify_header(
        &self,
        header: &str,
        payload: &[u8],
        now: i64,
        tolerance_secs: i64,
    ) -> Result<(), SignatureError> {
        let parts = parse_signature_header(header)?;

        let timestamp = parts
            .get("t")
            .and_then(|t| t.parse::<i64>().ok())
            .ok_or(SignatureError::InvalidFormat)?;

        let skew = now.checked_sub(timestamp).map(i64::unsigned_abs);
        if skew.is_none_or(|skew| skew > tolerance_secs.max(0).unsigned_abs()) {
            return Err(SignatureError::Expired);
        }

        let signature = parts
            .get(self.version.key())
            .ok_or(SignatureError::InvalidFormat)?;
        if !self.verify(signature, timestamp, payload) {
            return Err(SignatureError::Invalid);
        }

        Ok(())
    }

    fn sign_v1(&self, timestamp: i64, payload: &[u8]) -> String {
        let mut mac = self.mac.clone();

        // Sign: timestamp.payload
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);

        hex::encode(mac.finalize().into_bytes())
    }
}

/// Signs `payload` with `secret` at `timestamp`, returning the header value.
///
/// # Errors
///
/// Returns [`WebhookError::Configuration`] if the secret is empty or blank.
pub fn sign(secret: &str, payload: &[u8], timestamp: i64) -> WebhookResult<String> {
    Ok(WebhookSigner::new(secret)?.sign_header(timestamp, payload))
}

/// Signature verification errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    /// Invalid signature format.
    #[error("Invalid signature format")]
    InvalidFormat,
    /// Signature is invalid.
    #[error("Invalid signature")]
    Invalid,
    /// Signature has expired.
    #[error("Signature expired")]
    Expired,
}

impl From<SignatureError> for WebhookError {
    fn from(err: SignatureError) -> Self {
        match err {
            SignatureError::InvalidFormat | SignatureError::Invalid => {
                WebhookError::InvalidSignature
            }
            SignatureError::Expired => WebhookError::ExpiredSignature,
        }
    }
}

/// Parses a signature header into its components.
fn parse_signature_header(header: &str) -> Result<HashMap<&str, &str>, SignatureError> {
    let mut parts = HashMap::new();

    for part in header.split(',') {
        let (key, value) = part
            .trim()
            .split_once('=')
            .ok_or(SignatureError::InvalidFormat)?;
        parts.insert(key, value);
    }

    Ok(parts)
}

/// Constant-time string comparison to prevent timing attacks.
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let signer = WebhookSigner::new("test-secret").unwrap();
        let payload = b"test payload";
        let timestamp = 1234567890;

        let signature = signer.sign(timestamp, payload);
        assert!(signer.verify(&signature, timestamp, payload));

        // Wrong payload should fail
        assert!(!signer.verify(&signature, timestamp, b"wrong payload"));

        // Wrong timestamp should fail
        assert!(!signer.verify(&signature, timestamp + 1, payload));
    }

    #[test]
    fn test_sign_is_deterministic() {
        let a = sign("s3cr3t", b"{\"id\":\"e1\"}", 1700000000).unwrap();
        let b = sign("s3cr3t", b"{\"id\":\"e1\"}", 1700000000).unwrap();
        assert_eq!(a, b);

        let other_key = sign("other", b"{\"id\":\"e1\"}", 1700000000).unwrap();
        assert_ne!(a, other_key);
    }

    #[test]
    fn test_sign_header_format() {
        let header = sign("test-secret", b"test payload", 1234567890).unwrap();
        let digest = header.strip_prefix("t=1234567890,v1=").unwrap();

        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_empty_secret_is_configuration_error() {
        assert!(matches!(
            sign("", b"payload", 1),
            Err(WebhookError::Configuration(_))
        ));
        assert!(matches!(
            WebhookSigner::new("   "),
            Err(WebhookError::Configuration(_))
        ));
    }

    #[test]
    fn test_verify_header() {
        let signer = WebhookSigner::new("test-secret").unwrap();
        let payload = b"test payload";
        let now = chrono::Utc::now().timestamp();

        let header = signer.sign_header(now, payload);
        assert!(signer.verify_header(&header, payload, now, 300).is_ok());
        assert_eq!(
            signer.verify_header(&header, b"tampered", now, 300),
            Err(SignatureError::Invalid)
        );
    }

    #[test]
    fn test_expired_signature() {
        let signer = WebhookSigner::new("test-secret").unwrap();
        let payload = b"test payload";
        let now = chrono::Utc::now().timestamp();
        let old_timestamp = now - 600; // 10 minutes ago

        let header = signer.sign_header(old_timestamp, payload);
        let result = signer.verify_header(&header, payload, now, 300); // 5 minute tolerance
        assert_eq!(result, Err(SignatureError::Expired));
    }

    #[test]
    fn test_extreme_timestamps_are_expired() {
        let signer = WebhookSigner::new("test-secret").unwrap();
        let now = chrono::Utc::now().timestamp();

        for timestamp in [i64::MIN, i64::MAX] {
            let header = format!("t={timestamp},v1=00");
            assert_eq!(
                signer.verify_header(&header, b"{}", now, 300),
                Err(SignatureError::Expired)
            );
        }
        assert_eq!(
            signer.verify_header(&format!("t={},v1=00", i64::MAX), b"{}", i64::MIN, 300),
            Err(SignatureError::Expired)
        );
    }

    #[test]
    fn test_malformed_header() {
        let signer = WebhookSigner::new("test-secret").unwrap();
        assert_eq!(
            signer.verify_header("garbage", b"x", 0, 300),
            Err(SignatureError::InvalidFormat)
        );
        assert_eq!(
            signer.verify_header("t=0", b"x", 0, 300),
            Err(SignatureError::InvalidFormat)
        );
    }
}
