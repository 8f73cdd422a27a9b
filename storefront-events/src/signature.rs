//! Relay callback signature verification.
//!
//! The relay signs every callback with HMAC-SHA256 over the exact request
//! bytes. Verification runs on the raw body before anything parses it; a
//! parsed-then-reserialized body would not be the byte sequence that was
//! signed.
//!
//! Accepted header forms:
//! - `sha256=<hexdigest>`
//! - `<hexdigest>`

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// Length of an HMAC-SHA256 digest in bytes.
const DIGEST_LEN: usize = 32;

/// Algorithm prefix accepted in the signature header.
const ALGORITHM: &str = "sha256";

/// Shared secret used to sign relay callbacks.
#[derive(Clone, PartialEq, Eq)]
pub struct SigningKey(Vec<u8>);

impl SigningKey {
    /// Wrap raw key material.
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self(key.into())
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningKey(..)")
    }
}

impl From<&str> for SigningKey {
    fn from(key: &str) -> Self {
        Self::new(key.as_bytes().to_vec())
    }
}

impl From<String> for SigningKey {
    fn from(key: String) -> Self {
        Self::new(key.into_bytes())
    }
}

/// Compute the hex-encoded HMAC-SHA256 of `body` under `key`.
pub fn sign(body: &[u8], key: &SigningKey) -> String {
    let mut mac = keyed_mac(key);
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

fn keyed_mac(key: &SigningKey) -> HmacSha256 {
    HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC can take key of any size")
}

/// Extract the digest bytes from a signature header.
///
/// Returns `None` for anything malformed.
fn parse_header(header: &str) -> Option<Vec<u8>> {
    let header = header.trim();
    let digest = match header.split_once('=') {
        Some((algorithm, digest)) => {
            if !algorithm.trim().eq_ignore_ascii_case(ALGORITHM) {
                return None;
            }
            digest.trim()
        }
        None => header,
    };

    if digest.is_empty() {
        return None;
    }

    let bytes = hex::decode(digest).ok()?;
    (bytes.len() == DIGEST_LEN).then_some(bytes)
}

/// Verifies that inbound callbacks originate from the relay.
///
/// Holds the current signing key and, during rotation, the next one. A
/// verifier without keys lets every request through; that is meant for local
/// development only and logs a warning on every call.
#[derive(Debug, Clone, Default)]
pub struct SignatureVerifier {
    current: Option<SigningKey>,
    next: Option<SigningKey>,
}

impl SignatureVerifier {
    /// Create a verifier.
    pub fn new(current: Option<SigningKey>, next: Option<SigningKey>) -> Self {
        if current.is_none() && next.is_none() {
            tracing::warn!(
                "No relay signing key configured; webhook signature verification is DISABLED"
            );
        }
        Self { current, next }
    }

    /// Verifier with a single key.
    pub fn with_key(key: impl Into<SigningKey>) -> Self {
        Self::new(Some(key.into()), None)
    }

    /// Verifier that accepts everything.
    pub fn disabled() -> Self {
        Self::new(None, None)
    }

    /// Whether a signing key is configured.
    pub fn is_enforcing(&self) -> bool {
        self.current.is_some() || self.next.is_some()
    }

    /// Check `signature_header` against the raw request body.
    ///
    /// Never fails loudly: a missing or malformed header is `false`.
    pub fn verify(&self, raw_body: &[u8], signature_header: Option<&str>) -> bool {
        if !self.is_enforcing() {
            tracing::warn!("Relay signing key not set; skipping signature verification");
            return true;
        }

        let Some(expected) = signature_header.and_then(parse_header) else {
            tracing::debug!("Signature header missing or malformed");
            return false;
        };

        [self.current.as_ref(), self.next.as_ref()]
            .into_iter()
            .flatten()
            .any(|key| {
                let mut mac = keyed_mac(key);
                mac.update(raw_body);
                // Constant-time comparison
                mac.verify_slice(&expected).is_ok()
            })
    }
}
