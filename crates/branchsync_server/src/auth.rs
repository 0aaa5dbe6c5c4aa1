//! Bearer-token authentication.
//!
//! The engine treats authentication as an opaque boolean gate: a
//! [`TokenVerifier`] answers whether a presented token is valid. Two
//! implementations ship here: a static shared-secret verifier for simple
//! deployments and tests, and an HMAC-SHA256 verifier whose tokens embed
//! the branch id and an expiring timestamp.
//!
//! ## HMAC token format
//!
//! `<branch_id>.<timestamp_millis>.<hex hmac-sha256 over "branch.timestamp">`

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// The opaque authentication gate.
pub trait TokenVerifier: Send + Sync {
    /// Returns true when the token is valid.
    fn verify(&self, token: &str) -> bool;
}

/// Verifier that accepts one static shared secret.
#[derive(Clone)]
pub struct StaticTokenVerifier {
    secret: String,
}

impl StaticTokenVerifier {
    /// Creates a verifier for the given shared secret.
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> bool {
        token == self.secret
    }
}

/// Authentication configuration for HMAC tokens.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Secret key for HMAC.
    pub secret: Vec<u8>,
    /// Token expiration duration.
    pub token_expiry: Duration,
}

impl AuthConfig {
    /// Creates a new auth configuration with 24-hour expiry.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            token_expiry: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Sets the token expiration duration.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

/// HMAC-SHA256 token issuer and verifier.
#[derive(Clone)]
pub struct HmacTokenVerifier {
    config: AuthConfig,
}

impl HmacTokenVerifier {
    /// Creates a verifier.
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    /// Issues a token for a branch.
    pub fn issue(&self, branch_id: &str) -> String {
        let timestamp = now_millis();
        let payload = format!("{branch_id}.{timestamp}");
        let signature = self.sign(payload.as_bytes());
        format!("{payload}.{}", hex::encode(signature))
    }

    fn sign(&self, data: &[u8]) -> [u8; 32] {
        let mut mac = HmacSha256::new_from_slice(&self.config.secret)
            .expect("HMAC can take key of any size");
        mac.update(data);
        mac.finalize().into_bytes().into()
    }
}

impl TokenVerifier for HmacTokenVerifier {
    fn verify(&self, token: &str) -> bool {
        let mut parts = token.rsplitn(2, '.');
        let (Some(signature_hex), Some(payload)) = (parts.next(), parts.next()) else {
            return false;
        };

        let Ok(signature) = hex::decode(signature_hex) else {
            return false;
        };
        if signature != self.sign(payload.as_bytes()) {
            return false;
        }

        let Some(timestamp) = payload
            .rsplit('.')
            .next()
            .and_then(|t| t.parse::<u64>().ok())
        else {
            return false;
        };

        let expiry = self.config.token_expiry.as_millis() as u64;
        now_millis() <= timestamp.saturating_add(expiry)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier() -> HmacTokenVerifier {
        HmacTokenVerifier::new(AuthConfig::new(b"test-secret-key-32-bytes-long!!".to_vec()))
    }

    #[test]
    fn issue_and_verify() {
        let verifier = verifier();
        let token = verifier.issue("br-1");
        assert!(verifier.verify(&token));
    }

    #[test]
    fn reject_tampered_token() {
        let verifier = verifier();
        let mut token = verifier.issue("br-1");
        token.replace_range(0..1, "x");
        assert!(!verifier.verify(&token));
    }

    #[test]
    fn reject_wrong_secret() {
        let token = verifier().issue("br-1");
        let other =
            HmacTokenVerifier::new(AuthConfig::new(b"another-secret-key!!".to_vec()));
        assert!(!other.verify(&token));
    }

    #[test]
    fn reject_expired_token() {
        let verifier = HmacTokenVerifier::new(
            AuthConfig::new(b"test-secret-key-32-bytes-long!!".to_vec())
                .with_expiry(Duration::from_secs(0)),
        );
        let token = verifier.issue("br-1");
        std::thread::sleep(Duration::from_millis(10));
        assert!(!verifier.verify(&token));
    }

    #[test]
    fn reject_garbage() {
        let verifier = verifier();
        assert!(!verifier.verify(""));
        assert!(!verifier.verify("no-dots-here"));
        assert!(!verifier.verify("br-1.notanumber.zz"));
    }

    #[test]
    fn static_verifier() {
        let verifier = StaticTokenVerifier::new("shared-secret");
        assert!(verifier.verify("shared-secret"));
        assert!(!verifier.verify("wrong-secret"));
    }
}
