//! Preflight tokens.
//!
//! A token proves that preflight passed for a task shortly before a battle
//! starts. It carries `{task_id, timestamp}` and an HMAC-SHA256 tag so it
//! cannot be forged or edited by the caller. Tokens expire five minutes
//! after issuance.

use std::sync::OnceLock;

use chrono::{DateTime, Duration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

pub const TOKEN_VALIDITY: Duration = Duration::minutes(5);
/// Tolerated clock skew for timestamps slightly in the future.
pub const TOKEN_FUTURE_SKEW: Duration = Duration::seconds(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightTokenClaims {
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct WirePayload {
    task_id: String,
    timestamp_ms: i64,
}

/// Issues and verifies tokens with one secret key.
#[derive(Clone)]
pub struct TokenSigner {
    key: Vec<u8>,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner").finish_non_exhaustive()
    }
}

impl TokenSigner {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    pub fn random() -> Self {
        let mut key = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self { key }
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length.
        match HmacSha256::new_from_slice(&self.key) {
            Ok(mac) => mac,
            Err(_) => unreachable!("hmac key length is unrestricted"),
        }
    }

    pub fn generate(&self, task_id: &str, timestamp: DateTime<Utc>) -> String {
        let payload = WirePayload {
            task_id: task_id.to_string(),
            timestamp_ms: timestamp.timestamp_millis(),
        };
        // Serializing a struct of a string and an integer cannot fail.
        let json = serde_json::to_vec(&payload).unwrap_or_default();
        let mut mac = self.mac();
        mac.update(&json);
        let tag = mac.finalize().into_bytes();
        format!("{}.{}", hex::encode(json), hex::encode(tag))
    }

    /// Decode and verify a token as of `now`.
    ///
    /// Returns `None` for malformed or tampered tokens, tokens older than
    /// [`TOKEN_VALIDITY`], and tokens stamped further in the future than
    /// [`TOKEN_FUTURE_SKEW`].
    pub fn validate_at(&self, token: &str, now: DateTime<Utc>) -> Option<PreflightTokenClaims> {
        let (payload_hex, tag_hex) = token.split_once('.')?;
        let payload = hex::decode(payload_hex).ok()?;
        let tag = hex::decode(tag_hex).ok()?;

        let mut mac = self.mac();
        mac.update(&payload);
        if mac.verify_slice(&tag).is_err() {
            debug!("preflight token signature mismatch");
            return None;
        }

        let wire: WirePayload = serde_json::from_slice(&payload).ok()?;
        let timestamp = Utc.timestamp_millis_opt(wire.timestamp_ms).single()?;
        let age = now - timestamp;
        if age > TOKEN_VALIDITY {
            debug!(task_id = %wire.task_id, age_secs = age.num_seconds(), "preflight token expired");
            return None;
        }
        if -age > TOKEN_FUTURE_SKEW {
            debug!(task_id = %wire.task_id, "preflight token issued in the future");
            return None;
        }

        Some(PreflightTokenClaims {
            task_id: wire.task_id,
            timestamp,
        })
    }

    pub fn validate(&self, token: &str) -> Option<PreflightTokenClaims> {
        self.validate_at(token, Utc::now())
    }
}

static PROCESS_SIGNER: OnceLock<TokenSigner> = OnceLock::new();

fn process_signer() -> &'static TokenSigner {
    PROCESS_SIGNER.get_or_init(TokenSigner::random)
}

/// Use `signer` for the free functions below instead of a random key.
///
/// Only takes effect before the first token is issued or checked; returns
/// `false` otherwise.
pub fn install_process_signer(signer: TokenSigner) -> bool {
    PROCESS_SIGNER.set(signer).is_ok()
}

/// Issue a token with the process-wide signer.
pub fn generate_preflight_token(task_id: &str, timestamp: DateTime<Utc>) -> String {
    process_signer().generate(task_id, timestamp)
}

pub fn validate_preflight_token(token: &str) -> Option<PreflightTokenClaims> {
    process_signer().validate(token)
}

/// Validate and require that the token was issued for `task_id`.
pub fn validate_preflight_token_for(token: &str, task_id: &str) -> Option<PreflightTokenClaims> {
    validate_preflight_token(token).filter(|claims| claims.task_id == task_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_recent_and_rejects_expired() {
        let now = Utc::now();
        let fresh = generate_preflight_token("task-1", now - Duration::minutes(4));
        let stale = generate_preflight_token("task-1", now - Duration::minutes(6));

        let claims = validate_preflight_token(&fresh).expect("fresh token");
        assert_eq!(claims.task_id, "task-1");
        assert!(validate_preflight_token(&stale).is_none());
    }

    #[test]
    fn rejects_future_tokens() {
        let signer = TokenSigner::new(b"k".to_vec());
        let now = Utc::now();
        let token = signer.generate("t", now + Duration::minutes(10));
        assert!(signer.validate_at(&token, now).is_none());

        let skewed = signer.generate("t", now + Duration::seconds(5));
        assert!(signer.validate_at(&skewed, now).is_some());
    }

    #[test]
    fn rejects_malformed_and_tampered_tokens() {
        let signer = TokenSigner::new(b"secret".to_vec());
        let now = Utc::now();
        for bad in ["", "abc", "zz.zz", "not-a-token.also-not"] {
            assert!(signer.validate_at(bad, now).is_none(), "{bad}");
        }

        let token = signer.generate("task-a", now);
        let (_, tag) = token.split_once('.').expect("separator");
        let forged_payload = hex::encode(br#"{"task_id":"task-b","timestamp_ms":0}"#);
        let forged = format!("{forged_payload}.{tag}");
        assert!(signer.validate_at(&forged, now).is_none());

        let other = TokenSigner::new(b"other".to_vec());
        assert!(other.validate_at(&token, now).is_none());
    }

    #[test]
    fn task_binding() {
        let token = generate_preflight_token("task-1", Utc::now());
        assert!(validate_preflight_token_for(&token, "task-1").is_some());
        assert!(validate_preflight_token_for(&token, "task-2").is_none());
    }
}
