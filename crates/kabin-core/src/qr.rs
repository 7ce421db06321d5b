//! QR access protocol: device identity and HMAC-signed action tokens.
//!
//! A browser is identified by a 128-bit random hex cookie. Each page load
//! embeds a short-lived action token — base64 of a JSON capability signed
//! with HMAC-SHA-256 — authorizing exactly one action on one locker from
//! one device. Verification is constant-time on the signature and checks
//! the TTL and the URL-bound locker/device pair.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::QrTokenError;

type HmacSha256 = Hmac<Sha256>;

/// Token lifetime. Long enough for one tap, short enough to be useless
/// when leaked.
pub const TOKEN_TTL_MS: i64 = 5_000;

/// Lifetime of the device cookie, in seconds (one year).
pub const DEVICE_COOKIE_MAX_AGE_SECS: i64 = 365 * 24 * 60 * 60;

/// Generate a fresh 128-bit device id as 32 hex characters.
#[must_use]
pub fn generate_device_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// The action a token authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QrAction {
    Assign,
    Release,
}

/// The signed capability. Field order is the canonical serialization —
/// the signature covers the JSON of this struct without `signature`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionToken {
    pub locker_id: i64,
    pub device_id: String,
    pub action: QrAction,
    pub expires_at_ms: i64,
}

#[derive(Serialize, Deserialize)]
struct SignedToken {
    locker_id: i64,
    device_id: String,
    action: QrAction,
    expires_at_ms: i64,
    signature: String,
}

/// Signs and verifies action tokens with the server secret
/// (`QR_HMAC_SECRET`).
#[derive(Clone)]
pub struct QrTokenSigner {
    secret: Vec<u8>,
}

impl std::fmt::Debug for QrTokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QrTokenSigner").finish_non_exhaustive()
    }
}

impl QrTokenSigner {
    #[must_use]
    pub fn new(secret: &[u8]) -> Self {
        Self {
            secret: secret.to_vec(),
        }
    }

    /// Mint a token for `action` on `locker_id` from `device_id`, expiring
    /// [`TOKEN_TTL_MS`] after `now`.
    #[must_use]
    pub fn issue(
        &self,
        locker_id: i64,
        device_id: &str,
        action: QrAction,
        now: DateTime<Utc>,
    ) -> String {
        let token = ActionToken {
            locker_id,
            device_id: device_id.to_owned(),
            action,
            expires_at_ms: now.timestamp_millis() + TOKEN_TTL_MS,
        };
        self.encode(&token)
    }

    /// Encode and sign an already-built token.
    #[must_use]
    pub fn encode(&self, token: &ActionToken) -> String {
        let signature = self.sign(token);
        let signed = SignedToken {
            locker_id: token.locker_id,
            device_id: token.device_id.clone(),
            action: token.action,
            expires_at_ms: token.expires_at_ms,
            signature,
        };
        // Serialization of a plain struct cannot fail.
        let json = serde_json::to_vec(&signed).unwrap_or_default();
        BASE64.encode(json)
    }

    /// Verify an encoded token against the locker and device the request
    /// is bound to.
    ///
    /// # Errors
    ///
    /// Every rejection reason gets its own variant; the HTTP layer maps
    /// them to 400/403.
    pub fn verify(
        &self,
        encoded: &str,
        locker_id: i64,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ActionToken, QrTokenError> {
        let json = BASE64
            .decode(encoded.trim())
            .map_err(|_| QrTokenError::InvalidEncoding)?;
        let signed: SignedToken =
            serde_json::from_slice(&json).map_err(|_| QrTokenError::InvalidEncoding)?;

        let token = ActionToken {
            locker_id: signed.locker_id,
            device_id: signed.device_id,
            action: signed.action,
            expires_at_ms: signed.expires_at_ms,
        };

        let expected = self.sign(&token);
        if expected
            .as_bytes()
            .ct_eq(signed.signature.as_bytes())
            .unwrap_u8()
            != 1
        {
            return Err(QrTokenError::SignatureMismatch);
        }

        if now.timestamp_millis() > token.expires_at_ms {
            return Err(QrTokenError::Expired);
        }
        if token.locker_id != locker_id {
            return Err(QrTokenError::LockerMismatch {
                token_locker: token.locker_id,
                requested: locker_id,
            });
        }
        if token.device_id != device_id {
            return Err(QrTokenError::DeviceMismatch);
        }

        Ok(token)
    }

    /// Read the locker id out of an encoded token WITHOUT verifying it.
    /// Only for choosing rate-limit keys before full verification.
    pub fn peek_locker_id(encoded: &str) -> Result<i64, QrTokenError> {
        let json = BASE64
            .decode(encoded.trim())
            .map_err(|_| QrTokenError::InvalidEncoding)?;
        let signed: SignedToken =
            serde_json::from_slice(&json).map_err(|_| QrTokenError::InvalidEncoding)?;
        Ok(signed.locker_id)
    }

    /// Hex HMAC-SHA-256 over the canonical JSON without the signature.
    fn sign(&self, token: &ActionToken) -> String {
        #[allow(clippy::unwrap_used)] // HMAC accepts keys of any length
        let mut mac = HmacSha256::new_from_slice(&self.secret).unwrap();
        let canonical = serde_json::to_vec(token).unwrap_or_default();
        mac.update(&canonical);
        hex::encode(mac.finalize().into_bytes())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn signer() -> QrTokenSigner {
        QrTokenSigner::new(b"test-hmac-secret")
    }

    #[test]
    fn device_ids_are_128_bit_hex() {
        let id = generate_device_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_device_id());
    }

    #[test]
    fn issue_verify_roundtrip() {
        let signer = signer();
        let now = Utc::now();
        let encoded = signer.issue(9, "deviceaaaa", QrAction::Assign, now);
        let token = signer.verify(&encoded, 9, "deviceaaaa", now).unwrap();
        assert_eq!(token.action, QrAction::Assign);
        assert_eq!(token.locker_id, 9);
    }

    #[test]
    fn accepted_just_before_ttl_rejected_just_after() {
        let signer = signer();
        let now = Utc::now();
        let encoded = signer.issue(9, "dev", QrAction::Release, now);

        signer
            .verify(&encoded, 9, "dev", now + Duration::milliseconds(4_900))
            .unwrap();
        let err = signer
            .verify(&encoded, 9, "dev", now + Duration::milliseconds(5_100))
            .unwrap_err();
        assert_eq!(err, QrTokenError::Expired);
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let signer = signer();
        let now = Utc::now();
        let encoded = signer.issue(9, "dev", QrAction::Assign, now);

        let mut json: serde_json::Value =
            serde_json::from_slice(&BASE64.decode(&encoded).unwrap()).unwrap();
        json["locker_id"] = serde_json::json!(10);
        let forged = BASE64.encode(serde_json::to_vec(&json).unwrap());

        let err = signer.verify(&forged, 10, "dev", now).unwrap_err();
        assert_eq!(err, QrTokenError::SignatureMismatch);
    }

    #[test]
    fn wrong_secret_does_not_verify() {
        let now = Utc::now();
        let encoded = signer().issue(9, "dev", QrAction::Assign, now);
        let other = QrTokenSigner::new(b"another-secret");
        let err = other.verify(&encoded, 9, "dev", now).unwrap_err();
        assert_eq!(err, QrTokenError::SignatureMismatch);
    }

    #[test]
    fn locker_and_device_binding_is_enforced() {
        let signer = signer();
        let now = Utc::now();
        let encoded = signer.issue(9, "dev", QrAction::Assign, now);

        assert!(matches!(
            signer.verify(&encoded, 8, "dev", now).unwrap_err(),
            QrTokenError::LockerMismatch { token_locker: 9, requested: 8 }
        ));
        assert_eq!(
            signer.verify(&encoded, 9, "other", now).unwrap_err(),
            QrTokenError::DeviceMismatch
        );
    }

    #[test]
    fn garbage_is_invalid_encoding() {
        let err = signer().verify("not base64!!", 1, "dev", Utc::now()).unwrap_err();
        assert_eq!(err, QrTokenError::InvalidEncoding);
    }
}
