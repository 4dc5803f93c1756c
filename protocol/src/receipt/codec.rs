//! # Receipt Codec
//!
//! A receipt is a compact, signed, typed, timestamped assertion. The wire
//! form is two base64url segments (no padding) joined by a dot:
//!
//! ```text
//! base64url(body_json) "." base64url(ed25519_signature(body_json))
//! ```
//!
//! The body carries the signer's public key next to the signer address it
//! claims. Parsing verifies the signature against that key and then
//! recomputes the address from the key; a receipt whose declared signer
//! doesn't match its own key is rejected. That makes the signer recoverable
//! from the receipt alone, so the session guard only has to compare
//! addresses.
//!
//! Receipts are immutable. The signature covers the exact body bytes that
//! travel on the wire, so there is no canonicalization step to get wrong.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::crypto::keys::{KeyError, SessionKeypair, SessionPublicKey, SessionSignature};
use crate::error::AccountError;

/// Longest token we are willing to decode. Real receipts are a few hundred
/// bytes; anything this large is garbage or an attack.
const MAX_TOKEN_LENGTH: usize = 4096;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Reasons a receipt fails to decode or verify.
#[derive(Debug, Error)]
pub enum ReceiptError {
    #[error("malformed receipt: {0}")]
    Malformed(String),

    #[error("receipt signature does not verify")]
    BadSignature,

    #[error("receipt signer {declared} does not match its key ({derived})")]
    SignerMismatch { declared: String, derived: String },

    #[error("receipt key error: {0}")]
    Key(#[from] KeyError),

    #[error("receipt serialization failed: {0}")]
    Serialization(String),
}

impl From<ReceiptError> for AccountError {
    fn from(err: ReceiptError) -> Self {
        AccountError::Unauthorized(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// The operation a receipt authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReceiptKind {
    /// Issued by the service at signup; proves control of the email and
    /// authorizes the first wallet binding.
    CreateConfirmation,
    /// Issued by the service on a reset request; authorizes replacing the
    /// wallet.
    ResetConfirmation,
    /// Signed by a client's own wallet key to fetch its stored wallet.
    Unlock,
}

impl fmt::Display for ReceiptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReceiptKind::CreateConfirmation => "create-confirmation",
            ReceiptKind::ResetConfirmation => "reset-confirmation",
            ReceiptKind::Unlock => "unlock",
        };
        f.write_str(s)
    }
}

/// Operation-specific fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptClaims {
    /// The account the receipt targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<Uuid>,
    /// The email the receipt was mailed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl ReceiptClaims {
    pub fn for_account(account_id: Uuid) -> Self {
        Self {
            account_id: Some(account_id),
            email: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

/// Signed body, exactly as it is serialized on the wire.
#[derive(Debug, Serialize, Deserialize)]
struct ReceiptBody {
    signer: String,
    key: String,
    #[serde(rename = "type")]
    kind: ReceiptKind,
    created: i64,
    #[serde(flatten)]
    claims: ReceiptClaims,
}

/// A decoded, signature-checked receipt.
#[derive(Debug, Clone)]
pub struct Receipt {
    /// Lowercase `0x` address derived from `public_key`.
    pub signer: String,
    pub public_key: SessionPublicKey,
    pub kind: ReceiptKind,
    /// Creation time, millisecond precision.
    pub created: DateTime<Utc>,
    pub claims: ReceiptClaims,
    signature: SessionSignature,
    token: String,
}

impl Receipt {
    /// Issue a receipt stamped with the current time.
    pub fn issue(
        keypair: &SessionKeypair,
        kind: ReceiptKind,
        claims: ReceiptClaims,
    ) -> Result<Self, ReceiptError> {
        Self::issue_at(keypair, kind, claims, Utc::now())
    }

    /// Issue a receipt with an explicit creation time.
    ///
    /// The timestamp is truncated to milliseconds, the precision the wire
    /// format carries, so an issued receipt and its parsed copy agree.
    pub fn issue_at(
        keypair: &SessionKeypair,
        kind: ReceiptKind,
        claims: ReceiptClaims,
        created: DateTime<Utc>,
    ) -> Result<Self, ReceiptError> {
        let created_ms = created.timestamp_millis();
        let created = DateTime::<Utc>::from_timestamp_millis(created_ms)
            .ok_or_else(|| ReceiptError::Malformed("timestamp out of range".into()))?;

        let public_key = keypair.public_key();
        let body = ReceiptBody {
            signer: public_key.to_address(),
            key: public_key.to_hex(),
            kind,
            created: created_ms,
            claims: claims.clone(),
        };
        let body_bytes =
            serde_json::to_vec(&body).map_err(|e| ReceiptError::Serialization(e.to_string()))?;
        let signature = keypair.sign(&body_bytes);

        let token = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&body_bytes),
            URL_SAFE_NO_PAD.encode(signature.as_bytes())
        );

        Ok(Self {
            signer: body.signer,
            public_key,
            kind,
            created,
            claims,
            signature,
            token,
        })
    }

    /// Decode a token and verify its signature and signer binding.
    pub fn parse(token: &str) -> Result<Self, ReceiptError> {
        let token = token.trim();
        if token.is_empty() || token.len() > MAX_TOKEN_LENGTH {
            return Err(ReceiptError::Malformed("bad token length".into()));
        }
        let (body_b64, sig_b64) = token
            .split_once('.')
            .ok_or_else(|| ReceiptError::Malformed("missing signature segment".into()))?;

        let body_bytes = URL_SAFE_NO_PAD
            .decode(body_b64)
            .map_err(|e| ReceiptError::Malformed(format!("body encoding: {}", e)))?;
        let sig_bytes = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|e| ReceiptError::Malformed(format!("signature encoding: {}", e)))?;

        let body: ReceiptBody = serde_json::from_slice(&body_bytes)
            .map_err(|e| ReceiptError::Malformed(format!("body: {}", e)))?;
        let public_key = SessionPublicKey::from_hex(&body.key)?;
        let signature = SessionSignature::from_slice(&sig_bytes)?;

        if !public_key.verify(&body_bytes, &signature) {
            return Err(ReceiptError::BadSignature);
        }

        let derived = public_key.to_address();
        if !body.signer.eq_ignore_ascii_case(&derived) {
            return Err(ReceiptError::SignerMismatch {
                declared: body.signer,
                derived,
            });
        }

        let created = DateTime::<Utc>::from_timestamp_millis(body.created)
            .ok_or_else(|| ReceiptError::Malformed("timestamp out of range".into()))?;

        Ok(Self {
            signer: derived,
            public_key,
            kind: body.kind,
            created,
            claims: body.claims,
            signature,
            token: token.to_string(),
        })
    }

    /// The encoded token, suitable for mailing or returning to a client.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn signature(&self) -> &SessionSignature {
        &self.signature
    }

    pub fn account_id(&self) -> Option<Uuid> {
        self.claims.account_id
    }
}

impl fmt::Display for Receipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn claims() -> ReceiptClaims {
        ReceiptClaims::for_account(Uuid::new_v4()).with_email("a@b.com")
    }

    #[test]
    fn issue_then_parse_preserves_fields() {
        let kp = SessionKeypair::generate();
        let created = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let issued =
            Receipt::issue_at(&kp, ReceiptKind::CreateConfirmation, claims(), created).unwrap();

        let parsed = Receipt::parse(issued.token()).unwrap();
        assert_eq!(parsed.signer, kp.address());
        assert_eq!(parsed.kind, ReceiptKind::CreateConfirmation);
        assert_eq!(parsed.created, created);
        assert_eq!(parsed.claims, issued.claims);
        assert_eq!(parsed.token(), issued.token());
    }

    #[test]
    fn token_is_two_url_safe_segments() {
        let kp = SessionKeypair::generate();
        let receipt = Receipt::issue(&kp, ReceiptKind::Unlock, ReceiptClaims::default()).unwrap();
        let token = receipt.token();
        assert_eq!(token.matches('.').count(), 1);
        assert!(!token.contains('='));
        assert!(!token.contains('+') && !token.contains('/'));
    }

    #[test]
    fn garbage_is_malformed() {
        for token in ["", "abc", "abc.def", "....", "!!.??"] {
            assert!(Receipt::parse(token).is_err(), "{:?} should fail", token);
        }
        let long = "a".repeat(MAX_TOKEN_LENGTH + 1);
        assert!(matches!(Receipt::parse(&long), Err(ReceiptError::Malformed(_))));
    }

    #[test]
    fn tampered_body_fails_signature() {
        let kp = SessionKeypair::generate();
        let receipt =
            Receipt::issue(&kp, ReceiptKind::ResetConfirmation, claims()).unwrap();
        let (body_b64, sig_b64) = receipt.token().split_once('.').unwrap();

        let body = URL_SAFE_NO_PAD.decode(body_b64).unwrap();
        let tampered = String::from_utf8(body)
            .unwrap()
            .replace("reset-confirmation", "create-confirmation");
        let forged = format!("{}.{}", URL_SAFE_NO_PAD.encode(tampered), sig_b64);

        assert!(matches!(
            Receipt::parse(&forged),
            Err(ReceiptError::BadSignature)
        ));
    }

    #[test]
    fn declared_signer_must_match_key() {
        // Sign a body that claims someone else's address.
        let kp = SessionKeypair::generate();
        let impostor = SessionKeypair::generate();
        let body = ReceiptBody {
            signer: impostor.address(),
            key: kp.public_key().to_hex(),
            kind: ReceiptKind::CreateConfirmation,
            created: Utc::now().timestamp_millis(),
            claims: ReceiptClaims::default(),
        };
        let bytes = serde_json::to_vec(&body).unwrap();
        let sig = kp.sign(&bytes);
        let token = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&bytes),
            URL_SAFE_NO_PAD.encode(sig.as_bytes())
        );

        assert!(matches!(
            Receipt::parse(&token),
            Err(ReceiptError::SignerMismatch { .. })
        ));
    }

    #[test]
    fn parse_errors_map_to_unauthorized() {
        let err: AccountError = Receipt::parse("nope").unwrap_err().into();
        assert_eq!(err.status_code(), 401);
    }

    #[test]
    fn kind_wire_names() {
        let json = serde_json::to_string(&ReceiptKind::ResetConfirmation).unwrap();
        assert_eq!(json, "\"reset-confirmation\"");
        assert_eq!(ReceiptKind::CreateConfirmation.to_string(), "create-confirmation");
    }
}
