//! # Key Management
//!
//! Ed25519 keypairs for the two kinds of signer Keystead deals with:
//!
//! - The **service session key**, which signs confirmation receipts. Its
//!   derived address is the "session address" every confirmation receipt
//!   is checked against.
//! - **Client keys**, which sign unlock receipts for their own account.
//!
//! Both derive an Ethereum-style address: `0x` followed by the last 20 bytes
//! of `keccak256(public_key)`, hex-encoded in lowercase. The derivation is
//! deterministic, so a receipt can carry the public key and any verifier can
//! recompute the signer address from it.
//!
//! Key bytes are never logged.

use ed25519_dalek::{
    Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::hash::keccak256;

/// Errors that can occur during key operations.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid secret key bytes: expected 32 hex-encoded bytes")]
    InvalidSecretKey,

    #[error("invalid public key bytes: not a valid Ed25519 point")]
    InvalidPublicKey,

    #[error("invalid signature bytes: expected 64 bytes")]
    InvalidSignature,
}

/// An Ed25519 signing keypair.
///
/// Intentionally does not implement `Serialize`. Exporting the secret is an
/// explicit call to [`SessionKeypair::secret_key_hex`].
///
/// # Examples
///
/// ```
/// use keystead_protocol::crypto::SessionKeypair;
///
/// let kp = SessionKeypair::generate();
/// let sig = kp.sign(b"confirm account");
/// assert!(kp.public_key().verify(b"confirm account", &sig));
/// assert!(kp.address().starts_with("0x"));
/// ```
pub struct SessionKeypair {
    signing_key: SigningKey,
}

/// The public half of a keypair.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPublicKey {
    bytes: [u8; 32],
}

/// A 64-byte Ed25519 signature.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSignature {
    bytes: Vec<u8>,
}

impl SessionKeypair {
    /// Generate a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Build a keypair deterministically from a 32-byte seed.
    pub fn from_seed(seed: &[u8; SECRET_KEY_LENGTH]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Load a keypair from a hex-encoded 32-byte secret, with or without a
    /// `0x` prefix. Surrounding whitespace is ignored so key files with a
    /// trailing newline load cleanly.
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let trimmed = hex_str.trim();
        let trimmed = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let bytes = hex::decode(trimmed).map_err(|_| KeyError::InvalidSecretKey)?;
        let seed: [u8; SECRET_KEY_LENGTH] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self::from_seed(&seed))
    }

    pub fn public_key(&self) -> SessionPublicKey {
        SessionPublicKey {
            bytes: self.signing_key.verifying_key().to_bytes(),
        }
    }

    /// The address derived from this keypair's public key.
    pub fn address(&self) -> String {
        self.public_key().to_address()
    }

    /// Sign a message. Ed25519 is deterministic: same key and message,
    /// same signature.
    pub fn sign(&self, message: &[u8]) -> SessionSignature {
        SessionSignature {
            bytes: self.signing_key.sign(message).to_bytes().to_vec(),
        }
    }

    /// Export the secret key as hex. Handle with care.
    pub fn secret_key_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }
}

impl Clone for SessionKeypair {
    fn clone(&self) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&self.signing_key.to_bytes()),
        }
    }
}

impl fmt::Debug for SessionKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only ever print the public side.
        write!(f, "SessionKeypair(address={})", self.address())
    }
}

// ---------------------------------------------------------------------------
// SessionPublicKey
// ---------------------------------------------------------------------------

impl SessionPublicKey {
    /// Parse raw bytes, rejecting values that are not valid Ed25519 points.
    pub fn try_from_slice(slice: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; 32] = slice.try_into().map_err(|_| KeyError::InvalidPublicKey)?;
        VerifyingKey::from_bytes(&bytes).map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(Self { bytes })
    }

    /// Parse a hex-encoded public key.
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s).map_err(|_| KeyError::InvalidPublicKey)?;
        Self::try_from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Derive the lowercase `0x`-prefixed address for this key.
    pub fn to_address(&self) -> String {
        let digest = keccak256(&self.bytes);
        format!("0x{}", hex::encode(&digest[12..]))
    }

    /// Verify a signature. A yes/no answer; callers never need the reason.
    pub fn verify(&self, message: &[u8], signature: &SessionSignature) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(&self.bytes) else {
            return false;
        };
        let Some(sig) = signature.to_dalek_signature() else {
            return false;
        };
        verifying_key.verify(message, &sig).is_ok()
    }
}

impl fmt::Display for SessionPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for SessionPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionPublicKey({})", &self.to_hex()[..16])
    }
}

// ---------------------------------------------------------------------------
// SessionSignature
// ---------------------------------------------------------------------------

impl SessionSignature {
    /// Wrap raw bytes. Length is checked here so a short signature fails
    /// at decode time instead of silently failing verification later.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != 64 {
            return Err(KeyError::InvalidSignature);
        }
        Ok(Self {
            bytes: bytes.to_vec(),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn to_dalek_signature(&self) -> Option<DalekSignature> {
        let arr: [u8; 64] = self.bytes.as_slice().try_into().ok()?;
        Some(DalekSignature::from_bytes(&arr))
    }
}

impl fmt::Debug for SessionSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex_str = hex::encode(&self.bytes);
        write!(f, "SessionSignature({}...)", &hex_str[..hex_str.len().min(16)])
    }
}
