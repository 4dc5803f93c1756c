//! Wallet keystore handling.
//!
//! The service stores wallets opaquely; the only field it reads is the
//! top-level `address`, which keys the signer index used for unlock. Keystore
//! v3 files write the address without a `0x` prefix, so both forms are
//! accepted.
//!
//! Any keystore-shaped blob can be stored, but only some can be unlocked.
//! Unlock receipts are Ed25519-signed and their signer address is
//! `keccak256(ed25519_public_key)[12..]`. A wallet is retrievable only if its
//! `address` was derived that way from a key the client holds. An Ethereum
//! keystore whose address comes from a secp256k1 key binds fine but can
//! never produce a matching unlock receipt.

use serde_json::Value;

use crate::error::{AccountError, AccountResult};
use crate::validate::{is_address, normalize_address};

/// Largest keystore accepted. Real v3 keystores are well under 1 KiB.
pub const MAX_WALLET_BYTES: usize = 16 * 1024;

/// A wallet keystore that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletBlob {
    /// The JSON exactly as the client sent it.
    pub json: String,
    /// Lowercase `0x` address.
    pub address: String,
}

impl WalletBlob {
    /// Parse and validate a keystore.
    pub fn parse(json: &str) -> AccountResult<Self> {
        if json.len() > MAX_WALLET_BYTES {
            return Err(AccountError::bad_request("wallet too large"));
        }
        let value: Value = serde_json::from_str(json)
            .map_err(|e| AccountError::bad_request(format!("wallet is not JSON: {}", e)))?;
        let raw = value
            .get("address")
            .and_then(Value::as_str)
            .ok_or_else(|| AccountError::bad_request("wallet has no address"))?;

        let prefixed = if raw.starts_with("0x") {
            raw.to_string()
        } else {
            format!("0x{}", raw)
        };
        if !is_address(&prefixed) {
            return Err(AccountError::bad_request(format!(
                "wallet address {} is invalid",
                raw
            )));
        }
        let address = normalize_address(&prefixed)
            .ok_or_else(|| AccountError::bad_request("wallet address is invalid"))?;

        Ok(Self {
            json: json.to_string(),
            address,
        })
    }
}
