//! # Identifier Validation
//!
//! Pure shape checks for everything a client can hand us: account ids,
//! referral codes, emails, and Ethereum-style addresses. None of these touch
//! storage; they only answer "is this well-formed?".
//!
//! Address rules follow EIP-55. All-lowercase and all-uppercase addresses
//! carry no checksum and are accepted as-is. Mixed case means the client is
//! asserting a checksum, so it must be correct.

use uuid::{Uuid, Variant};

use crate::config::REF_CODE_LENGTH;
use crate::crypto::hash::{keccak256, nibble};

/// Hex digits in an address body.
const ADDRESS_HEX_LENGTH: usize = 40;

/// Returns `true` for a hyphenated RFC 4122 version-4 UUID.
///
/// ```
/// use keystead_protocol::validate::is_uuid_v4;
///
/// assert!(is_uuid_v4("3b241101-e2bb-4255-8caf-4136c566a962"));
/// assert!(!is_uuid_v4("3b241101-e2bb-1255-8caf-4136c566a962"));
/// ```
pub fn is_uuid_v4(s: &str) -> bool {
    // Only the canonical hyphenated form; Uuid::try_parse also accepts
    // simple, braced and urn encodings.
    if s.len() != 36 {
        return false;
    }
    match Uuid::try_parse(s) {
        Ok(id) => id.get_version_num() == 4 && id.get_variant() == Variant::RFC4122,
        Err(_) => false,
    }
}

/// Parse a UUID v4, returning `None` for anything [`is_uuid_v4`] rejects.
pub fn parse_uuid_v4(s: &str) -> Option<Uuid> {
    if is_uuid_v4(s) {
        Uuid::try_parse(s).ok()
    } else {
        None
    }
}

/// Exactly eight hex digits, either case.
pub fn is_ref_code(s: &str) -> bool {
    s.len() == REF_CODE_LENGTH && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// A pragmatic email shape check: `local@domain.tld`.
///
/// One `@`, no whitespace, a non-empty local part, a domain with at least
/// one dot, no empty labels, and an alphabetic TLD of two or more letters.
/// This is not RFC 5322 and doesn't try to be.
pub fn is_email(s: &str) -> bool {
    if s.len() > 254 || s.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return false;
    }
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 || labels.iter().any(|l| l.is_empty()) {
        return false;
    }
    let tld = labels[labels.len() - 1];
    tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic())
}

/// Strip an optional `0x` prefix.
fn address_body(s: &str) -> &str {
    s.strip_prefix("0x").unwrap_or(s)
}

/// Returns `true` for a 40-hex-digit address with optional `0x` prefix.
///
/// Single-case addresses are accepted unconditionally; mixed case must
/// pass [`is_checksum_address`].
pub fn is_address(s: &str) -> bool {
    let body = address_body(s);
    if body.len() != ADDRESS_HEX_LENGTH || !body.chars().all(|c| c.is_ascii_hexdigit()) {
        return false;
    }
    let has_lower = body.chars().any(|c| c.is_ascii_lowercase());
    let has_upper = body.chars().any(|c| c.is_ascii_uppercase());
    if has_lower && has_upper {
        is_checksum_address(s)
    } else {
        true
    }
}

/// Verify an EIP-55 checksum.
///
/// Hashes the lowercased 40-character body with Keccak-256. For each
/// position, a digest nibble above 7 requires the letter to be uppercase and
/// anything else requires lowercase. Digits carry no case and always pass.
pub fn is_checksum_address(addr: &str) -> bool {
    let body = address_body(addr);
    if body.len() != ADDRESS_HEX_LENGTH {
        return false;
    }
    let digest = keccak256(body.to_ascii_lowercase().as_bytes());
    body.chars().enumerate().all(|(i, c)| {
        if c.is_ascii_digit() {
            return true;
        }
        if !c.is_ascii_hexdigit() {
            return false;
        }
        if nibble(&digest, i) > 7 {
            c.is_ascii_uppercase()
        } else {
            c.is_ascii_lowercase()
        }
    })
}

/// Encode an address with its EIP-55 checksum casing.
///
/// Returns `None` when the input isn't a valid address at all.
pub fn to_checksum_address(addr: &str) -> Option<String> {
    if !is_address(addr) {
        return None;
    }
    let lower = address_body(addr).to_ascii_lowercase();
    let digest = keccak256(lower.as_bytes());
    let body: String = lower
        .chars()
        .enumerate()
        .map(|(i, c)| {
            if c.is_ascii_alphabetic() && nibble(&digest, i) > 7 {
                c.to_ascii_uppercase()
            } else {
                c
            }
        })
        .collect();
    Some(format!("0x{}", body))
}

/// Canonical storage form: lowercase with a `0x` prefix.
///
/// Returns `None` when the input fails [`is_address`].
pub fn normalize_address(addr: &str) -> Option<String> {
    if !is_address(addr) {
        return None;
    }
    Some(format!("0x{}", address_body(addr).to_ascii_lowercase()))
}

/// Case-insensitive address comparison, tolerant of a missing prefix.
pub fn same_address(a: &str, b: &str) -> bool {
    address_body(a).eq_ignore_ascii_case(address_body(b))
}
