//! # Hashing Utilities
//!
//! Keccak-256 is the only digest Keystead needs. It drives two things:
//!
//! - **Address derivation**: the last 20 bytes of `keccak256(public_key)`
//!   become a session or wallet address.
//! - **Checksum casing**: EIP-55 mixed-case addresses encode a checksum in
//!   the letter case, derived from `keccak256(lowercase_hex)`.
//!
//! Note that this is the original Keccak padding, not NIST SHA3-256. The
//! two produce different digests for the same input.

use sha3::{Digest, Keccak256};

/// Compute the Keccak-256 hash of the input data.
///
/// # Example
///
/// ```
/// use keystead_protocol::crypto::keccak256;
///
/// let hash = keccak256(b"");
/// assert_eq!(
///     hex::encode(hash),
///     "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
/// );
/// ```
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut output = [0u8; 32];
    output.copy_from_slice(&result);
    output
}

/// Returns the 4-bit value at nibble position `index` of a digest.
///
/// Nibble 0 is the high half of byte 0, nibble 1 the low half, and so on.
/// This is the ordering EIP-55 uses when it walks the address characters.
pub fn nibble(digest: &[u8; 32], index: usize) -> u8 {
    let byte = digest[index / 2];
    if index % 2 == 0 {
        byte >> 4
    } else {
        byte & 0x0f
    }
}
