//! # Cryptographic Primitives
//!
//! Thin wrappers over audited crates:
//!
//! - **Ed25519** (`ed25519-dalek`) signs and verifies receipts.
//! - **Keccak-256** (`sha3`) derives addresses and EIP-55 checksums.
//!
//! Nothing in here is novel. If a function looks like it could be
//! "optimized", it probably shouldn't be.

pub mod hash;
pub mod keys;

pub use hash::keccak256;
pub use keys::{KeyError, SessionKeypair, SessionPublicKey, SessionSignature};
