//! # Receipts & Sessions
//!
//! Keystead keeps no server-side session table. Every privileged request
//! carries a receipt: a signed, typed, timestamped assertion that acts as a
//! bearer credential for exactly one kind of operation.
//!
//! ```text
//!   signup ──► service signs create-confirmation ──► mailed to user
//!                                                        │
//!   set wallet / confirm email ◄── session guard ◄───────┘
//!
//!   reset request ──► service signs reset-confirmation ──► mailed
//!                                                           │
//!   reset wallet ◄──────────── session guard ◄──────────────┘
//!
//!   client wallet signs unlock ──► session guard ──► stored wallet
//! ```
//!
//! - `codec.rs` encodes, signs, decodes and verifies receipts.
//! - `session.rs` is the guard that checks signer, time window and type.

pub mod codec;
pub mod session;

pub use codec::{Receipt, ReceiptClaims, ReceiptError, ReceiptKind};
pub use session::{check_session, check_session_at};
