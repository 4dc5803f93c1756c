// Copyright (c) 2026 Keystead Contributors. MIT License.
// See LICENSE for details.

//! # Keystead Protocol: Core Library
//!
//! Keystead is a wallet-backed identity service. Users sign up with an email
//! and an invite, confirm the email with a signed receipt, then bind an
//! encrypted wallet keystore to their account. The service never sees a
//! private key; it stores keystores and hands them back to whoever can sign
//! for the wallet's address.
//!
//! ## Architecture
//!
//! - **validate**: Shape checks for ids, emails, codes and addresses.
//! - **crypto**: Keccak-256 and the Ed25519 session keys that sign receipts.
//! - **receipt**: Receipt codec and the session guard.
//! - **referral**: Invite and global-quota checks.
//! - **wallet**: Keystore validation.
//! - **storage**: The `AccountStore` contract and its sled implementation.
//! - **services**: Mail, captcha, publish and alert contracts.
//! - **accounts**: `AccountService`, the operations themselves.
//! - **config**: Constants and runtime tunables.
//! - **error**: `AccountError` and its status mapping.
//!
//! ## Ground Rules
//!
//! 1. No session table. Every privileged call carries a receipt.
//! 2. No in-process mutable state. Storage owns every invariant.
//! 3. Side effects after commit are best effort, and say so in the logs.

pub mod accounts;
pub mod config;
pub mod crypto;
pub mod error;
pub mod receipt;
pub mod referral;
pub mod services;
pub mod storage;
pub mod validate;
pub mod wallet;

pub use accounts::{AccountService, Collaborators, NewAccount, WalletBinding};
pub use error::{AccountError, AccountResult};
