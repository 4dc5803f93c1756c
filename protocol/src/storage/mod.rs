//! # Storage Module
//!
//! The account service never talks to a database directly. It talks to an
//! [`AccountStore`], a narrow async contract over three tables:
//!
//! ```text
//! accounts  - one row per signup, wallet attached later
//! refs      - referral codes with a remaining allowance
//! proxies   - pre-provisioned addresses waiting for an owner
//! ```
//!
//! ## Atomicity contract
//!
//! The service does no locking of its own. Every write whose outcome depends
//! on stored state carries its precondition into the store, which must
//! check it and write as one unit:
//!
//! - [`AccountStore::get_proxy`] takes the address out of the pool. No two
//!   callers get the same one until it is released.
//! - [`AccountStore::put_account`] inserts the account, consumes the
//!   reserved proxy and decrements the referral allowance, re-checking the
//!   id/email collision and allowance ≥ 1.
//! - [`AccountStore::bind_wallet`] refuses an account that already has a
//!   wallet; [`AccountStore::replace_wallet`] refuses one that has none.
//! - Single-record updates never write back a stale copy.
//!
//! `db.rs` provides [`AccountDb`], an implementation on sled.

pub mod db;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AccountResult;
use crate::validate::parse_uuid_v4;

pub use db::{AccountDb, DbError};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A registered account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    /// Normalized (trimmed, lowercased) email.
    pub email: String,
    /// `false` until the confirmation receipt comes back.
    pub email_confirmed: bool,
    /// The account whose referral code admitted this one.
    pub referrer: Uuid,
    /// Proxy address reserved at signup, or one the client supplied when
    /// binding its wallet.
    pub proxy: String,
    /// The wallet keystore JSON, verbatim.
    pub wallet: Option<String>,
    /// Lowercase `0x` address extracted from `wallet`.
    pub wallet_address: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn has_wallet(&self) -> bool {
        self.wallet.is_some()
    }
}

/// A referral code and its remaining allowance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefCode {
    /// Eight lowercase hex digits.
    pub code: String,
    /// Owning account ids. The first entry is the referrer recorded on
    /// accounts created with this code. May hold a non-UUID placeholder for
    /// the global code when no default referrer is configured.
    pub accounts: Vec<String>,
    /// Remaining uses. Never negative.
    pub allowance: u32,
}

impl RefCode {
    pub fn new(code: impl Into<String>, account: impl Into<String>, allowance: u32) -> Self {
        Self {
            code: code.into().to_ascii_lowercase(),
            accounts: vec![account.into()],
            allowance,
        }
    }

    /// The referrer this code assigns, if its first owner is a UUID v4.
    pub fn referrer(&self) -> Option<Uuid> {
        self.accounts.first().and_then(|a| parse_uuid_v4(a))
    }

    pub fn is_owned_by(&self, id: Uuid) -> bool {
        let id = id.to_string();
        self.accounts.iter().any(|a| a.eq_ignore_ascii_case(&id))
    }
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// Persistent storage for accounts, referral codes and the proxy pool.
///
/// Emails and addresses are passed already normalized; referral codes are
/// passed lowercase.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get_account(&self, id: Uuid) -> AccountResult<Option<Account>>;

    async fn get_account_by_email(&self, email: &str) -> AccountResult<Option<Account>>;

    /// Look an account up by the address of its bound wallet.
    async fn get_account_by_signer_addr(&self, address: &str) -> AccountResult<Option<Account>>;

    /// Fails with `Conflict` if `id` or `email` is already registered.
    async fn check_account_conflict(&self, id: Uuid, email: &str) -> AccountResult<()>;

    /// Atomically insert `account`, consume `account.proxy` and decrement
    /// `ref_code`'s allowance. See the module docs.
    async fn put_account(&self, account: &Account, ref_code: &str) -> AccountResult<()>;

    /// Attach the first wallet. Fails with `Conflict` if one is attached.
    ///
    /// When `proxy` differs from the account's, the account's proxy goes
    /// back to the pool and `proxy` leaves it, in the same unit. Returns the
    /// updated account.
    async fn bind_wallet(
        &self,
        id: Uuid,
        wallet: &str,
        wallet_address: &str,
        proxy: &str,
    ) -> AccountResult<Account>;

    /// Swap the wallet of an account that has one. Fails with `Conflict` if
    /// there is none or the address is unchanged.
    async fn replace_wallet(
        &self,
        id: Uuid,
        wallet: &str,
        wallet_address: &str,
    ) -> AccountResult<Account>;

    /// Mark the account's email as confirmed.
    async fn update_email_complete(&self, id: Uuid) -> AccountResult<()>;

    async fn get_ref(&self, code: &str) -> AccountResult<Option<RefCode>>;

    /// Insert a referral code. Fails with `Conflict` if the code exists.
    async fn put_ref(&self, ref_code: &RefCode) -> AccountResult<()>;

    /// Overwrite a code's allowance. Fails with `NotFound` for unknown codes.
    async fn set_ref_allowance(&self, code: &str, allowance: u32) -> AccountResult<()>;

    async fn get_refs_by_account(&self, id: Uuid) -> AccountResult<Vec<RefCode>>;

    /// Reserve one pooled proxy address. `None` when the pool is empty.
    /// The reservation is consumed by `put_account` or undone by
    /// `release_proxy`.
    async fn get_proxy(&self) -> AccountResult<Option<String>>;

    /// Return a reserved address to the pool. `false` if it wasn't reserved.
    async fn release_proxy(&self, address: &str) -> AccountResult<bool>;

    /// Returns `true` if the address was pooled.
    async fn delete_proxy(&self, address: &str) -> AccountResult<bool>;

    /// Returns `true` if the address was not already pooled.
    async fn add_proxy(&self, address: &str) -> AccountResult<bool>;

    async fn available_proxies_count(&self) -> AccountResult<u64>;
}
