//! # AccountDb: sled-backed Account Store
//!
//! An [`AccountStore`] on sled's embedded key-value store.
//!
//! ## Tree Layout
//!
//! | Tree               | Key                    | Value              |
//! |--------------------|------------------------|--------------------|
//! | `accounts`         | account id (16B)       | `bincode(Account)` |
//! | `account_emails`   | email (UTF-8)          | account id (16B)   |
//! | `account_signers`  | wallet address (UTF-8) | account id (16B)   |
//! | `refs`             | code (UTF-8)           | `bincode(RefCode)` |
//! | `proxies`          | address (UTF-8)        | empty              |
//! | `reserved_proxies` | address (UTF-8)        | empty              |
//!
//! ## Atomicity
//!
//! Every write that depends on what is already stored runs in a sled
//! transaction, and sled retries the closure on conflict.
//!
//! - Reserving a proxy moves it from `proxies` to `reserved_proxies`, so
//!   concurrent signups never draw the same address.
//! - Account creation is one transaction over `accounts`, `account_emails`,
//!   `refs` and both proxy trees. Two signups racing for the last referral
//!   slot cannot both commit.
//! - Wallet binding re-checks that no wallet is attached and swaps a
//!   caller-supplied proxy in the same transaction.
//!
//! Reservations only live for the duration of one signup. Opening a
//! database returns any left over from a crash to the pool.

use async_trait::async_trait;
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use sled::{Db, Transactional, Tree};
use std::path::Path;
use uuid::Uuid;

use super::{Account, AccountStore, RefCode};
use crate::error::{AccountError, AccountResult};

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt index entry: {0}")]
    CorruptIndex(String),
}

pub type DbResult<T> = Result<T, DbError>;

type TxResult<T> = Result<T, ConflictableTransactionError<AccountError>>;

fn encode<T: serde::Serialize>(value: &T) -> DbResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| DbError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> DbResult<T> {
    bincode::deserialize(bytes).map_err(|e| DbError::Serialization(e.to_string()))
}

fn decode_id(bytes: &[u8]) -> DbResult<Uuid> {
    Uuid::from_slice(bytes).map_err(|e| DbError::CorruptIndex(e.to_string()))
}

/// Abort a transaction with a service-level error.
fn abort<T>(err: AccountError) -> TxResult<T> {
    Err(ConflictableTransactionError::Abort(err))
}

fn unwrap_tx<T>(result: Result<T, TransactionError<AccountError>>) -> AccountResult<T> {
    result.map_err(|e| match e {
        TransactionError::Abort(err) => err,
        TransactionError::Storage(err) => AccountError::Storage(DbError::Sled(err)),
    })
}

fn tx_load_account(accounts: &TransactionalTree, id: Uuid) -> TxResult<Account> {
    match accounts.get(id.as_bytes().as_slice())? {
        Some(bytes) => match decode(&bytes) {
            Ok(account) => Ok(account),
            Err(e) => abort(e.into()),
        },
        None => abort(AccountError::NotFound(format!("account {}", id))),
    }
}

fn tx_store_account(accounts: &TransactionalTree, account: &Account) -> TxResult<()> {
    let bytes = match encode(account) {
        Ok(bytes) => bytes,
        Err(e) => return abort(e.into()),
    };
    accounts.insert(account.id.as_bytes().as_slice(), bytes)?;
    Ok(())
}

/// Point the signer index at `account` for `address`, dropping its old entry.
fn tx_rebind_signer(
    signers: &TransactionalTree,
    account: &mut Account,
    wallet: &str,
    address: &str,
) -> TxResult<()> {
    let id_key = account.id.as_bytes().to_vec();
    if let Some(existing) = signers.get(address.as_bytes())? {
        if existing.as_ref() != id_key.as_slice() {
            return abort(AccountError::conflict(
                "wallet address is bound to another account",
            ));
        }
    }
    if let Some(old) = account.wallet_address.as_deref() {
        signers.remove(old.as_bytes())?;
    }
    signers.insert(address.as_bytes(), id_key)?;
    account.wallet = Some(wallet.to_string());
    account.wallet_address = Some(address.to_string());
    Ok(())
}

// ---------------------------------------------------------------------------
// AccountDb
// ---------------------------------------------------------------------------

/// sled-backed account storage.
///
/// Cheap to clone: sled handles are reference counted. Share it across
/// tasks as `Arc<AccountDb>` or by cloning.
#[derive(Debug, Clone)]
pub struct AccountDb {
    db: Db,
    accounts: Tree,
    account_emails: Tree,
    account_signers: Tree,
    refs: Tree,
    proxies: Tree,
    reserved_proxies: Tree,
}

impl AccountDb {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let db = Self::from_db(sled::open(path)?)?;
        let released = db.release_stale_reservations()?;
        if released > 0 {
            tracing::warn!(released, "returned interrupted proxy reservations to the pool");
        }
        Ok(db)
    }

    /// A throwaway database, removed when dropped. Used by tests.
    pub fn open_temporary() -> DbResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> DbResult<Self> {
        Ok(Self {
            accounts: db.open_tree("accounts")?,
            account_emails: db.open_tree("account_emails")?,
            account_signers: db.open_tree("account_signers")?,
            refs: db.open_tree("refs")?,
            proxies: db.open_tree("proxies")?,
            reserved_proxies: db.open_tree("reserved_proxies")?,
            db,
        })
    }

    fn load_account(&self, id: Uuid) -> DbResult<Option<Account>> {
        match self.accounts.get(id.as_bytes().as_slice())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn load_indexed(&self, index: &Tree, key: &str) -> DbResult<Option<Account>> {
        match index.get(key.as_bytes())? {
            Some(id_bytes) => self.load_account(decode_id(&id_bytes)?),
            None => Ok(None),
        }
    }

    fn load_ref(&self, code: &str) -> DbResult<Option<RefCode>> {
        match self.refs.get(code.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn release_stale_reservations(&self) -> DbResult<usize> {
        let mut released = 0;
        for key in self.reserved_proxies.iter().keys() {
            let key = key?;
            self.proxies.insert(&key, Vec::new())?;
            self.reserved_proxies.remove(&key)?;
            released += 1;
        }
        Ok(released)
    }

    /// Number of proxies handed out to signups that have not committed yet.
    pub fn reserved_proxy_count(&self) -> usize {
        self.reserved_proxies.len()
    }

    /// Number of accounts stored.
    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    /// Flush pending writes to disk.
    pub async fn flush(&self) -> DbResult<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

#[async_trait]
impl AccountStore for AccountDb {
    async fn get_account(&self, id: Uuid) -> AccountResult<Option<Account>> {
        Ok(self.load_account(id)?)
    }

    async fn get_account_by_email(&self, email: &str) -> AccountResult<Option<Account>> {
        Ok(self.load_indexed(&self.account_emails, email)?)
    }

    async fn get_account_by_signer_addr(&self, address: &str) -> AccountResult<Option<Account>> {
        Ok(self.load_indexed(&self.account_signers, address)?)
    }

    async fn check_account_conflict(&self, id: Uuid, email: &str) -> AccountResult<()> {
        if self.accounts.contains_key(id.as_bytes().as_slice()).map_err(DbError::from)? {
            return Err(AccountError::conflict(format!("account {} already exists", id)));
        }
        if self.account_emails.contains_key(email.as_bytes()).map_err(DbError::from)? {
            return Err(AccountError::conflict("email already registered"));
        }
        Ok(())
    }

    async fn put_account(&self, account: &Account, ref_code: &str) -> AccountResult<()> {
        let account_bytes = encode(account)?;
        let id_key = account.id.as_bytes().as_slice();

        let trees = (
            &self.accounts,
            &self.account_emails,
            &self.refs,
            &self.proxies,
            &self.reserved_proxies,
        );
        let result = trees.transaction(
            |(accounts, emails, refs, proxies, reserved)| -> TxResult<()> {
                if accounts.get(id_key)?.is_some() {
                    return abort(AccountError::conflict(format!(
                        "account {} already exists",
                        account.id
                    )));
                }
                if emails.get(account.email.as_bytes())?.is_some() {
                    return abort(AccountError::conflict("email already registered"));
                }

                let mut code = match refs.get(ref_code.as_bytes())? {
                    Some(bytes) => match decode::<RefCode>(&bytes) {
                        Ok(code) => code,
                        Err(e) => return abort(e.into()),
                    },
                    None => return abort(AccountError::Teapot(format!("unknown code {}", ref_code))),
                };
                if code.allowance < 1 {
                    return abort(AccountError::Teapot(format!("code {} is spent", ref_code)));
                }
                code.allowance -= 1;
                let code_bytes = match encode(&code) {
                    Ok(bytes) => bytes,
                    Err(e) => return abort(e.into()),
                };

                let proxy = account.proxy.as_bytes();
                if reserved.remove(proxy)?.is_none() && proxies.remove(proxy)?.is_none() {
                    return abort(AccountError::conflict(format!(
                        "proxy {} is no longer available",
                        account.proxy
                    )));
                }

                accounts.insert(id_key, account_bytes.as_slice())?;
                emails.insert(account.email.as_bytes(), id_key)?;
                refs.insert(ref_code.as_bytes(), code_bytes)?;
                Ok(())
            },
        );
        unwrap_tx(result)?;
        self.flush().await?;
        Ok(())
    }

    async fn bind_wallet(
        &self,
        id: Uuid,
        wallet: &str,
        wallet_address: &str,
        proxy: &str,
    ) -> AccountResult<Account> {
        let trees = (
            &self.accounts,
            &self.account_signers,
            &self.proxies,
            &self.reserved_proxies,
        );
        let result = trees.transaction(
            |(accounts, signers, proxies, reserved)| -> TxResult<Account> {
                let mut account = tx_load_account(accounts, id)?;
                if account.has_wallet() {
                    return abort(AccountError::conflict(format!(
                        "account {} already has a wallet",
                        id
                    )));
                }

                if proxy != account.proxy {
                    if reserved.get(proxy.as_bytes())?.is_some() {
                        return abort(AccountError::conflict(format!(
                            "proxy {} is reserved by a pending signup",
                            proxy
                        )));
                    }
                    proxies.remove(proxy.as_bytes())?;
                    proxies.insert(account.proxy.as_bytes(), Vec::new())?;
                    account.proxy = proxy.to_string();
                }

                tx_rebind_signer(signers, &mut account, wallet, wallet_address)?;
                tx_store_account(accounts, &account)?;
                Ok(account)
            },
        );
        let account = unwrap_tx(result)?;
        self.flush().await?;
        Ok(account)
    }

    async fn replace_wallet(
        &self,
        id: Uuid,
        wallet: &str,
        wallet_address: &str,
    ) -> AccountResult<Account> {
        let result = (&self.accounts, &self.account_signers).transaction(
            |(accounts, signers)| -> TxResult<Account> {
                let mut account = tx_load_account(accounts, id)?;
                match account.wallet_address.as_deref() {
                    None => return abort(AccountError::conflict("account has no wallet to reset")),
                    Some(current) if current == wallet_address => {
                        return abort(AccountError::conflict(
                            "new wallet matches the current one",
                        ));
                    }
                    Some(_) => {}
                }

                tx_rebind_signer(signers, &mut account, wallet, wallet_address)?;
                tx_store_account(accounts, &account)?;
                Ok(account)
            },
        );
        let account = unwrap_tx(result)?;
        self.flush().await?;
        Ok(account)
    }

    async fn update_email_complete(&self, id: Uuid) -> AccountResult<()> {
        let result = self.accounts.transaction(|accounts| -> TxResult<()> {
            let mut account = tx_load_account(accounts, id)?;
            if account.email_confirmed {
                return Ok(());
            }
            account.email_confirmed = true;
            tx_store_account(accounts, &account)
        });
        unwrap_tx(result)
    }

    async fn get_ref(&self, code: &str) -> AccountResult<Option<RefCode>> {
        Ok(self.load_ref(code)?)
    }

    async fn put_ref(&self, ref_code: &RefCode) -> AccountResult<()> {
        let bytes = encode(ref_code)?;
        let swapped = self
            .refs
            .compare_and_swap(ref_code.code.as_bytes(), None as Option<&[u8]>, Some(bytes))
            .map_err(DbError::from)?;
        if swapped.is_err() {
            return Err(AccountError::conflict(format!(
                "referral code {} already exists",
                ref_code.code
            )));
        }
        Ok(())
    }

    async fn set_ref_allowance(&self, code: &str, allowance: u32) -> AccountResult<()> {
        let result = self.refs.transaction(|refs| -> TxResult<()> {
            let mut ref_code: RefCode = match refs.get(code.as_bytes())? {
                Some(bytes) => match decode(&bytes) {
                    Ok(ref_code) => ref_code,
                    Err(e) => return abort(e.into()),
                },
                None => return abort(AccountError::NotFound(format!("referral code {}", code))),
            };
            ref_code.allowance = allowance;
            let bytes = match encode(&ref_code) {
                Ok(bytes) => bytes,
                Err(e) => return abort(e.into()),
            };
            refs.insert(code.as_bytes(), bytes)?;
            Ok(())
        });
        unwrap_tx(result)
    }

    async fn get_refs_by_account(&self, id: Uuid) -> AccountResult<Vec<RefCode>> {
        let mut owned = Vec::new();
        for entry in self.refs.iter() {
            let (_code, bytes) = entry.map_err(DbError::from)?;
            let ref_code: RefCode = decode(&bytes)?;
            if ref_code.is_owned_by(id) {
                owned.push(ref_code);
            }
        }
        Ok(owned)
    }

    async fn get_proxy(&self) -> AccountResult<Option<String>> {
        for key in self.proxies.iter().keys() {
            let key = key.map_err(DbError::from)?;
            let address: &[u8] = key.as_ref();
            let claimed = (&self.proxies, &self.reserved_proxies).transaction(
                |(proxies, reserved)| -> TxResult<bool> {
                    if proxies.remove(address)?.is_none() {
                        return Ok(false);
                    }
                    reserved.insert(address, Vec::new())?;
                    Ok(true)
                },
            );
            if unwrap_tx(claimed)? {
                let address = String::from_utf8(key.to_vec())
                    .map_err(|e| DbError::CorruptIndex(e.to_string()))?;
                return Ok(Some(address));
            }
            // Taken by a concurrent signup since the scan saw it.
        }
        Ok(None)
    }

    async fn release_proxy(&self, address: &str) -> AccountResult<bool> {
        let result = (&self.proxies, &self.reserved_proxies).transaction(
            |(proxies, reserved)| -> TxResult<bool> {
                if reserved.remove(address.as_bytes())?.is_none() {
                    return Ok(false);
                }
                proxies.insert(address.as_bytes(), Vec::new())?;
                Ok(true)
            },
        );
        unwrap_tx(result)
    }

    async fn delete_proxy(&self, address: &str) -> AccountResult<bool> {
        Ok(self
            .proxies
            .remove(address.as_bytes())
            .map_err(DbError::from)?
            .is_some())
    }

    async fn add_proxy(&self, address: &str) -> AccountResult<bool> {
        let previous = self
            .proxies
            .insert(address.as_bytes(), Vec::new())
            .map_err(DbError::from)?;
        Ok(previous.is_none())
    }

    async fn available_proxies_count(&self) -> AccountResult<u64> {
        Ok(self.proxies.len() as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
