//! # Account Service
//!
//! The top-level operations of Keystead. Each one composes validation,
//! the session guard and the referral allocator against an
//! [`AccountStore`], then fires whatever side effect the operation owes
//! (mail, an alert, an event).
//!
//! ## Lifecycle
//!
//! ```text
//! add_account ──► pending (proxy reserved, email unconfirmed)
//!      │                   │
//!      │        confirm_email / resend_email
//!      ▼
//! set_wallet ───► bound (wallet + referral code minted)
//!                          │
//!      request_reset ──► reset_wallet (wallet replaced, proxy kept)
//!
//! get_wallet / get_refs ── unlock receipt signed by the wallet key
//! ```
//!
//! The service holds no mutable state. Concurrency control lives in the
//! store: the early checks here give callers a precise error, and the store
//! re-checks each precondition when it writes.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ServiceConfig, GLOBAL_REF_CODE, REF_CODE_MINT_ATTEMPTS, SUBJECT_WALLET_CREATED};
use crate::crypto::SessionKeypair;
use crate::error::{AccountError, AccountResult};
use crate::receipt::{check_session, Receipt, ReceiptClaims, ReceiptKind};
use crate::referral::{generate_ref_code, RefStatus, ReferralAllocator};
use crate::services::{Alerter, CaptchaVerifier, Mailer, Publisher, WalletCreated};
use crate::storage::{Account, AccountStore, RefCode};
use crate::validate::{is_email, is_ref_code, normalize_address, parse_uuid_v4};
use crate::wallet::WalletBlob;

/// Placeholder owner for a global code with no default referrer.
const UNASSIGNED_OWNER: &str = "unassigned";

// ---------------------------------------------------------------------------
// Requests & Results
// ---------------------------------------------------------------------------

/// A signup request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAccount {
    /// Client-generated UUID v4.
    pub id: String,
    pub email: String,
    /// Captcha response token.
    pub captcha: String,
    /// Origin the confirmation link should point back to.
    pub origin: String,
    /// Filled in by the transport, never by the client.
    #[serde(skip)]
    pub source_ip: Option<String>,
    pub ref_code: String,
}

/// The state of an account after a wallet was bound or replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletBinding {
    pub account_id: Uuid,
    pub wallet_address: String,
    pub proxy: String,
    /// Referral code minted for the account. Only set on first binding.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ref_code: Option<String>,
}

/// External services the account service talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub mailer: Arc<dyn Mailer>,
    pub captcha: Arc<dyn CaptchaVerifier>,
    pub publisher: Arc<dyn Publisher>,
    pub alerter: Arc<dyn Alerter>,
}

fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

// ---------------------------------------------------------------------------
// AccountService
// ---------------------------------------------------------------------------

/// Account operations, built once at startup and shared.
#[derive(Clone)]
pub struct AccountService {
    store: Arc<dyn AccountStore>,
    referrals: ReferralAllocator,
    services: Collaborators,
    session: SessionKeypair,
    session_address: String,
    config: ServiceConfig,
}

impl AccountService {
    pub fn new(
        store: Arc<dyn AccountStore>,
        session: SessionKeypair,
        services: Collaborators,
        config: ServiceConfig,
    ) -> Self {
        let session_address = session.address();
        Self {
            referrals: ReferralAllocator::new(store.clone()),
            store,
            services,
            session,
            session_address,
            config,
        }
    }

    /// Address of the key that signs confirmation receipts.
    pub fn session_address(&self) -> &str {
        &self.session_address
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Proxies still waiting for an account.
    pub async fn proxy_count(&self) -> AccountResult<u64> {
        self.store.available_proxies_count().await
    }

    /// Default referral for clients, after checking `ref_code` can admit a
    /// signup.
    pub async fn get_ref(&self, ref_code: &str) -> AccountResult<Option<Uuid>> {
        self.referrals.get_ref(ref_code).await
    }

    // -----------------------------------------------------------------------
    // Signup
    // -----------------------------------------------------------------------

    /// Register a new account and mail its confirmation receipt.
    pub async fn add_account(&self, request: NewAccount) -> AccountResult<Account> {
        let id = parse_uuid_v4(&request.id)
            .ok_or_else(|| AccountError::bad_request(format!("invalid account id {:?}", request.id)))?;
        let email = normalize_email(&request.email);
        if !is_email(&email) {
            return Err(AccountError::bad_request(format!("invalid email {:?}", request.email)));
        }
        if !is_ref_code(&request.ref_code) {
            return Err(AccountError::bad_request(format!(
                "invalid referral code {:?}",
                request.ref_code
            )));
        }

        let receipt = Receipt::issue(
            &self.session,
            ReceiptKind::CreateConfirmation,
            ReceiptClaims::for_account(id).with_email(email.clone()),
        )?;

        let (status, ()) = tokio::try_join!(
            self.referrals.lookup(&request.ref_code),
            self.services
                .captcha
                .verify(&request.captcha, request.source_ip.as_deref()),
        )?;

        let proxy = self
            .store
            .get_proxy()
            .await?
            .ok_or_else(|| AccountError::ServiceUnavailable("no proxy addresses available".into()))?;

        let committed = self
            .commit_account(id, email, proxy.clone(), &status, &receipt)
            .await;
        let account = match committed {
            Ok(account) => account,
            Err(e) => {
                if let Err(release_err) = self.store.release_proxy(&proxy).await {
                    warn!(error = %release_err, proxy = %proxy, "could not release proxy");
                }
                return Err(e);
            }
        };

        info!(
            account_id = %account.id,
            referrer = %account.referrer,
            ref_code = %status.code,
            proxy = %account.proxy,
            "account created"
        );

        self.check_proxy_pool().await;

        self.services
            .mailer
            .send_confirm(&account.email, &receipt, &request.origin)
            .await?;
        Ok(account)
    }

    /// Steps of signup that run while holding a proxy reservation.
    async fn commit_account(
        &self,
        id: Uuid,
        email: String,
        proxy: String,
        status: &RefStatus,
        receipt: &Receipt,
    ) -> AccountResult<Account> {
        status.ensure_available()?;
        let referrer = status.referrer().ok_or_else(|| {
            AccountError::bad_request(format!("referral code {} has no valid owner", status.code))
        })?;

        self.store.check_account_conflict(id, &email).await?;

        let account = Account {
            id,
            email,
            email_confirmed: false,
            referrer,
            proxy,
            wallet: None,
            wallet_address: None,
            created_at: receipt.created,
        };
        self.store.put_account(&account, &status.code).await?;
        Ok(account)
    }

    /// Alert the operator when the proxy pool runs low. Never fails.
    async fn check_proxy_pool(&self) {
        let remaining = match self.store.available_proxies_count().await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "could not count proxy pool");
                return;
            }
        };
        if remaining >= self.config.proxy_alert_threshold {
            return;
        }
        let text = format!(
            "proxy pool low: {} left (threshold {})",
            remaining, self.config.proxy_alert_threshold
        );
        if let Err(e) = self.services.alerter.send_alert(&text).await {
            warn!(error = %e, remaining, "proxy pool alert failed");
        }
    }

    // -----------------------------------------------------------------------
    // Email confirmation
    // -----------------------------------------------------------------------

    /// Mark the account's email confirmed. Returns `false` if it already was.
    pub async fn confirm_email(&self, token: &str) -> AccountResult<bool> {
        let receipt = self.guard(
            token,
            ReceiptKind::CreateConfirmation,
            self.config.confirmation_timeout_hours,
        )?;
        let account = self.account_for(&receipt).await?;
        if account.email_confirmed {
            debug!(account_id = %account.id, "email already confirmed");
            return Ok(false);
        }
        self.store.update_email_complete(account.id).await?;
        info!(account_id = %account.id, "email confirmed");
        Ok(true)
    }

    /// Mail a fresh confirmation receipt. The presented receipt must be old
    /// enough to throttle repeats. Returns `false` when the email is
    /// already confirmed and nothing was sent.
    pub async fn resend_email(&self, token: &str, origin: &str) -> AccountResult<bool> {
        let receipt = self.guard(
            token,
            ReceiptKind::CreateConfirmation,
            self.config.resend_cooldown_hours,
        )?;
        let account = self.account_for(&receipt).await?;
        if account.email_confirmed {
            return Ok(false);
        }

        let fresh = Receipt::issue(
            &self.session,
            ReceiptKind::CreateConfirmation,
            ReceiptClaims::for_account(account.id).with_email(account.email.clone()),
        )?;
        self.services
            .mailer
            .send_confirm(&account.email, &fresh, origin)
            .await?;
        info!(account_id = %account.id, "confirmation resent");
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Wallets
    // -----------------------------------------------------------------------

    /// Bind the first wallet to an account and mint its referral code.
    ///
    /// A caller-supplied `proxy` replaces the reserved one, which goes back
    /// into the pool.
    pub async fn set_wallet(
        &self,
        token: &str,
        wallet_json: &str,
        proxy: Option<&str>,
    ) -> AccountResult<WalletBinding> {
        let receipt = self.guard(
            token,
            ReceiptKind::CreateConfirmation,
            self.config.confirmation_timeout_hours,
        )?;
        let wallet = WalletBlob::parse(wallet_json)?;
        let account = self.account_for(&receipt).await?;
        if account.has_wallet() {
            return Err(AccountError::conflict(format!(
                "account {} already has a wallet",
                account.id
            )));
        }

        let bound_proxy = match proxy {
            Some(p) => normalize_address(p)
                .ok_or_else(|| AccountError::bad_request(format!("invalid proxy address {:?}", p)))?,
            None => account.proxy.clone(),
        };

        self.store
            .bind_wallet(account.id, &wallet.json, &wallet.address, &bound_proxy)
            .await?;

        if bound_proxy != account.proxy {
            debug!(
                account_id = %account.id,
                released = %account.proxy,
                bound = %bound_proxy,
                "proxy rebound"
            );
        }

        let ref_code = self.mint_ref_code(account.id).await?;

        info!(
            account_id = %account.id,
            wallet = %wallet.address,
            ref_code = %ref_code,
            "wallet bound"
        );

        self.publish_wallet_created(WalletCreated {
            account_id: account.id,
            email: account.email.clone(),
            wallet_address: wallet.address.clone(),
            proxy: bound_proxy.clone(),
            ref_code: ref_code.clone(),
        });

        Ok(WalletBinding {
            account_id: account.id,
            wallet_address: wallet.address,
            proxy: bound_proxy,
            ref_code: Some(ref_code),
        })
    }

    /// Mail a reset-confirmation receipt to the owner of `email`.
    pub async fn request_reset(&self, email: &str, origin: &str) -> AccountResult<()> {
        let email = normalize_email(email);
        if !is_email(&email) {
            return Err(AccountError::bad_request(format!("invalid email {:?}", email)));
        }
        let account = self
            .store
            .get_account_by_email(&email)
            .await?
            .ok_or_else(|| AccountError::NotFound(format!("no account for {}", email)))?;
        if !account.has_wallet() {
            return Err(AccountError::conflict("account has no wallet to reset"));
        }

        let receipt = Receipt::issue(
            &self.session,
            ReceiptKind::ResetConfirmation,
            ReceiptClaims::for_account(account.id).with_email(email.clone()),
        )?;
        self.services
            .mailer
            .send_reset(&email, &receipt, origin)
            .await?;
        info!(account_id = %account.id, "wallet reset requested");
        Ok(())
    }

    /// Replace an account's wallet. The proxy is kept.
    pub async fn reset_wallet(&self, token: &str, wallet_json: &str) -> AccountResult<WalletBinding> {
        let receipt = self.guard(
            token,
            ReceiptKind::ResetConfirmation,
            self.config.confirmation_timeout_hours,
        )?;
        let wallet = WalletBlob::parse(wallet_json)?;
        let account = self.account_for(&receipt).await?;

        match account.wallet_address.as_deref() {
            None => return Err(AccountError::conflict("account has no wallet to reset")),
            Some(current) if current == wallet.address => {
                return Err(AccountError::conflict("new wallet matches the current one"));
            }
            Some(_) => {}
        }

        let account = self
            .store
            .replace_wallet(account.id, &wallet.json, &wallet.address)
            .await?;
        info!(account_id = %account.id, wallet = %wallet.address, "wallet reset");

        Ok(WalletBinding {
            account_id: account.id,
            wallet_address: wallet.address,
            proxy: account.proxy,
            ref_code: None,
        })
    }

    /// The stored wallet of whoever signed the unlock receipt.
    pub async fn get_wallet(&self, token: &str) -> AccountResult<String> {
        let account = self.unlocked_account(token).await?;
        account
            .wallet
            .ok_or_else(|| AccountError::NotFound("account has no wallet".into()))
    }

    /// Referral codes owned by whoever signed the unlock receipt.
    pub async fn get_refs(&self, token: &str) -> AccountResult<Vec<RefCode>> {
        let account = self.unlocked_account(token).await?;
        self.store.get_refs_by_account(account.id).await
    }

    // -----------------------------------------------------------------------
    // Administration
    // -----------------------------------------------------------------------

    /// Add addresses to the proxy pool. Every address is validated before
    /// any is inserted. Returns how many were new.
    pub async fn add_proxies<S: AsRef<str>>(&self, addresses: &[S]) -> AccountResult<usize> {
        let normalized = addresses
            .iter()
            .map(|a| {
                normalize_address(a.as_ref().trim()).ok_or_else(|| {
                    AccountError::bad_request(format!("invalid proxy address {:?}", a.as_ref()))
                })
            })
            .collect::<AccountResult<Vec<_>>>()?;

        let mut added = 0;
        for address in &normalized {
            if self.store.add_proxy(address).await? {
                added += 1;
            }
        }
        info!(added, submitted = normalized.len(), "proxies loaded");
        Ok(added)
    }

    /// Create a referral code or overwrite its allowance.
    ///
    /// `owner` is required when the code doesn't exist yet, except for the
    /// global code, which may be created without a default referrer.
    pub async fn set_allowance(
        &self,
        code: &str,
        owner: Option<Uuid>,
        allowance: u32,
    ) -> AccountResult<RefCode> {
        if !is_ref_code(code) {
            return Err(AccountError::bad_request(format!("invalid referral code {:?}", code)));
        }
        let code = code.to_ascii_lowercase();

        if self.store.get_ref(&code).await?.is_some() {
            self.store.set_ref_allowance(&code, allowance).await?;
        } else {
            let owner = match owner {
                Some(id) => id.to_string(),
                None if code == GLOBAL_REF_CODE => UNASSIGNED_OWNER.to_string(),
                None => {
                    return Err(AccountError::bad_request(format!(
                        "new referral code {} needs an owner",
                        code
                    )))
                }
            };
            self.store.put_ref(&RefCode::new(code.clone(), owner, allowance)).await?;
        }

        info!(code = %code, allowance, "referral allowance set");
        self.store
            .get_ref(&code)
            .await?
            .ok_or_else(|| AccountError::NotFound(format!("referral code {}", code)))
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn guard(&self, token: &str, kind: ReceiptKind, timeout_hours: i64) -> AccountResult<Receipt> {
        check_session(token, &self.session_address, kind, Some(timeout_hours))
    }

    async fn account_for(&self, receipt: &Receipt) -> AccountResult<Account> {
        let id = receipt
            .account_id()
            .ok_or_else(|| AccountError::bad_request("receipt names no account"))?;
        self.store
            .get_account(id)
            .await?
            .ok_or_else(|| AccountError::NotFound(format!("account {}", id)))
    }

    async fn unlocked_account(&self, token: &str) -> AccountResult<Account> {
        let receipt = Receipt::parse(token)?;
        let account = self
            .store
            .get_account_by_signer_addr(&receipt.signer)
            .await?
            .ok_or_else(|| AccountError::NotFound(format!("no wallet for {}", receipt.signer)))?;
        let signer = account.wallet_address.as_deref().unwrap_or_default();
        check_session(
            token,
            signer,
            ReceiptKind::Unlock,
            Some(self.config.unlock_timeout_hours),
        )?;
        Ok(account)
    }

    async fn mint_ref_code(&self, owner: Uuid) -> AccountResult<String> {
        for _ in 0..REF_CODE_MINT_ATTEMPTS {
            let code = generate_ref_code();
            if code == GLOBAL_REF_CODE {
                continue;
            }
            let ref_code = RefCode::new(code.clone(), owner.to_string(), self.config.ref_allowance);
            match self.store.put_ref(&ref_code).await {
                Ok(()) => return Ok(code),
                Err(AccountError::Conflict(_)) => {
                    debug!(code = %code, "referral code collision, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(AccountError::conflict("could not mint a unique referral code"))
    }

    fn publish_wallet_created(&self, event: WalletCreated) {
        let payload = match serde_json::to_value(&event) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "could not encode WalletCreated");
                return;
            }
        };
        let publisher = self.services.publisher.clone();
        tokio::spawn(async move {
            if let Err(e) = publisher.publish(SUBJECT_WALLET_CREATED, payload).await {
                warn!(error = %e, account_id = %event.account_id, "WalletCreated publish failed");
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
