//! End-to-end integration tests for the Keystead account service.
//!
//! These drive `AccountService` the way the node does: a real sled store,
//! real receipts, and recording stand-ins for mail, captcha, publishing and
//! alerts. Each test builds its own temporary database.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use uuid::Uuid;

use keystead_protocol::config::{ServiceConfig, GLOBAL_REF_CODE, SUBJECT_WALLET_CREATED};
use keystead_protocol::crypto::SessionKeypair;
use keystead_protocol::receipt::{Receipt, ReceiptClaims, ReceiptKind};
use keystead_protocol::services::{Alerter, CaptchaVerifier, Mailer, Publisher};
use keystead_protocol::storage::{Account, AccountDb, AccountStore, RefCode};
use keystead_protocol::{AccountError, AccountResult, AccountService, Collaborators, NewAccount};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Mail {
    Confirm { email: String, token: String },
    Reset { email: String, token: String },
}

#[derive(Default)]
struct Outbox(Mutex<Vec<Mail>>);

impl Outbox {
    fn last_token(&self) -> String {
        match self.0.lock().unwrap().last().cloned() {
            Some(Mail::Confirm { token, .. }) | Some(Mail::Reset { token, .. }) => token,
            None => panic!("no mail sent"),
        }
    }

    fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

#[async_trait]
impl Mailer for Outbox {
    async fn send_confirm(&self, email: &str, receipt: &Receipt, _origin: &str) -> AccountResult<()> {
        self.0.lock().unwrap().push(Mail::Confirm {
            email: email.into(),
            token: receipt.token().into(),
        });
        Ok(())
    }

    async fn send_reset(&self, email: &str, receipt: &Receipt, _origin: &str) -> AccountResult<()> {
        self.0.lock().unwrap().push(Mail::Reset {
            email: email.into(),
            token: receipt.token().into(),
        });
        Ok(())
    }
}

struct AcceptCaptcha;

#[async_trait]
impl CaptchaVerifier for AcceptCaptcha {
    async fn verify(&self, _response: &str, _source_ip: Option<&str>) -> AccountResult<()> {
        Ok(())
    }
}

struct Events(broadcast::Sender<(String, serde_json::Value)>);

#[async_trait]
impl Publisher for Events {
    async fn publish(&self, subject: &str, payload: serde_json::Value) -> AccountResult<()> {
        // No subscribers is fine.
        let _ = self.0.send((subject.to_string(), payload));
        Ok(())
    }
}

#[derive(Default)]
struct Alerts(Mutex<Vec<String>>);

#[async_trait]
impl Alerter for Alerts {
    async fn send_alert(&self, text: &str) -> AccountResult<()> {
        self.0.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

/// Delays every store call, so concurrent operations interleave at each
/// storage round trip the way they do against a remote database.
struct SlowStore {
    inner: Arc<AccountDb>,
    delay: Duration,
}

impl SlowStore {
    async fn pause(&self) {
        tokio::time::sleep(self.delay).await;
    }
}

#[async_trait]
impl AccountStore for SlowStore {
    async fn get_account(&self, id: Uuid) -> AccountResult<Option<Account>> {
        self.pause().await;
        self.inner.get_account(id).await
    }

    async fn get_account_by_email(&self, email: &str) -> AccountResult<Option<Account>> {
        self.pause().await;
        self.inner.get_account_by_email(email).await
    }

    async fn get_account_by_signer_addr(&self, address: &str) -> AccountResult<Option<Account>> {
        self.pause().await;
        self.inner.get_account_by_signer_addr(address).await
    }

    async fn check_account_conflict(&self, id: Uuid, email: &str) -> AccountResult<()> {
        self.pause().await;
        self.inner.check_account_conflict(id, email).await
    }

    async fn put_account(&self, account: &Account, ref_code: &str) -> AccountResult<()> {
        self.pause().await;
        self.inner.put_account(account, ref_code).await
    }

    async fn bind_wallet(
        &self,
        id: Uuid,
        wallet: &str,
        wallet_address: &str,
        proxy: &str,
    ) -> AccountResult<Account> {
        self.pause().await;
        self.inner.bind_wallet(id, wallet, wallet_address, proxy).await
    }

    async fn replace_wallet(
        &self,
        id: Uuid,
        wallet: &str,
        wallet_address: &str,
    ) -> AccountResult<Account> {
        self.pause().await;
        self.inner.replace_wallet(id, wallet, wallet_address).await
    }

    async fn update_email_complete(&self, id: Uuid) -> AccountResult<()> {
        self.pause().await;
        self.inner.update_email_complete(id).await
    }

    async fn get_ref(&self, code: &str) -> AccountResult<Option<RefCode>> {
        self.pause().await;
        self.inner.get_ref(code).await
    }

    async fn put_ref(&self, ref_code: &RefCode) -> AccountResult<()> {
        self.pause().await;
        self.inner.put_ref(ref_code).await
    }

    async fn set_ref_allowance(&self, code: &str, allowance: u32) -> AccountResult<()> {
        self.pause().await;
        self.inner.set_ref_allowance(code, allowance).await
    }

    async fn get_refs_by_account(&self, id: Uuid) -> AccountResult<Vec<RefCode>> {
        self.pause().await;
        self.inner.get_refs_by_account(id).await
    }

    async fn get_proxy(&self) -> AccountResult<Option<String>> {
        self.pause().await;
        self.inner.get_proxy().await
    }

    async fn release_proxy(&self, address: &str) -> AccountResult<bool> {
        self.pause().await;
        self.inner.release_proxy(address).await
    }

    async fn delete_proxy(&self, address: &str) -> AccountResult<bool> {
        self.pause().await;
        self.inner.delete_proxy(address).await
    }

    async fn add_proxy(&self, address: &str) -> AccountResult<bool> {
        self.pause().await;
        self.inner.add_proxy(address).await
    }

    async fn available_proxies_count(&self) -> AccountResult<u64> {
        self.pause().await;
        self.inner.available_proxies_count().await
    }
}

struct Harness {
    service: AccountService,
    db: Arc<AccountDb>,
    session: SessionKeypair,
    outbox: Arc<Outbox>,
    alerts: Arc<Alerts>,
    events: broadcast::Sender<(String, serde_json::Value)>,
    default_referrer: Uuid,
}

/// Fresh service with a global code of `global_allowance` and `proxies`
/// pooled addresses.
async fn setup(global_allowance: u32, proxies: usize) -> Harness {
    let db = Arc::new(AccountDb::open_temporary().expect("temp db"));
    build(db.clone(), db, global_allowance, proxies).await
}

/// Like [`setup`], with every storage call taking 20ms.
async fn setup_slow(global_allowance: u32, proxies: usize) -> Harness {
    let db = Arc::new(AccountDb::open_temporary().expect("temp db"));
    let store = Arc::new(SlowStore {
        inner: db.clone(),
        delay: Duration::from_millis(20),
    });
    build(store, db, global_allowance, proxies).await
}

async fn build(
    store: Arc<dyn AccountStore>,
    db: Arc<AccountDb>,
    global_allowance: u32,
    proxies: usize,
) -> Harness {
    let session = SessionKeypair::generate();
    let outbox = Arc::new(Outbox::default());
    let alerts = Arc::new(Alerts::default());
    let (events, _) = broadcast::channel(16);

    let services = Collaborators {
        mailer: outbox.clone(),
        captcha: Arc::new(AcceptCaptcha),
        publisher: Arc::new(Events(events.clone())),
        alerter: alerts.clone(),
    };
    let service = AccountService::new(
        store,
        session.clone(),
        services,
        ServiceConfig::default(),
    );

    let default_referrer = Uuid::new_v4();
    service
        .set_allowance(GLOBAL_REF_CODE, Some(default_referrer), global_allowance)
        .await
        .unwrap();
    let pool: Vec<String> = (0..proxies).map(proxy_address).collect();
    service.add_proxies(pool.as_slice()).await.unwrap();

    Harness {
        service,
        db,
        session,
        outbox,
        alerts,
        events,
        default_referrer,
    }
}

fn proxy_address(i: usize) -> String {
    format!("0x{:040x}", i + 1)
}

fn signup(email: &str, ref_code: &str) -> NewAccount {
    NewAccount {
        id: Uuid::new_v4().to_string(),
        email: email.to_string(),
        captcha: "captcha-ok".into(),
        origin: "https://keystead.test".into(),
        source_ip: Some("203.0.113.7".into()),
        ref_code: ref_code.to_string(),
    }
}

/// A keystore-shaped wallet whose address belongs to `owner`.
fn wallet_for(owner: &SessionKeypair) -> String {
    format!(
        r#"{{"version":3,"address":"{}","crypto":{{"cipher":"aes-128-ctr"}}}}"#,
        &owner.address()[2..]
    )
}

fn unlock_token(owner: &SessionKeypair) -> String {
    Receipt::issue(owner, ReceiptKind::Unlock, ReceiptClaims::default())
        .unwrap()
        .token()
        .to_string()
}

// ---------------------------------------------------------------------------
// Signup
// ---------------------------------------------------------------------------

#[tokio::test]
async fn signup_with_global_code_persists_and_mails() {
    let h = setup(10, 3).await;
    let request = signup("alice@example.com", GLOBAL_REF_CODE);
    let id = Uuid::parse_str(&request.id).unwrap();

    let account = h.service.add_account(request.clone()).await.unwrap();

    assert_eq!(account.id, id);
    assert_eq!(account.referrer, h.default_referrer);
    assert!(!account.email_confirmed);
    assert!(account.wallet.is_none());
    assert_eq!(h.db.get_account(id).await.unwrap(), Some(account.clone()));

    // One global slot and one proxy were consumed.
    let global = h.db.get_ref(GLOBAL_REF_CODE).await.unwrap().unwrap();
    assert_eq!(global.allowance, 9);
    assert_eq!(h.db.available_proxies_count().await.unwrap(), 2);

    // The mailed receipt is a create-confirmation for this account, signed
    // by the service.
    let token = h.outbox.last_token();
    let receipt = Receipt::parse(&token).unwrap();
    assert_eq!(receipt.kind, ReceiptKind::CreateConfirmation);
    assert_eq!(receipt.account_id(), Some(id));
    assert_eq!(receipt.claims.email.as_deref(), Some("alice@example.com"));
    assert_eq!(receipt.signer, h.service.session_address());

    // Same UUID again is a conflict, and consumes nothing.
    let mut again = signup("alice2@example.com", GLOBAL_REF_CODE);
    again.id = id.to_string();
    let err = h.service.add_account(again).await.unwrap_err();
    assert!(matches!(err, AccountError::Conflict(_)));
    assert_eq!(err.status_code(), 409);
    assert_eq!(h.db.get_ref(GLOBAL_REF_CODE).await.unwrap().unwrap().allowance, 9);
    assert_eq!(h.outbox.len(), 1);
}

#[tokio::test]
async fn duplicate_email_is_conflict() {
    let h = setup(10, 3).await;
    h.service
        .add_account(signup("bob@example.com", GLOBAL_REF_CODE))
        .await
        .unwrap();
    let err = h
        .service
        .add_account(signup("BOB@example.com", GLOBAL_REF_CODE))
        .await
        .unwrap_err();
    assert!(matches!(err, AccountError::Conflict(_)));
}

#[tokio::test]
async fn allowance_n_admits_exactly_n() {
    let h = setup(100, 5).await;
    let owner = Uuid::new_v4();
    h.service.set_allowance("c0ffee00", Some(owner), 2).await.unwrap();

    for i in 0..2 {
        let account = h
            .service
            .add_account(signup(&format!("user{}@example.com", i), "C0FFEE00"))
            .await
            .unwrap();
        assert_eq!(account.referrer, owner);
    }

    let err = h
        .service
        .add_account(signup("late@example.com", "c0ffee00"))
        .await
        .unwrap_err();
    assert!(matches!(err, AccountError::Teapot(_)));
    assert_eq!(err.status_code(), 418);

    assert_eq!(h.db.get_ref("c0ffee00").await.unwrap().unwrap().allowance, 0);
    // Only the named code is decremented.
    assert_eq!(h.db.get_ref(GLOBAL_REF_CODE).await.unwrap().unwrap().allowance, 100);
}

#[tokio::test]
async fn global_quota_pauses_all_signups() {
    let h = setup(0, 2).await;
    h.service
        .set_allowance("c0ffee00", Some(Uuid::new_v4()), 5)
        .await
        .unwrap();

    let err = h
        .service
        .add_account(signup("carol@example.com", "c0ffee00"))
        .await
        .unwrap_err();
    assert!(matches!(err, AccountError::EnhanceYourCalm(_)));
    assert_eq!(err.status_code(), 420);
    assert_eq!(h.db.account_count(), 0);
}

#[tokio::test]
async fn concurrent_signups_cannot_oversell_a_code() {
    let h = setup_slow(100, 4).await;
    h.service
        .set_allowance("c0ffee00", Some(Uuid::new_v4()), 1)
        .await
        .unwrap();

    let a = h.service.add_account(signup("a@example.com", "c0ffee00"));
    let b = h.service.add_account(signup("b@example.com", "c0ffee00"));
    let (a, b) = tokio::join!(a, b);

    let (winner, loser) = match (a, b) {
        (Ok(account), Err(e)) | (Err(e), Ok(account)) => (account, e),
        (a, b) => panic!("expected exactly one signup, got {:?} and {:?}", a, b),
    };
    assert!(matches!(loser, AccountError::Teapot(_)), "loser got {:?}", loser);
    assert_eq!(h.db.get_ref("c0ffee00").await.unwrap().unwrap().allowance, 0);

    // The loser's proxy went back to the pool.
    assert_eq!(h.db.reserved_proxy_count(), 0);
    assert_eq!(h.db.available_proxies_count().await.unwrap(), 3);
    assert_eq!(h.db.get_account(winner.id).await.unwrap(), Some(winner));
}

#[tokio::test]
async fn concurrent_signups_draw_distinct_proxies() {
    let h = setup_slow(100, 50).await;

    let a = h.service.add_account(signup("a@example.com", GLOBAL_REF_CODE));
    let b = h.service.add_account(signup("b@example.com", GLOBAL_REF_CODE));
    let (a, b) = tokio::join!(a, b);
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_ne!(a.proxy, b.proxy);
    assert_eq!(h.db.available_proxies_count().await.unwrap(), 48);
    assert_eq!(h.db.reserved_proxy_count(), 0);
    assert_eq!(h.db.get_ref(GLOBAL_REF_CODE).await.unwrap().unwrap().allowance, 98);
}

#[tokio::test]
async fn failed_signup_releases_its_proxy() {
    let h = setup(10, 2).await;
    h.service
        .add_account(signup("dup@example.com", GLOBAL_REF_CODE))
        .await
        .unwrap();

    let err = h
        .service
        .add_account(signup("dup@example.com", GLOBAL_REF_CODE))
        .await
        .unwrap_err();
    assert!(matches!(err, AccountError::Conflict(_)));
    assert_eq!(h.db.available_proxies_count().await.unwrap(), 1);
    assert_eq!(h.db.reserved_proxy_count(), 0);
}

#[tokio::test]
async fn low_pool_raises_alert() {
    let h = setup(10, 1).await;
    h.service
        .add_account(signup("dave@example.com", GLOBAL_REF_CODE))
        .await
        .unwrap();
    let alerts = h.alerts.0.lock().unwrap();
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].contains("0 left"));
}

#[tokio::test]
async fn default_referral_lookup() {
    let h = setup(10, 1).await;
    assert_eq!(
        h.service.get_ref(GLOBAL_REF_CODE).await.unwrap(),
        Some(h.default_referrer)
    );
}

// ---------------------------------------------------------------------------
// Email confirmation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn confirm_email_once() {
    let h = setup(10, 2).await;
    let account = h
        .service
        .add_account(signup("erin@example.com", GLOBAL_REF_CODE))
        .await
        .unwrap();
    let token = h.outbox.last_token();

    assert!(h.service.confirm_email(&token).await.unwrap());
    assert!(!h.service.confirm_email(&token).await.unwrap());
    assert!(h.db.get_account(account.id).await.unwrap().unwrap().email_confirmed);
}

#[tokio::test]
async fn resend_requires_an_old_receipt() {
    let h = setup(10, 2).await;
    let account = h
        .service
        .add_account(signup("frank@example.com", GLOBAL_REF_CODE))
        .await
        .unwrap();

    let fresh = h.outbox.last_token();
    let err = h
        .service
        .resend_email(&fresh, "https://keystead.test")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("too fresh"));

    let old = Receipt::issue_at(
        &h.session,
        ReceiptKind::CreateConfirmation,
        ReceiptClaims::for_account(account.id),
        Utc::now() - chrono::Duration::hours(3),
    )
    .unwrap();

    // Too old to confirm with, old enough to resend with.
    assert_eq!(
        h.service.confirm_email(old.token()).await.unwrap_err().status_code(),
        401
    );
    assert!(h
        .service
        .resend_email(old.token(), "https://keystead.test")
        .await
        .unwrap());
    assert_eq!(h.outbox.len(), 2);

    // The resent receipt confirms.
    let resent = h.outbox.last_token();
    assert_ne!(resent, fresh);
    assert!(h.service.confirm_email(&resent).await.unwrap());

    // Nothing to resend once confirmed.
    assert!(!h
        .service
        .resend_email(old.token(), "https://keystead.test")
        .await
        .unwrap());
    assert_eq!(h.outbox.len(), 2);
}

#[tokio::test]
async fn receipts_from_other_keys_are_rejected() {
    let h = setup(10, 2).await;
    let account = h
        .service
        .add_account(signup("gina@example.com", GLOBAL_REF_CODE))
        .await
        .unwrap();
    let forger = SessionKeypair::generate();
    let forged = Receipt::issue(
        &forger,
        ReceiptKind::CreateConfirmation,
        ReceiptClaims::for_account(account.id),
    )
    .unwrap();

    let err = h.service.confirm_email(forged.token()).await.unwrap_err();
    assert!(matches!(err, AccountError::Unauthorized(_)));
}

// ---------------------------------------------------------------------------
// Wallets
// ---------------------------------------------------------------------------

#[tokio::test]
async fn wallet_lifecycle() {
    let h = setup(10, 2).await;
    let mut events = h.events.subscribe();
    let account = h
        .service
        .add_account(signup("hana@example.com", GLOBAL_REF_CODE))
        .await
        .unwrap();
    let token = h.outbox.last_token();
    let client = SessionKeypair::generate();
    let wallet = wallet_for(&client);

    let binding = h.service.set_wallet(&token, &wallet, None).await.unwrap();
    assert_eq!(binding.account_id, account.id);
    assert_eq!(binding.wallet_address, client.address());
    assert_eq!(binding.proxy, account.proxy);

    // A referral code was minted for the new account.
    let code = binding.ref_code.clone().expect("ref code minted");
    let minted = h.db.get_ref(&code).await.unwrap().unwrap();
    assert_eq!(minted.allowance, 3);
    assert_eq!(minted.referrer(), Some(account.id));

    // WalletCreated arrives on the detached publisher task.
    let (subject, payload) = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event in time")
        .expect("channel open");
    assert_eq!(subject, SUBJECT_WALLET_CREATED);
    assert_eq!(payload["ref_code"], code.as_str());
    assert_eq!(payload["account_id"], account.id.to_string());

    // Exactly once.
    let err = h.service.set_wallet(&token, &wallet, None).await.unwrap_err();
    assert!(matches!(err, AccountError::Conflict(_)));

    // The wallet key can unlock the stored keystore and list its codes.
    let unlock = unlock_token(&client);
    assert_eq!(h.service.get_wallet(&unlock).await.unwrap(), wallet);
    let refs = h.service.get_refs(&unlock).await.unwrap();
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].code, code);

    // Any other key finds nothing.
    let stranger = unlock_token(&SessionKeypair::generate());
    assert!(matches!(
        h.service.get_wallet(&stranger).await,
        Err(AccountError::NotFound(_))
    ));
}

#[tokio::test]
async fn foreign_keystore_binds_but_cannot_be_unlocked() {
    let h = setup(10, 2).await;
    h.service
        .add_account(signup("lee@example.com", GLOBAL_REF_CODE))
        .await
        .unwrap();
    let token = h.outbox.last_token();

    // A secp256k1-derived address: no Ed25519 key maps onto it.
    let keystore = r#"{"version":3,"address":"5aaeb6053f3e94c9b9a09f33669435e7ef1beaed","crypto":{}}"#;
    let binding = h.service.set_wallet(&token, keystore, None).await.unwrap();
    assert_eq!(binding.wallet_address, "0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed");

    let holder = unlock_token(&SessionKeypair::generate());
    assert!(matches!(
        h.service.get_wallet(&holder).await,
        Err(AccountError::NotFound(_))
    ));
}

#[tokio::test]
async fn concurrent_wallet_bindings_attach_exactly_one() {
    let h = setup_slow(10, 2).await;
    let account = h
        .service
        .add_account(signup("kim@example.com", GLOBAL_REF_CODE))
        .await
        .unwrap();
    let token = h.outbox.last_token();
    let (first, second) = (SessionKeypair::generate(), SessionKeypair::generate());
    let (first_wallet, second_wallet) = (wallet_for(&first), wallet_for(&second));

    let (r1, r2) = tokio::join!(
        h.service.set_wallet(&token, &first_wallet, None),
        h.service.set_wallet(&token, &second_wallet, None),
    );

    let (binding, err) = match (r1, r2) {
        (Ok(binding), Err(e)) | (Err(e), Ok(binding)) => (binding, e),
        (r1, r2) => panic!("expected exactly one binding, got {:?} and {:?}", r1, r2),
    };
    assert!(matches!(err, AccountError::Conflict(_)), "loser got {:?}", err);

    let stored = h.db.get_account(account.id).await.unwrap().unwrap();
    assert_eq!(stored.wallet_address.as_deref(), Some(binding.wallet_address.as_str()));
    let refs = h.db.get_refs_by_account(account.id).await.unwrap();
    assert_eq!(refs.len(), 1);
    assert_eq!(Some(refs[0].code.clone()), binding.ref_code);
}

#[tokio::test]
async fn unlock_requires_unlock_receipt() {
    let h = setup(10, 2).await;
    h.service
        .add_account(signup("ivan@example.com", GLOBAL_REF_CODE))
        .await
        .unwrap();
    let token = h.outbox.last_token();
    let client = SessionKeypair::generate();
    h.service
        .set_wallet(&token, &wallet_for(&client), None)
        .await
        .unwrap();

    let wrong_kind = Receipt::issue(&client, ReceiptKind::ResetConfirmation, ReceiptClaims::default())
        .unwrap();
    assert!(matches!(
        h.service.get_wallet(wrong_kind.token()).await,
        Err(AccountError::Forbidden(_))
    ));

    let stale = Receipt::issue_at(
        &client,
        ReceiptKind::Unlock,
        ReceiptClaims::default(),
        Utc::now() - chrono::Duration::hours(2),
    )
    .unwrap();
    assert!(matches!(
        h.service.get_wallet(stale.token()).await,
        Err(AccountError::Unauthorized(_))
    ));
}

#[tokio::test]
async fn caller_supplied_proxy_returns_reserved_one_to_pool() {
    let h = setup(10, 2).await;
    let account = h
        .service
        .add_account(signup("jo@example.com", GLOBAL_REF_CODE))
        .await
        .unwrap();
    assert_eq!(h.db.available_proxies_count().await.unwrap(), 1);

    let token = h.outbox.last_token();
    let own_proxy = "0x9999999999999999999999999999999999999999";
    let binding = h
        .service
        .set_wallet(&token, &wallet_for(&SessionKeypair::generate()), Some(own_proxy))
        .await
        .unwrap();

    assert_eq!(binding.proxy, own_proxy);
    assert_eq!(h.db.available_proxies_count().await.unwrap(), 2);
    let stored = h.db.get_account(account.id).await.unwrap().unwrap();
    assert_eq!(stored.proxy, own_proxy);
}

#[tokio::test]
async fn set_wallet_for_unknown_account_is_not_found() {
    let h = setup(10, 1).await;
    let orphan = Receipt::issue(
        &h.session,
        ReceiptKind::CreateConfirmation,
        ReceiptClaims::for_account(Uuid::new_v4()),
    )
    .unwrap();
    let err = h
        .service
        .set_wallet(orphan.token(), &wallet_for(&SessionKeypair::generate()), None)
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 404);
}

#[tokio::test]
async fn wallet_reset_flow() {
    let h = setup(10, 2).await;
    let account = h
        .service
        .add_account(signup("kim@example.com", GLOBAL_REF_CODE))
        .await
        .unwrap();
    let create_token = h.outbox.last_token();

    // Nothing to reset before a wallet is bound.
    assert!(matches!(
        h.service.request_reset("kim@example.com", "https://keystead.test").await,
        Err(AccountError::Conflict(_))
    ));
    assert!(matches!(
        h.service.request_reset("nobody@example.com", "https://keystead.test").await,
        Err(AccountError::NotFound(_))
    ));

    let first = SessionKeypair::generate();
    h.service
        .set_wallet(&create_token, &wallet_for(&first), None)
        .await
        .unwrap();

    h.service
        .request_reset("Kim@Example.com", "https://keystead.test")
        .await
        .unwrap();
    let reset_token = h.outbox.last_token();
    assert!(matches!(
        h.outbox.0.lock().unwrap().last(),
        Some(Mail::Reset { email, .. }) if email == "kim@example.com"
    ));

    // A create-confirmation can't authorize a reset.
    let err = h
        .service
        .reset_wallet(&create_token, &wallet_for(&SessionKeypair::generate()))
        .await
        .unwrap_err();
    assert!(matches!(err, AccountError::Forbidden(_)));

    // Same wallet is a conflict.
    let err = h
        .service
        .reset_wallet(&reset_token, &wallet_for(&first))
        .await
        .unwrap_err();
    assert!(matches!(err, AccountError::Conflict(_)));

    let second = SessionKeypair::generate();
    let binding = h
        .service
        .reset_wallet(&reset_token, &wallet_for(&second))
        .await
        .unwrap();
    assert_eq!(binding.proxy, account.proxy);
    assert!(binding.ref_code.is_none());

    // The old key no longer unlocks; the new one does.
    assert!(h.service.get_wallet(&unlock_token(&first)).await.is_err());
    assert_eq!(
        h.service.get_wallet(&unlock_token(&second)).await.unwrap(),
        wallet_for(&second)
    );
}
