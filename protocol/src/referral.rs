//! # Referral Allocator
//!
//! Every signup needs a referral code with allowance left, and the global
//! code [`GLOBAL_REF_CODE`] must have allowance left too. The global code is
//! the operator's throttle: set its allowance to zero and all signups stop,
//! whatever invites are in circulation.
//!
//! Lookups here are read-only. The allowance is consumed later, inside the
//! storage transaction that creates the account, so a lookup is safe to
//! call speculatively (the node exposes it to clients for pre-filling the
//! referral field).

use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::config::{GLOBAL_REF_CODE, REF_CODE_LENGTH};
use crate::error::{AccountError, AccountResult};
use crate::storage::{AccountStore, RefCode};
use crate::validate::is_ref_code;

/// What storage says about a referral code and the global quota.
#[derive(Debug, Clone)]
pub struct RefStatus {
    /// The code looked up, lowercased.
    pub code: String,
    /// The named code's record, if it exists.
    pub named: Option<RefCode>,
    /// Remaining global signups.
    pub global_allowance: u32,
    /// The global code's first owner, when it is a UUID v4.
    pub default_referrer: Option<Uuid>,
}

impl RefStatus {
    pub fn is_global(&self) -> bool {
        self.code == GLOBAL_REF_CODE
    }

    /// Remaining uses of the named code. Unknown codes have none.
    pub fn named_allowance(&self) -> u32 {
        self.named.as_ref().map(|r| r.allowance).unwrap_or(0)
    }

    /// The account recorded as referrer on signups that use this code.
    pub fn referrer(&self) -> Option<Uuid> {
        self.named.as_ref().and_then(RefCode::referrer)
    }

    /// Global quota first, then the named code.
    pub fn ensure_available(&self) -> AccountResult<()> {
        if self.global_allowance < 1 {
            return Err(AccountError::EnhanceYourCalm(
                "signups are paused, try again later".into(),
            ));
        }
        if self.named_allowance() < 1 {
            return Err(AccountError::Teapot(format!(
                "referral code {} has no invites left",
                self.code
            )));
        }
        Ok(())
    }
}

/// Reads referral state from an [`AccountStore`].
#[derive(Clone)]
pub struct ReferralAllocator {
    store: Arc<dyn AccountStore>,
}

impl ReferralAllocator {
    pub fn new(store: Arc<dyn AccountStore>) -> Self {
        Self { store }
    }

    /// Fetch the named code and the global code.
    ///
    /// Looking up the global code itself skips the second read and treats
    /// the global gate as open; the named allowance then decides alone.
    pub async fn lookup(&self, ref_code: &str) -> AccountResult<RefStatus> {
        if !is_ref_code(ref_code) {
            return Err(AccountError::bad_request(format!(
                "invalid referral code {:?}",
                ref_code
            )));
        }
        let code = ref_code.to_ascii_lowercase();

        let (named, global_allowance, default_referrer) = if code == GLOBAL_REF_CODE {
            let named = self.store.get_ref(&code).await?;
            let referrer = named.as_ref().and_then(RefCode::referrer);
            (named, 1, referrer)
        } else {
            let (named, global) =
                tokio::try_join!(self.store.get_ref(&code), self.store.get_ref(GLOBAL_REF_CODE))?;
            let allowance = global.as_ref().map(|g| g.allowance).unwrap_or(0);
            let referrer = global.as_ref().and_then(RefCode::referrer);
            (named, allowance, referrer)
        };

        debug!(
            code = %code,
            named_allowance = named.as_ref().map(|r| r.allowance).unwrap_or(0),
            global_allowance,
            "referral lookup"
        );

        Ok(RefStatus {
            code,
            named,
            global_allowance,
            default_referrer,
        })
    }

    /// Check that `ref_code` can admit a signup and return the default
    /// referral to offer clients, if one is configured.
    pub async fn get_ref(&self, ref_code: &str) -> AccountResult<Option<Uuid>> {
        let status = self.lookup(ref_code).await?;
        status.ensure_available()?;
        Ok(status.default_referrer)
    }
}

/// A fresh random referral code: eight lowercase hex digits from the OS
/// CSPRNG.
pub fn generate_ref_code() -> String {
    let mut bytes = [0u8; REF_CODE_LENGTH / 2];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
