//! # Service Configuration & Constants
//!
//! Every magic number in Keystead lives here: the referral sentinel, the
//! session windows and the pool alert threshold.

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// The protocol version string reported by the node.
pub const PROTOCOL_VERSION: &str = "0.1.0";

// ---------------------------------------------------------------------------
// Referral Codes
// ---------------------------------------------------------------------------

/// The global referral code. Its allowance gates every signup, and its
/// bound account is offered to clients as the default referrer.
pub const GLOBAL_REF_CODE: &str = "00000000";

/// Referral codes are exactly this many hex digits.
pub const REF_CODE_LENGTH: usize = 8;

/// Allowance granted to the referral code minted when an account binds
/// its wallet.
pub const DEFAULT_REF_ALLOWANCE: u32 = 3;

/// How many random codes we try before giving up on minting a fresh one.
/// Collisions in a 32-bit space are rare; hitting this limit means the
/// code space is crowded or the RNG is broken.
pub const REF_CODE_MINT_ATTEMPTS: usize = 8;

// ---------------------------------------------------------------------------
// Session Windows
// ---------------------------------------------------------------------------

/// Confirmation receipts (create and reset) are valid for this many hours.
pub const CONFIRMATION_TIMEOUT_HOURS: i64 = 2;

/// A resend request must present a receipt at least this old. Expressed as
/// a negative timeout for the session guard.
pub const RESEND_COOLDOWN_HOURS: i64 = -2;

/// Unlock receipts signed by a client wallet are valid for this long.
pub const UNLOCK_TIMEOUT_HOURS: i64 = 1;

// ---------------------------------------------------------------------------
// Proxy Pool
// ---------------------------------------------------------------------------

/// Default pool size below which an operational alert is raised after
/// each signup.
pub const DEFAULT_PROXY_ALERT_THRESHOLD: u64 = 100;

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Subject used when a wallet is bound to an account for the first time.
pub const SUBJECT_WALLET_CREATED: &str = "WalletCreated";

// ---------------------------------------------------------------------------
// Runtime Configuration
// ---------------------------------------------------------------------------

/// Tunables for [`crate::accounts::AccountService`].
///
/// Defaults match the constants above; the node overrides them from the
/// command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Alert when fewer than this many proxies remain after a signup.
    pub proxy_alert_threshold: u64,
    /// Allowance for referral codes minted on wallet binding.
    pub ref_allowance: u32,
    /// Validity window for confirmation receipts, in hours.
    pub confirmation_timeout_hours: i64,
    /// Minimum age for resend receipts, as a negative hour count.
    pub resend_cooldown_hours: i64,
    /// Validity window for wallet unlock receipts, in hours.
    pub unlock_timeout_hours: i64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            proxy_alert_threshold: DEFAULT_PROXY_ALERT_THRESHOLD,
            ref_allowance: DEFAULT_REF_ALLOWANCE,
            confirmation_timeout_hours: CONFIRMATION_TIMEOUT_HOURS,
            resend_cooldown_hours: RESEND_COOLDOWN_HOURS,
            unlock_timeout_hours: UNLOCK_TIMEOUT_HOURS,
        }
    }
}
