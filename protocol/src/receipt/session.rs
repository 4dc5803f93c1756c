//! # Session Guard
//!
//! Turns a receipt token into an authenticated session for one operation.
//! The checks run in a fixed order so callers get the most specific error:
//!
//! 1. the token decodes and its signature verifies (`Unauthorized`),
//! 2. it was signed by the expected key (`Unauthorized`),
//! 3. it falls inside the time window (`Unauthorized`),
//! 4. it asserts the expected operation (`Forbidden`).
//!
//! ## Time windows
//!
//! A positive `timeout_hours` is an expiry: the receipt must be younger than
//! the window. A negative value flips the test and demands the receipt be
//! *older* than the window, which throttles resend requests. Both boundaries
//! are exclusive: a receipt created exactly at the cutoff fails either way.
//!
//! No I/O happens here.

use chrono::{DateTime, Duration, Utc};

use super::codec::{Receipt, ReceiptKind};
use crate::error::{AccountError, AccountResult};
use crate::validate::same_address;

/// Verify `token` against the current clock.
pub fn check_session(
    token: &str,
    expected_signer: &str,
    expected_kind: ReceiptKind,
    timeout_hours: Option<i64>,
) -> AccountResult<Receipt> {
    check_session_at(token, expected_signer, expected_kind, timeout_hours, Utc::now())
}

/// Verify `token` as if the current time were `now`.
pub fn check_session_at(
    token: &str,
    expected_signer: &str,
    expected_kind: ReceiptKind,
    timeout_hours: Option<i64>,
    now: DateTime<Utc>,
) -> AccountResult<Receipt> {
    let receipt = Receipt::parse(token)?;

    if !same_address(&receipt.signer, expected_signer) {
        return Err(AccountError::unauthorized("receipt signed by unexpected key"));
    }

    match timeout_hours {
        Some(hours) if hours > 0 => {
            let cutoff = now - Duration::hours(hours);
            if receipt.created <= cutoff {
                return Err(AccountError::unauthorized("receipt expired"));
            }
        }
        Some(hours) if hours < 0 => {
            let cutoff = now - Duration::hours(-hours);
            if receipt.created >= cutoff {
                return Err(AccountError::unauthorized("receipt too fresh"));
            }
        }
        _ => {}
    }

    if receipt.kind != expected_kind {
        return Err(AccountError::Forbidden(format!(
            "receipt is {}, expected {}",
            receipt.kind, expected_kind
        )));
    }

    Ok(receipt)
}
