//! Error types for account operations.
//!
//! Every operation of the account service returns an [`AccountError`] on
//! failure. Each variant carries a human-readable message and maps onto a
//! conventional HTTP status via [`AccountError::status_code`], which is how
//! the node turns protocol failures into responses.

use thiserror::Error;

use crate::storage::db::DbError;

/// Errors surfaced to callers of the account service.
#[derive(Debug, Error)]
pub enum AccountError {
    /// Malformed input: bad UUID, email, referral code, address or wallet.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The receipt could not be parsed, was signed by the wrong key, or
    /// falls outside its time window.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The receipt is genuine but asserts a different operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The account the receipt points at does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The requested transition collides with existing state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// This specific invite has no allowance left.
    #[error("invite exhausted: {0}")]
    Teapot(String),

    /// The global signup quota is exhausted.
    #[error("signups paused: {0}")]
    EnhanceYourCalm(String),

    /// A required pooled resource is not available.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// A collaborator (captcha, mail, publisher, alert sink) failed.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// The storage backend failed.
    #[error("storage error: {0}")]
    Storage(#[from] DbError),
}

/// Convenience alias used throughout the crate.
pub type AccountResult<T> = Result<T, AccountError>;

impl AccountError {
    /// The HTTP-style status code for this error.
    ///
    /// 418 and 420 are deliberately distinct: 418 means "this invite is
    /// spent, ask for another", 420 means "nobody can sign up right now".
    pub fn status_code(&self) -> u16 {
        match self {
            AccountError::BadRequest(_) => 400,
            AccountError::Unauthorized(_) => 401,
            AccountError::Forbidden(_) => 403,
            AccountError::NotFound(_) => 404,
            AccountError::Conflict(_) => 409,
            AccountError::Teapot(_) => 418,
            AccountError::EnhanceYourCalm(_) => 420,
            AccountError::Storage(_) => 500,
            AccountError::Upstream(_) => 502,
            AccountError::ServiceUnavailable(_) => 503,
        }
    }

    /// A short machine-readable tag, used in API bodies and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            AccountError::BadRequest(_) => "bad_request",
            AccountError::Unauthorized(_) => "unauthorized",
            AccountError::Forbidden(_) => "forbidden",
            AccountError::NotFound(_) => "not_found",
            AccountError::Conflict(_) => "conflict",
            AccountError::Teapot(_) => "invite_exhausted",
            AccountError::EnhanceYourCalm(_) => "quota_exhausted",
            AccountError::Storage(_) => "storage",
            AccountError::Upstream(_) => "upstream",
            AccountError::ServiceUnavailable(_) => "unavailable",
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        AccountError::BadRequest(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        AccountError::Unauthorized(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        AccountError::Conflict(msg.into())
    }
}
