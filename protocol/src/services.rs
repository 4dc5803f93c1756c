//! Side-effecting collaborators of the account service.
//!
//! The protocol crate only defines these contracts. The node binary wires
//! up concrete implementations (captcha over HTTP, a log mailer, a
//! broadcast publisher, webhook alerts), and tests plug in recorders.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AccountResult;
use crate::receipt::Receipt;

/// Delivers receipt links to users.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Mail a create-confirmation receipt. `origin` is the client origin the
    /// link should point back to.
    async fn send_confirm(&self, email: &str, receipt: &Receipt, origin: &str)
        -> AccountResult<()>;

    /// Mail a reset-confirmation receipt.
    async fn send_reset(&self, email: &str, receipt: &Receipt, origin: &str) -> AccountResult<()>;
}

/// Checks a captcha response.
#[async_trait]
pub trait CaptchaVerifier: Send + Sync {
    /// `Ok(())` when the response is accepted; `BadRequest` when the
    /// provider rejects it, `Upstream` when the provider can't be reached.
    async fn verify(&self, response: &str, source_ip: Option<&str>) -> AccountResult<()>;
}

/// Fan-out for account events.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, subject: &str, payload: serde_json::Value) -> AccountResult<()>;
}

/// Operator alert sink.
#[async_trait]
pub trait Alerter: Send + Sync {
    async fn send_alert(&self, text: &str) -> AccountResult<()>;
}

/// Payload published under `WalletCreated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletCreated {
    pub account_id: Uuid,
    pub email: String,
    pub wallet_address: String,
    pub proxy: String,
    pub ref_code: String,
}
