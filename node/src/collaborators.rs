//! # Collaborators
//!
//! Concrete implementations of the account service's side-effect traits:
//!
//! | Trait             | Implementations                        |
//! |-------------------|----------------------------------------|
//! | `CaptchaVerifier` | [`RecaptchaVerifier`], [`AcceptAllCaptcha`] |
//! | `Mailer`          | [`LogMailer`]                          |
//! | `Publisher`       | [`BroadcastPublisher`]                 |
//! | `Alerter`         | [`WebhookAlerter`], [`LogAlerter`]     |
//!
//! The HTTP-backed ones share one `reqwest::Client` with a request timeout.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;

use keystead_protocol::receipt::Receipt;
use keystead_protocol::services::{Alerter, CaptchaVerifier, Mailer, Publisher};
use keystead_protocol::{AccountError, AccountResult};

/// Google's verification endpoint.
pub const RECAPTCHA_VERIFY_URL: &str = "https://www.google.com/recaptcha/api/siteverify";

/// Shared HTTP client for outbound calls.
pub fn http_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("keystead-node/", env!("CARGO_PKG_VERSION")))
        .build()
}

fn upstream(context: &str, err: impl std::fmt::Display) -> AccountError {
    AccountError::Upstream(format!("{}: {}", context, err))
}

// ---------------------------------------------------------------------------
// Captcha
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SiteVerifyResponse {
    success: bool,
    #[serde(default, rename = "error-codes")]
    error_codes: Vec<String>,
}

/// reCAPTCHA siteverify over HTTPS.
pub struct RecaptchaVerifier {
    client: reqwest::Client,
    secret: String,
    url: String,
}

impl RecaptchaVerifier {
    pub fn new(client: reqwest::Client, secret: String, url: String) -> Self {
        Self {
            client,
            secret,
            url,
        }
    }
}

#[async_trait]
impl CaptchaVerifier for RecaptchaVerifier {
    async fn verify(&self, response: &str, source_ip: Option<&str>) -> AccountResult<()> {
        if response.is_empty() {
            return Err(AccountError::bad_request("captcha response missing"));
        }
        let mut form = vec![("secret", self.secret.as_str()), ("response", response)];
        if let Some(ip) = source_ip {
            form.push(("remoteip", ip));
        }

        let reply: SiteVerifyResponse = self
            .client
            .post(&self.url)
            .form(&form)
            .send()
            .await
            .map_err(|e| upstream("captcha request failed", e))?
            .error_for_status()
            .map_err(|e| upstream("captcha provider error", e))?
            .json()
            .await
            .map_err(|e| upstream("captcha reply unreadable", e))?;

        if !reply.success {
            tracing::debug!(errors = ?reply.error_codes, "captcha rejected");
            return Err(AccountError::bad_request("captcha rejected"));
        }
        Ok(())
    }
}

/// Accepts every captcha. Only for development setups without a secret.
pub struct AcceptAllCaptcha;

#[async_trait]
impl CaptchaVerifier for AcceptAllCaptcha {
    async fn verify(&self, _response: &str, _source_ip: Option<&str>) -> AccountResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mail
// ---------------------------------------------------------------------------

/// Link a user follows to complete an operation. The receipt travels in
/// the fragment so it never reaches the origin's access logs.
pub fn receipt_link(origin: &str, action: &str, receipt: &Receipt) -> String {
    format!(
        "{}/{}#{}",
        origin.trim_end_matches('/'),
        action,
        receipt.token()
    )
}

/// Writes outgoing mail to the log instead of sending it.
#[derive(Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_confirm(&self, email: &str, receipt: &Receipt, origin: &str) -> AccountResult<()> {
        tracing::info!(
            to = %email,
            link = %receipt_link(origin, "confirm", receipt),
            "confirmation mail"
        );
        Ok(())
    }

    async fn send_reset(&self, email: &str, receipt: &Receipt, origin: &str) -> AccountResult<()> {
        tracing::info!(
            to = %email,
            link = %receipt_link(origin, "reset", receipt),
            "wallet reset mail"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// An account event as pushed to WebSocket subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEvent {
    pub subject: String,
    pub payload: serde_json::Value,
    /// Unix milliseconds.
    pub timestamp: i64,
}

/// Publishes onto an in-process broadcast channel that `/ws` drains.
#[derive(Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<NodeEvent>,
}

impl BroadcastPublisher {
    pub fn new(tx: broadcast::Sender<NodeEvent>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl Publisher for BroadcastPublisher {
    async fn publish(&self, subject: &str, payload: serde_json::Value) -> AccountResult<()> {
        let event = NodeEvent {
            subject: subject.to_string(),
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        match self.tx.send(event) {
            Ok(n) => tracing::debug!(subject, subscribers = n, "event published"),
            Err(_) => tracing::debug!(subject, "event published with no subscribers"),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

/// Logs alerts at warn level.
#[derive(Default)]
pub struct LogAlerter;

#[async_trait]
impl Alerter for LogAlerter {
    async fn send_alert(&self, text: &str) -> AccountResult<()> {
        tracing::warn!(alert = %text, "operator alert");
        Ok(())
    }
}

/// Posts alerts as `{"text": ...}` to a chat-style incoming webhook.
pub struct WebhookAlerter {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlerter {
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl Alerter for WebhookAlerter {
    async fn send_alert(&self, text: &str) -> AccountResult<()> {
        self.client
            .post(&self.url)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .map_err(|e| upstream("alert webhook unreachable", e))?
            .error_for_status()
            .map_err(|e| upstream("alert webhook refused", e))?;
        Ok(())
    }
}
