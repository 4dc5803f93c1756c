//! # REST + WebSocket API
//!
//! Builds the axum router that exposes the account service over HTTP.
//! All endpoints share application state through axum's `State` extractor.
//!
//! ## Endpoints
//!
//! | Method | Path                      | Description                          |
//! |--------|---------------------------|--------------------------------------|
//! | GET    | `/health`                 | Liveness check                       |
//! | GET    | `/refs/:code`             | Check a code, get default referral   |
//! | POST   | `/accounts`               | Sign up                              |
//! | POST   | `/accounts/confirm`       | Confirm email with a receipt         |
//! | POST   | `/accounts/resend`        | Resend the confirmation mail         |
//! | PUT    | `/accounts/wallet`        | Bind the first wallet                |
//! | POST   | `/accounts/wallet/reset`  | Replace the wallet                   |
//! | POST   | `/accounts/reset-request` | Mail a wallet reset receipt          |
//! | POST   | `/accounts/unlock`        | Fetch the wallet with an unlock receipt |
//! | POST   | `/accounts/refs`          | List own referral codes              |
//! | GET    | `/ws`                     | WebSocket for account events         |
//!
//! Failures render as `{"error": kind, "message": text}` with the status of
//! the underlying [`AccountError`], including the non-standard 420.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, State,
    },
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use keystead_protocol::{AccountError, AccountService, NewAccount};

use crate::collaborators::NodeEvent;
use crate::metrics::SharedMetrics;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared application state available to all request handlers.
///
/// Cheap to clone: everything behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// The node's reported version string.
    pub version: String,
    /// Origin used in mailed links when a request carries none.
    pub default_origin: String,
    pub service: Arc<AccountService>,
    /// Broadcast channel that `/ws` subscribers drain.
    pub event_tx: broadcast::Sender<NodeEvent>,
    pub metrics: SharedMetrics,
    /// Take the client address from `X-Forwarded-For`. Only safe behind a
    /// reverse proxy that overwrites the header.
    pub trust_forwarded_for: bool,
}

impl AppState {
    /// Record a failed request and wrap it for rendering.
    fn reject(&self, err: AccountError) -> ApiError {
        self.metrics.reject(err.kind());
        if err.status_code() >= 500 {
            tracing::error!(kind = err.kind(), error = %err, "request failed");
        } else {
            tracing::debug!(kind = err.kind(), error = %err, "request rejected");
        }
        ApiError(err)
    }

    async fn refresh_pool_gauge(&self) {
        match self.service.proxy_count().await {
            Ok(n) => self.metrics.proxy_pool_size.set(n as i64),
            Err(e) => tracing::warn!(error = %e, "could not read proxy pool size"),
        }
    }

    /// Address reported to the captcha provider.
    fn client_ip(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
        let forwarded = if self.trust_forwarded_for {
            headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        } else {
            None
        };
        forwarded.or_else(|| peer.map(|addr| addr.ip().to_string()))
    }

    /// Origin from the body, then the `Origin` header, then the default.
    fn origin(&self, body: Option<String>, headers: &HeaderMap) -> String {
        body.filter(|o| !o.is_empty())
            .or_else(|| {
                headers
                    .get("origin")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| self.default_origin.clone())
    }
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the full axum [`Router`] with all API routes, CORS, and tracing.
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()` so
/// captcha checks see the client address.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/refs/:code", get(ref_handler))
        .route("/accounts", post(signup_handler))
        .route("/accounts/confirm", post(confirm_handler))
        .route("/accounts/resend", post(resend_handler))
        .route("/accounts/wallet", put(set_wallet_handler))
        .route("/accounts/wallet/reset", post(reset_wallet_handler))
        .route("/accounts/reset-request", post(reset_request_handler))
        .route("/accounts/unlock", post(unlock_handler))
        .route("/accounts/refs", post(refs_handler))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error body returned by every endpoint on failure.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// An [`AccountError`] on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub AccountError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = match &self.0 {
            // Don't leak storage internals.
            AccountError::Storage(_) => "internal storage error".to_string(),
            other => other.to_string(),
        };
        let body = ErrorResponse {
            error: self.0.kind().to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Request / Response Types
// ---------------------------------------------------------------------------

/// Body of `POST /accounts`.
#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub id: String,
    pub email: String,
    pub captcha: String,
    pub ref_code: String,
    #[serde(default)]
    pub origin: Option<String>,
}

/// Response of `POST /accounts`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SignupResponse {
    pub account_id: Uuid,
    pub proxy: String,
}

/// Any request authorized by a receipt alone.
#[derive(Debug, Deserialize)]
pub struct ReceiptRequest {
    pub receipt: String,
    #[serde(default)]
    pub origin: Option<String>,
}

/// Body of the wallet endpoints. `wallet` may be the keystore object or
/// the keystore serialized as a string.
#[derive(Debug, Deserialize)]
pub struct WalletRequest {
    pub receipt: String,
    pub wallet: serde_json::Value,
    #[serde(default)]
    pub proxy: Option<String>,
}

impl WalletRequest {
    fn wallet_json(&self) -> String {
        match &self.wallet {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Body of `POST /accounts/reset-request`.
#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    pub email: String,
    #[serde(default)]
    pub origin: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RefSummary {
    pub code: String,
    pub allowance: u32,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health`: returns 200 if the node is alive.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "version": state.version,
            "session_address": state.service.session_address(),
        })),
    )
}

/// `GET /refs/:code`: 200 with the default referral if the code can admit
/// a signup, otherwise the 418/420 the signup itself would get.
async fn ref_handler(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let default_referral = state
        .service
        .get_ref(&code)
        .await
        .map_err(|e| state.reject(e))?;
    Ok(Json(serde_json::json!({ "default_referral": default_referral })))
}

/// `POST /accounts`: create an account and mail its confirmation.
async fn signup_handler(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(req): Json<SignupRequest>,
) -> ApiResult<(StatusCode, Json<SignupResponse>)> {
    let started = Instant::now();
    let source_ip = state.client_ip(&headers, connect_info.map(|ConnectInfo(addr)| addr));

    let request = NewAccount {
        origin: state.origin(req.origin, &headers),
        id: req.id,
        email: req.email,
        captcha: req.captcha,
        source_ip,
        ref_code: req.ref_code,
    };

    let result = state.service.add_account(request).await;
    state
        .metrics
        .signup_latency_seconds
        .observe(started.elapsed().as_secs_f64());
    let account = result.map_err(|e| state.reject(e))?;

    state.metrics.accounts_created_total.inc();
    state.refresh_pool_gauge().await;

    Ok((
        StatusCode::CREATED,
        Json(SignupResponse {
            account_id: account.id,
            proxy: account.proxy,
        }),
    ))
}

/// `POST /accounts/confirm`
async fn confirm_handler(
    State(state): State<AppState>,
    Json(req): Json<ReceiptRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let newly = state
        .service
        .confirm_email(&req.receipt)
        .await
        .map_err(|e| state.reject(e))?;
    if newly {
        state.metrics.emails_confirmed_total.inc();
    }
    Ok(Json(serde_json::json!({ "confirmed": true, "changed": newly })))
}

/// `POST /accounts/resend`
async fn resend_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ReceiptRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let origin = state.origin(req.origin, &headers);
    let sent = state
        .service
        .resend_email(&req.receipt, &origin)
        .await
        .map_err(|e| state.reject(e))?;
    Ok(Json(serde_json::json!({ "sent": sent })))
}

/// `PUT /accounts/wallet`
async fn set_wallet_handler(
    State(state): State<AppState>,
    Json(req): Json<WalletRequest>,
) -> ApiResult<Json<keystead_protocol::WalletBinding>> {
    let binding = state
        .service
        .set_wallet(&req.receipt, &req.wallet_json(), req.proxy.as_deref())
        .await
        .map_err(|e| state.reject(e))?;
    state.metrics.wallets_bound_total.inc();
    state.refresh_pool_gauge().await;
    Ok(Json(binding))
}

/// `POST /accounts/wallet/reset`
async fn reset_wallet_handler(
    State(state): State<AppState>,
    Json(req): Json<WalletRequest>,
) -> ApiResult<Json<keystead_protocol::WalletBinding>> {
    let binding = state
        .service
        .reset_wallet(&req.receipt, &req.wallet_json())
        .await
        .map_err(|e| state.reject(e))?;
    state.metrics.wallets_reset_total.inc();
    Ok(Json(binding))
}

/// `POST /accounts/reset-request`
async fn reset_request_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ResetRequest>,
) -> ApiResult<StatusCode> {
    let origin = state.origin(req.origin, &headers);
    state
        .service
        .request_reset(&req.email, &origin)
        .await
        .map_err(|e| state.reject(e))?;
    Ok(StatusCode::ACCEPTED)
}

/// `POST /accounts/unlock`: the stored keystore for the receipt's signer.
async fn unlock_handler(
    State(state): State<AppState>,
    Json(req): Json<ReceiptRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let wallet = state
        .service
        .get_wallet(&req.receipt)
        .await
        .map_err(|e| state.reject(e))?;
    Ok(Json(serde_json::json!({ "wallet": wallet })))
}

/// `POST /accounts/refs`
async fn refs_handler(
    State(state): State<AppState>,
    Json(req): Json<ReceiptRequest>,
) -> ApiResult<Json<Vec<RefSummary>>> {
    let refs = state
        .service
        .get_refs(&req.receipt)
        .await
        .map_err(|e| state.reject(e))?;
    Ok(Json(
        refs.into_iter()
            .map(|r| RefSummary {
                code: r.code,
                allowance: r.allowance,
            })
            .collect(),
    ))
}

/// `GET /ws`: WebSocket upgrade for live account events.
///
/// Clients receive JSON-encoded [`NodeEvent`] messages. The connection is
/// read-only from the server's perspective; client messages are ignored.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

/// Drives a single WebSocket connection, forwarding broadcast events
/// until the client disconnects or the channel is closed.
async fn handle_ws_connection(mut socket: WebSocket, state: AppState) {
    let mut rx = state.event_tx.subscribe();

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(ev) => {
                        let payload = match serde_json::to_string(&ev) {
                            Ok(s) => s,
                            Err(e) => {
                                tracing::warn!("failed to serialize ws event: {}", e);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("ws subscriber lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(_)) => {}
                    _ => break,
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
