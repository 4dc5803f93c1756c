// Copyright (c) 2026 Keystead Contributors. MIT License.
// See LICENSE for details.

//! # Keystead Node
//!
//! Entry point for the `keystead-node` binary. Parses CLI arguments,
//! initializes logging and metrics, wires the account service to its
//! collaborators, and serves the HTTP/WS API.
//!
//! The binary supports five subcommands:
//!
//! - `run`     - serve the API
//! - `init`    - create the data directory and the session key
//! - `proxies` - load proxy addresses into the pool
//! - `ref`     - create a referral code or set its allowance
//! - `version` - print build version information

mod api;
mod cli;
mod collaborators;
mod logging;
mod metrics;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;

use keystead_protocol::config::ServiceConfig;
use keystead_protocol::crypto::SessionKeypair;
use keystead_protocol::services::{Alerter, CaptchaVerifier};
use keystead_protocol::storage::AccountDb;
use keystead_protocol::{AccountService, Collaborators};

use cli::{Commands, KeysteadCli};
use collaborators::{
    AcceptAllCaptcha, BroadcastPublisher, LogAlerter, LogMailer, RecaptchaVerifier, WebhookAlerter,
};
use logging::{LogFormat, DEFAULT_FILTER};
use metrics::ServiceMetrics;

/// Broadcast channel capacity for live event streaming.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = KeysteadCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_node(args),
        Commands::Proxies(args) => load_proxies(args).await,
        Commands::Ref(args) => set_ref(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Starts the API server and the metrics endpoint.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(DEFAULT_FILTER, LogFormat::from_str_lossy(&args.log_format));

    tracing::info!(
        api_port = args.api_port,
        metrics_port = args.metrics_port,
        data_dir = %args.data.data_dir.display(),
        "starting keystead-node"
    );

    // --- Persistent storage ---
    let db = Arc::new(open_db(&args.data.db_path())?);

    // --- Session key ---
    let session = match &args.session_key {
        Some(hex) => SessionKeypair::from_hex(hex).context("invalid --session-key")?,
        None => read_session_key(&args.data.key_path())?,
    };
    tracing::info!(session_address = %session.address(), "session key loaded");

    // --- Metrics ---
    let service_metrics = Arc::new(ServiceMetrics::new());

    // --- Event broadcast ---
    let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

    // --- Collaborators ---
    let http = collaborators::http_client(Duration::from_secs(args.http_timeout))
        .context("failed to build HTTP client")?;
    let captcha: Arc<dyn CaptchaVerifier> = match &args.recaptcha_secret {
        Some(secret) => Arc::new(RecaptchaVerifier::new(
            http.clone(),
            secret.clone(),
            args.recaptcha_url.clone(),
        )),
        None => {
            tracing::warn!("no captcha secret configured, accepting every captcha response");
            Arc::new(AcceptAllCaptcha)
        }
    };
    let alerter: Arc<dyn Alerter> = match &args.alert_webhook {
        Some(url) => Arc::new(WebhookAlerter::new(http.clone(), url.clone())),
        None => Arc::new(LogAlerter),
    };
    let services = Collaborators {
        mailer: Arc::new(LogMailer),
        captcha,
        publisher: Arc::new(BroadcastPublisher::new(event_tx.clone())),
        alerter,
    };

    let config = ServiceConfig {
        proxy_alert_threshold: args.proxy_alert_threshold,
        ref_allowance: args.ref_allowance,
        ..ServiceConfig::default()
    };
    let service = Arc::new(AccountService::new(db.clone(), session, services, config));

    let pool = service.proxy_count().await.context("failed to read proxy pool")?;
    service_metrics.proxy_pool_size.set(pool as i64);
    if pool == 0 {
        tracing::warn!("proxy pool is empty, signups will fail until `keystead-node proxies` runs");
    }

    // --- Application state ---
    let app_state = api::AppState {
        version: format!(
            "{} (protocol {})",
            env!("CARGO_PKG_VERSION"),
            keystead_protocol::config::PROTOCOL_VERSION,
        ),
        default_origin: args.public_origin.clone(),
        service,
        event_tx,
        metrics: Arc::clone(&service_metrics),
        trust_forwarded_for: args.trust_forwarded_for,
    };

    // --- API server ---
    let api_router = api::create_router(app_state);
    let api_addr = format!("0.0.0.0:{}", args.api_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", api_addr))?;
    tracing::info!("API server listening on {}", api_addr);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&service_metrics));
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("Metrics server listening on {}", metrics_addr);

    // --- Serve ---
    tokio::select! {
        res = axum::serve(
            api_listener,
            api_router.into_make_service_with_connect_info::<SocketAddr>(),
        ) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("Metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, draining connections");
        }
    }

    db.flush().await.context("failed to flush database")?;
    tracing::info!("keystead-node stopped");
    Ok(())
}

/// Creates the data directory and generates the session key.
fn init_node(args: cli::InitArgs) -> Result<()> {
    logging::init_logging(DEFAULT_FILTER, LogFormat::Pretty);

    let data_dir = &args.data.data_dir;
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let key_path = args.data.key_path();
    if key_path.exists() && !args.force {
        bail!(
            "session key already exists at {} (use --force to replace it)",
            key_path.display()
        );
    }

    let keypair = SessionKeypair::generate();
    write_session_key(&key_path, &keypair)?;
    tracing::info!(
        session_address = %keypair.address(),
        key_path = %key_path.display(),
        "session key generated"
    );

    println!("Node initialized successfully.");
    println!("  Data directory  : {}", data_dir.display());
    println!("  Session key     : {}", key_path.display());
    println!("  Session address : {}", keypair.address());

    Ok(())
}

/// Loads a file of proxy addresses into the pool.
async fn load_proxies(args: cli::ProxiesArgs) -> Result<()> {
    logging::init_logging(DEFAULT_FILTER, LogFormat::Pretty);

    let contents = std::fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let addresses = parse_proxy_lines(&contents);

    let db = Arc::new(open_db(&args.data.db_path())?);
    let service = admin_service(db.clone());
    let added = service
        .add_proxies(addresses.as_slice())
        .await
        .context("failed to load proxies")?;
    let pooled = service.proxy_count().await?;
    db.flush().await?;

    println!(
        "Loaded {} new proxies ({} submitted, {} now pooled).",
        added,
        addresses.len(),
        pooled
    );
    Ok(())
}

/// Creates a referral code or sets its allowance.
async fn set_ref(args: cli::RefArgs) -> Result<()> {
    logging::init_logging(DEFAULT_FILTER, LogFormat::Pretty);

    let db = Arc::new(open_db(&args.data.db_path())?);
    let service = admin_service(db.clone());
    let code = service
        .set_allowance(&args.code, args.owner, args.allowance)
        .await
        .with_context(|| format!("failed to set allowance for {}", args.code))?;
    db.flush().await?;

    println!(
        "Referral code {} now has {} uses left (owner {}).",
        code.code,
        code.allowance,
        code.accounts.first().map(String::as_str).unwrap_or("-")
    );
    Ok(())
}

fn open_db(path: &Path) -> Result<AccountDb> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("failed to create database directory: {}", path.display()))?;
    let db = AccountDb::open(path)
        .with_context(|| format!("failed to open database at {}", path.display()))?;
    tracing::info!(path = %path.display(), "database opened");
    Ok(db)
}

/// A service for admin commands. These never sign, mail or publish, so
/// the collaborators are the local ones and the key is throwaway.
fn admin_service(db: Arc<AccountDb>) -> AccountService {
    let (event_tx, _) = broadcast::channel(1);
    let services = Collaborators {
        mailer: Arc::new(LogMailer),
        captcha: Arc::new(AcceptAllCaptcha),
        publisher: Arc::new(BroadcastPublisher::new(event_tx)),
        alerter: Arc::new(LogAlerter),
    };
    AccountService::new(db, SessionKeypair::generate(), services, ServiceConfig::default())
}

/// One address per line; blank lines and `#` comments skipped.
fn parse_proxy_lines(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn write_session_key(path: &Path, keypair: &SessionKeypair) -> Result<()> {
    std::fs::write(path, keypair.secret_key_hex())
        .with_context(|| format!("failed to write session key to {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

fn read_session_key(path: &Path) -> Result<SessionKeypair> {
    let hex = std::fs::read_to_string(path).with_context(|| {
        format!(
            "failed to read session key from {} (run `keystead-node init` first)",
            path.display()
        )
    })?;
    SessionKeypair::from_hex(&hex)
        .with_context(|| format!("invalid session key in {}", path.display()))
}

/// Prints version information to stdout.
fn print_version() {
    println!("keystead-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol      {}", keystead_protocol::config::PROTOCOL_VERSION);
    println!("rustc         {}", rustc_version());
}

/// Returns the Rust compiler version used to build this binary.
fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
