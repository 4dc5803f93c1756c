//! # CLI Interface
//!
//! Defines the command-line argument structure for `keystead-node` using
//! `clap` derive. Every flag has a `KEYSTEAD_*` environment fallback.
//!
//! The admin subcommands (`proxies`, `ref`) open the database directly.
//! sled allows one process per database, so stop the node first.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

use crate::collaborators::RECAPTCHA_VERIFY_URL;
use keystead_protocol::config::{DEFAULT_PROXY_ALERT_THRESHOLD, DEFAULT_REF_ALLOWANCE};

/// Keystead account service node.
///
/// Serves the signup, confirmation and wallet binding API, exposes
/// Prometheus metrics, and carries the admin tools for the proxy pool and
/// referral codes.
#[derive(Parser, Debug)]
#[command(
    name = "keystead-node",
    about = "Keystead account service node",
    version,
    propagate_version = true
)]
pub struct KeysteadCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the API server.
    Run(RunArgs),
    /// Create the data directory and generate the session key.
    Init(InitArgs),
    /// Load proxy addresses into the pool from a file.
    Proxies(ProxiesArgs),
    /// Create a referral code or set its allowance.
    Ref(RefArgs),
    /// Print version information and exit.
    Version,
}

/// Location of the node's state.
#[derive(Args, Debug, Clone)]
pub struct DataDirArgs {
    /// Directory holding the database and the session key.
    #[arg(long, short = 'd', env = "KEYSTEAD_DATA_DIR", default_value = "./keystead-data")]
    pub data_dir: PathBuf,
}

impl DataDirArgs {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db")
    }

    pub fn key_path(&self) -> PathBuf {
        self.data_dir.join("session.key")
    }
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub data: DataDirArgs,

    /// Port for the REST and WebSocket API.
    #[arg(long, env = "KEYSTEAD_API_PORT", default_value_t = 8080)]
    pub api_port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "KEYSTEAD_METRICS_PORT", default_value_t = 9090)]
    pub metrics_port: u16,

    /// Hex-encoded Ed25519 session key.
    ///
    /// If not provided, the node reads `session.key` from the data directory.
    #[arg(long, env = "KEYSTEAD_SESSION_KEY", hide_env_values = true)]
    pub session_key: Option<String>,

    /// Origin used in mailed links when a request carries none.
    #[arg(long, env = "KEYSTEAD_PUBLIC_ORIGIN", default_value = "http://localhost:3000")]
    pub public_origin: String,

    /// reCAPTCHA secret. Without one, every captcha is accepted.
    #[arg(long, env = "KEYSTEAD_RECAPTCHA_SECRET", hide_env_values = true)]
    pub recaptcha_secret: Option<String>,

    /// reCAPTCHA verification endpoint.
    #[arg(long, env = "KEYSTEAD_RECAPTCHA_URL", default_value = RECAPTCHA_VERIFY_URL)]
    pub recaptcha_url: String,

    /// Incoming webhook for operator alerts. Alerts are logged when unset.
    #[arg(long, env = "KEYSTEAD_ALERT_WEBHOOK")]
    pub alert_webhook: Option<String>,

    /// Alert when fewer proxies than this remain.
    #[arg(long, env = "KEYSTEAD_PROXY_ALERT_THRESHOLD", default_value_t = DEFAULT_PROXY_ALERT_THRESHOLD)]
    pub proxy_alert_threshold: u64,

    /// Allowance of referral codes minted on wallet binding.
    #[arg(long, env = "KEYSTEAD_REF_ALLOWANCE", default_value_t = DEFAULT_REF_ALLOWANCE)]
    pub ref_allowance: u32,

    /// Report the first `X-Forwarded-For` entry to the captcha provider
    /// instead of the peer address. Enable only behind a reverse proxy.
    #[arg(long, env = "KEYSTEAD_TRUST_FORWARDED_FOR")]
    pub trust_forwarded_for: bool,

    /// Timeout for outbound HTTP calls, in seconds.
    #[arg(long, env = "KEYSTEAD_HTTP_TIMEOUT", default_value_t = 10)]
    pub http_timeout: u64,

    /// Log format: `pretty` or `json`.
    #[arg(long, env = "KEYSTEAD_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

/// Arguments for the `init` subcommand.
#[derive(Parser, Debug)]
pub struct InitArgs {
    #[command(flatten)]
    pub data: DataDirArgs,

    /// Replace an existing session key. Outstanding receipts stop verifying.
    #[arg(long)]
    pub force: bool,
}

/// Arguments for the `proxies` subcommand.
#[derive(Parser, Debug)]
pub struct ProxiesArgs {
    #[command(flatten)]
    pub data: DataDirArgs,

    /// File with one address per line. Blank lines and `#` comments are
    /// skipped.
    pub file: PathBuf,
}

/// Arguments for the `ref` subcommand.
#[derive(Parser, Debug)]
pub struct RefArgs {
    #[command(flatten)]
    pub data: DataDirArgs,

    /// Eight hex digits. `00000000` is the global signup quota.
    pub code: String,

    /// Remaining uses to set.
    pub allowance: u32,

    /// Owning account, required when the code is new. For the global code
    /// this is the default referral offered to clients.
    #[arg(long)]
    pub owner: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        KeysteadCli::command().debug_assert();
    }

    #[test]
    fn forwarded_for_is_untrusted_by_default() {
        let cli = KeysteadCli::try_parse_from(["keystead-node", "run"]).unwrap();
        match cli.command {
            Commands::Run(args) => assert!(!args.trust_forwarded_for),
            other => panic!("unexpected command {:?}", other),
        }

        let cli = KeysteadCli::try_parse_from(["keystead-node", "run", "--trust-forwarded-for"])
            .unwrap();
        match cli.command {
            Commands::Run(args) => assert!(args.trust_forwarded_for),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn parses_ref_subcommand() {
        let owner = Uuid::new_v4();
        let cli = KeysteadCli::try_parse_from([
            "keystead-node",
            "ref",
            "00000000",
            "500",
            "--owner",
            &owner.to_string(),
            "-d",
            "/tmp/ks",
        ])
        .unwrap();
        match cli.command {
            Commands::Ref(args) => {
                assert_eq!(args.code, "00000000");
                assert_eq!(args.allowance, 500);
                assert_eq!(args.owner, Some(owner));
                assert_eq!(args.data.db_path(), PathBuf::from("/tmp/ks/db"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
