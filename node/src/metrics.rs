//! # Prometheus Metrics
//!
//! Operational metrics for the account service, scraped at `/metrics` on
//! the metrics port.
//!
//! All metrics are registered in a dedicated [`prometheus::Registry`] so they
//! do not collide with any default global registry consumers.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Holds all Prometheus metric handles for the node.
///
/// Clone-friendly (prometheus handles are reference counted) so it can be
/// shared across request handlers.
#[derive(Clone)]
pub struct ServiceMetrics {
    /// Prometheus registry that owns all metrics below.
    registry: Registry,
    /// Accounts created.
    pub accounts_created_total: IntCounter,
    /// Wallets bound for the first time.
    pub wallets_bound_total: IntCounter,
    /// Wallets replaced through the reset flow.
    pub wallets_reset_total: IntCounter,
    /// Emails confirmed.
    pub emails_confirmed_total: IntCounter,
    /// Requests rejected, by error kind.
    pub rejected_requests_total: IntCounterVec,
    /// Proxy addresses left in the pool.
    pub proxy_pool_size: IntGauge,
    /// Latency of the signup operation.
    pub signup_latency_seconds: Histogram,
}

impl ServiceMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("keystead".into()), None)
            .expect("failed to create prometheus registry");

        let accounts_created_total =
            IntCounter::new("accounts_created_total", "Total number of accounts created")
                .expect("metric creation");
        registry
            .register(Box::new(accounts_created_total.clone()))
            .expect("metric registration");

        let wallets_bound_total = IntCounter::new(
            "wallets_bound_total",
            "Total number of wallets bound to new accounts",
        )
        .expect("metric creation");
        registry
            .register(Box::new(wallets_bound_total.clone()))
            .expect("metric registration");

        let wallets_reset_total =
            IntCounter::new("wallets_reset_total", "Total number of wallet resets")
                .expect("metric creation");
        registry
            .register(Box::new(wallets_reset_total.clone()))
            .expect("metric registration");

        let emails_confirmed_total = IntCounter::new(
            "emails_confirmed_total",
            "Total number of email addresses confirmed",
        )
        .expect("metric creation");
        registry
            .register(Box::new(emails_confirmed_total.clone()))
            .expect("metric registration");

        let rejected_requests_total = IntCounterVec::new(
            Opts::new(
                "rejected_requests_total",
                "Total number of requests rejected, by error kind",
            ),
            &["kind"],
        )
        .expect("metric creation");
        registry
            .register(Box::new(rejected_requests_total.clone()))
            .expect("metric registration");

        let proxy_pool_size = IntGauge::new(
            "proxy_pool_size",
            "Proxy addresses available for new accounts",
        )
        .expect("metric creation");
        registry
            .register(Box::new(proxy_pool_size.clone()))
            .expect("metric registration");

        let signup_latency_seconds = Histogram::with_opts(
            HistogramOpts::new("signup_latency_seconds", "Signup latency in seconds").buckets(
                vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            ),
        )
        .expect("metric creation");
        registry
            .register(Box::new(signup_latency_seconds.clone()))
            .expect("metric registration");

        Self {
            registry,
            accounts_created_total,
            wallets_bound_total,
            wallets_reset_total,
            emails_confirmed_total,
            rejected_requests_total,
            proxy_pool_size,
            signup_latency_seconds,
        }
    }

    /// Count a rejected request under its error kind.
    pub fn reject(&self, kind: &str) {
        self.rejected_requests_total.with_label_values(&[kind]).inc();
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Shared metrics state passed to axum handlers.
pub type SharedMetrics = Arc<ServiceMetrics>;

/// Axum handler that renders `/metrics` in Prometheus text format.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_with_namespace() {
        let metrics = ServiceMetrics::new();
        metrics.accounts_created_total.inc();
        metrics.reject("invite_exhausted");
        metrics.proxy_pool_size.set(7);

        let text = metrics.encode().unwrap();
        assert!(text.contains("keystead_accounts_created_total 1"));
        assert!(text.contains("keystead_rejected_requests_total{kind=\"invite_exhausted\"} 1"));
        assert!(text.contains("keystead_proxy_pool_size 7"));
    }
}
