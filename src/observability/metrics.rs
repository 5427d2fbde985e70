//! # Metrics
//!
//! Prometheus metrics for monitoring the controller.
//!
//! ## Metrics Exposed
//!
//! - `auto_https_reconciliations_total` - Total number of reconciliations
//! - `auto_https_reconciliation_errors_total` - Total number of reconciliation errors
//! - `auto_https_reconciliation_duration_seconds` - Duration of reconciliation operations
//! - `auto_https_requeues_total` - Rate-limited requeues by reason
//! - `auto_https_certificates_obtained_total` - Certificates published, by `renewal`
//! - `auto_https_managed_domains` - Domains the engine currently manages
//! - `auto_https_secret_writes_total` - TLS Secret writes by operation (create, update)
//! - `auto_https_secret_refusals_total` - Writes refused because the Secret is not owned
//! - `auto_https_storage_operations_total` - ConfigMap storage calls by operation
//! - `auto_https_challenge_requests_total` - HTTP-01 requests by result (found, missing)

use anyhow::Result;
use prometheus::{Histogram, IntCounter, IntCounterVec, IntGauge, Registry};
use std::sync::LazyLock;

// Metrics
pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "auto_https_reconciliations_total",
        "Total number of reconciliations",
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "auto_https_reconciliation_errors_total",
        "Total number of reconciliation errors",
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "auto_https_reconciliation_duration_seconds",
            "Duration of reconciliation in seconds",
        )
        // Issuance blocks the worker, so the tail is long
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0]),
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static REQUEUES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "auto_https_requeues_total",
            "Total number of rate-limited requeues by reason",
        ),
        &["reason"],
    )
    .expect("Failed to create REQUEUES_TOTAL metric - this should never happen")
});

static CERTIFICATES_OBTAINED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "auto_https_certificates_obtained_total",
            "Total number of certificates published to Secrets",
        ),
        &["renewal"],
    )
    .expect("Failed to create CERTIFICATES_OBTAINED_TOTAL metric - this should never happen")
});

static MANAGED_DOMAINS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "auto_https_managed_domains",
        "Current number of domains managed by the certificate engine",
    )
    .expect("Failed to create MANAGED_DOMAINS metric - this should never happen")
});

static SECRET_WRITES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "auto_https_secret_writes_total",
            "Total number of TLS Secret writes by operation",
        ),
        &["operation"],
    )
    .expect("Failed to create SECRET_WRITES_TOTAL metric - this should never happen")
});

static SECRET_REFUSALS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "auto_https_secret_refusals_total",
        "Total number of Secret writes refused because the Secret is not managed by automatic https",
    )
    .expect("Failed to create SECRET_REFUSALS_TOTAL metric - this should never happen")
});

static STORAGE_OPERATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "auto_https_storage_operations_total",
            "Total number of ConfigMap storage operations by operation",
        ),
        &["operation"],
    )
    .expect("Failed to create STORAGE_OPERATIONS_TOTAL metric - this should never happen")
});

static CHALLENGE_REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "auto_https_challenge_requests_total",
            "Total number of HTTP-01 challenge requests served by result",
        ),
        &["result"],
    )
    .expect("Failed to create CHALLENGE_REQUESTS_TOTAL metric - this should never happen")
});

#[allow(
    clippy::missing_errors_doc,
    reason = "Error documentation is provided in doc comments"
)]
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(REQUEUES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CERTIFICATES_OBTAINED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MANAGED_DOMAINS.clone()))?;
    REGISTRY.register(Box::new(SECRET_WRITES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SECRET_REFUSALS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STORAGE_OPERATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CHALLENGE_REQUESTS_TOTAL.clone()))?;

    Ok(())
}

pub fn increment_reconciliations() {
    RECONCILIATIONS_TOTAL.inc();
}

pub fn increment_reconciliation_errors() {
    RECONCILIATION_ERRORS_TOTAL.inc();
}

pub fn observe_reconciliation_duration(duration: f64) {
    RECONCILIATION_DURATION.observe(duration);
}

pub fn increment_requeues_total(reason: &str) {
    REQUEUES_TOTAL.with_label_values(&[reason]).inc();
}

pub fn increment_certificates_obtained(renewal: bool) {
    CERTIFICATES_OBTAINED_TOTAL
        .with_label_values(&[if renewal { "true" } else { "false" }])
        .inc();
}

pub fn set_managed_domains(count: usize) {
    MANAGED_DOMAINS.set(i64::try_from(count).unwrap_or(i64::MAX));
}

pub fn increment_secret_writes(operation: &str) {
    SECRET_WRITES_TOTAL.with_label_values(&[operation]).inc();
}

pub fn increment_secret_refusals() {
    SECRET_REFUSALS_TOTAL.inc();
}

pub fn increment_storage_operations(operation: &str) {
    STORAGE_OPERATIONS_TOTAL
        .with_label_values(&[operation])
        .inc();
}

/// `found` is whether a pending challenge matched the token
pub fn increment_challenge_requests(found: bool) {
    CHALLENGE_REQUESTS_TOTAL
        .with_label_values(&[if found { "found" } else { "missing" }])
        .inc();
}

/// Text exposition of every registered metric
#[allow(
    clippy::missing_errors_doc,
    reason = "Error documentation is provided in doc comments"
)]
pub fn gather_text() -> Result<String> {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
