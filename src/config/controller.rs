//! # Controller Configuration
//!
//! Process-level settings loaded from environment variables.

use crate::constants::{
    DEFAULT_BACKOFF_MAX_SECS, DEFAULT_BACKOFF_MIN_SECS, DEFAULT_CHALLENGE_PORT,
    DEFAULT_CHALLENGE_SERVICE_NAME, DEFAULT_CHALLENGE_SERVICE_PORT, DEFAULT_INGRESS_CLASS,
    DEFAULT_METRICS_PORT, DEFAULT_NAMESPACE, DEFAULT_RENEW_CHECK_INTERVAL_SECS,
    DEFAULT_SOLVER_SETTLE_DELAY_SECS, DEFAULT_WATCH_RESTART_DELAY_SECS, LETS_ENCRYPT_PRODUCTION,
};
use crate::controller::RetryPolicy;
use std::time::Duration;
use tracing::warn;

/// Controller-level configuration
///
/// All settings have defaults and can be overridden via environment variables.
/// Environment variables are usually populated from the Deployment's `env`/`envFrom`.
/// CLI flags parsed by the binary take precedence over both.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespace holding the desired-state ConfigMap, storage shards and
    /// solver Ingresses
    pub namespace: String,
    /// Seed ACME contact email, used only when no config document exists yet
    pub email: String,
    /// ACME directory URL
    pub acme_directory_url: String,
    /// Port for `/metrics`, `/healthz`, `/readyz` and `/debug/certs`
    pub metrics_port: u16,
    /// Port for the HTTP-01 challenge listener
    pub challenge_port: u16,
    /// Service the solver Ingress routes challenge traffic to
    pub challenge_service_name: String,
    /// Port of [`Self::challenge_service_name`]
    pub challenge_service_port: i32,
    /// Ingress class of solver Ingresses
    pub ingress_class: String,
    /// Time the data plane is given to pick up a new challenge route
    pub solver_settle_delay_secs: u64,
    /// Interval between renewal sweeps of the maintenance loop
    pub renew_check_interval_secs: u64,
    /// What the worker does with a failed reconciliation
    pub retry_policy: RetryPolicy,
    /// Rate-limited retry backoff bounds (seconds)
    pub backoff_min_secs: u64,
    pub backoff_max_secs: u64,
    /// Delay before re-opening the ConfigMap watch after the stream ends
    pub watch_restart_delay_secs: u64,
    /// Global log level (ERROR, WARN, INFO, DEBUG, TRACE)
    pub log_level: String,
    /// Log format (json, text)
    pub log_format: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            email: String::new(),
            acme_directory_url: LETS_ENCRYPT_PRODUCTION.to_string(),
            metrics_port: DEFAULT_METRICS_PORT,
            challenge_port: DEFAULT_CHALLENGE_PORT,
            challenge_service_name: DEFAULT_CHALLENGE_SERVICE_NAME.to_string(),
            challenge_service_port: DEFAULT_CHALLENGE_SERVICE_PORT,
            ingress_class: DEFAULT_INGRESS_CLASS.to_string(),
            solver_settle_delay_secs: DEFAULT_SOLVER_SETTLE_DELAY_SECS,
            renew_check_interval_secs: DEFAULT_RENEW_CHECK_INTERVAL_SECS,
            retry_policy: RetryPolicy::NoRetry,
            backoff_min_secs: DEFAULT_BACKOFF_MIN_SECS,
            backoff_max_secs: DEFAULT_BACKOFF_MAX_SECS,
            watch_restart_delay_secs: DEFAULT_WATCH_RESTART_DELAY_SECS,
            log_level: "INFO".to_string(),
            log_format: "text".to_string(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    ///
    /// [`Self::from_env`] is this with `std::env::var`; tests pass a map.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let retry_policy = match lookup("RETRY_POLICY") {
            Some(raw) => raw.parse().unwrap_or_else(|e| {
                warn!("Ignoring RETRY_POLICY: {}", e);
                defaults.retry_policy
            }),
            None => defaults.retry_policy,
        };

        Self {
            namespace: or_default_str(&lookup, "POD_NAMESPACE", &defaults.namespace),
            email: or_default_str(&lookup, "ACME_EMAIL", &defaults.email),
            acme_directory_url: or_default_str(
                &lookup,
                "ACME_DIRECTORY_URL",
                &defaults.acme_directory_url,
            ),
            metrics_port: or_default(&lookup, "METRICS_PORT", defaults.metrics_port),
            challenge_port: or_default(&lookup, "CHALLENGE_PORT", defaults.challenge_port),
            challenge_service_name: or_default_str(
                &lookup,
                "CHALLENGE_SERVICE_NAME",
                &defaults.challenge_service_name,
            ),
            challenge_service_port: or_default(
                &lookup,
                "CHALLENGE_SERVICE_PORT",
                defaults.challenge_service_port,
            ),
            ingress_class: or_default_str(&lookup, "INGRESS_CLASS", &defaults.ingress_class),
            solver_settle_delay_secs: or_default(
                &lookup,
                "SOLVER_SETTLE_DELAY_SECS",
                defaults.solver_settle_delay_secs,
            ),
            renew_check_interval_secs: or_default(
                &lookup,
                "RENEW_CHECK_INTERVAL_SECS",
                defaults.renew_check_interval_secs,
            ),
            retry_policy,
            backoff_min_secs: or_default(&lookup, "BACKOFF_MIN_SECS", defaults.backoff_min_secs),
            backoff_max_secs: or_default(&lookup, "BACKOFF_MAX_SECS", defaults.backoff_max_secs),
            watch_restart_delay_secs: or_default(
                &lookup,
                "WATCH_RESTART_DELAY_SECS",
                defaults.watch_restart_delay_secs,
            ),
            log_level: or_default_str(&lookup, "LOG_LEVEL", &defaults.log_level),
            log_format: or_default_str(&lookup, "LOG_FORMAT", &defaults.log_format),
        }
    }

    /// Get solver settle delay duration
    #[must_use]
    pub fn solver_settle_delay(&self) -> Duration {
        Duration::from_secs(self.solver_settle_delay_secs)
    }

    /// Get renewal sweep interval duration
    #[must_use]
    pub fn renew_check_interval(&self) -> Duration {
        Duration::from_secs(self.renew_check_interval_secs)
    }

    /// Get watch restart delay duration
    #[must_use]
    pub fn watch_restart_delay(&self) -> Duration {
        Duration::from_secs(self.watch_restart_delay_secs)
    }
}

/// Read a key and parse it, or return the default value
fn or_default<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Read a key as a non-empty string or return the default value
fn or_default_str<F>(lookup: &F, key: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}
