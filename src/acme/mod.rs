//! # ACME
//!
//! The certificate engine and the extension points it calls back into.
//!
//! ```text
//!            manage_sync(domains)
//!  CertMgr ───────────────────────▶ CertEngine ──▶ Storage          (account, certs)
//!     ▲                                  │    └──▶ ChallengeSolver  (HTTP-01 routes)
//!     └───────── EventSink::on_event ────┘
//! ```
//!
//! - [`CertEngine`]: what [`crate::certmgr::CertMgr`] drives
//! - [`ChallengeSolver`]: makes an HTTP-01 token reachable on the domain
//! - [`EventSink`]: receives `cert_obtained` once material is in storage
//!
//! [`AcmeEngine`] implements [`CertEngine`] with `instant-acme`.

pub mod certs;
pub mod challenges;
mod engine;
pub mod events;
#[cfg(test)]
pub(crate) mod testing;

pub use challenges::ChallengeStore;
pub use engine::{issuer_key_for_directory, AcmeEngine, AcmeEngineOptions};
pub use events::{CertObtained, EVENT_CERT_OBTAINED};

use crate::constants::ACME_CHALLENGE_PATH_PREFIX;
use crate::k8s::ClusterError;
use crate::storage::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Weak;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// One pending HTTP-01 challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub domain: String,
    pub token: String,
    pub key_authorization: String,
}

impl Challenge {
    /// Path the CA requests on the domain
    #[must_use]
    pub fn http01_resource_path(&self) -> String {
        format!("{ACME_CHALLENGE_PATH_PREFIX}{}", self.token)
    }
}

/// Errors from challenge solvers
#[derive(Debug, Error)]
pub enum SolverError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("waiting for challenge on {0} was cancelled")]
    Cancelled(String),
}

/// Makes HTTP-01 challenges answerable
#[async_trait]
pub trait ChallengeSolver: Send + Sync {
    /// Route the challenge path for `challenge.domain` to the responder
    async fn present(&self, challenge: &Challenge) -> Result<(), SolverError>;

    /// Block until the route is live or `cancel` fires
    async fn wait(
        &self,
        cancel: &CancellationToken,
        challenge: &Challenge,
    ) -> Result<(), SolverError>;

    /// Remove whatever [`Self::present`] created
    async fn cleanup(&self, challenge: &Challenge) -> Result<(), SolverError>;
}

/// Receives engine lifecycle events
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn on_event(&self, event: &str, data: &Map<String, Value>) -> anyhow::Result<()>;
}

/// Issuance state of one managed domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainState {
    Pending,
    Valid,
    Failed,
}

/// Engine view of one managed domain, served by `/debug/certs`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedDomain {
    pub domain: String,
    pub state: DomainState,
    pub not_after: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// One domain that failed during [`CertEngine::manage_sync`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainFailure {
    pub domain: String,
    pub reason: String,
}

impl fmt::Display for DomainFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.domain, self.reason)
    }
}

fn join_failures(failures: &[DomainFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors from the certificate engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Solver(#[from] SolverError),

    #[error("ACME protocol error: {0}")]
    Acme(#[from] instant_acme::Error),

    #[error(transparent)]
    Certificate(#[from] certs::CertificateError),

    #[error("malformed stored ACME data: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("order for {domain} failed: {reason}")]
    Order { domain: String, reason: String },

    /// Every domain was attempted; these did not end with a valid certificate
    #[error("{} of {total} domains failed: {}", .failures.len(), join_failures(.failures))]
    Partial {
        total: usize,
        failures: Vec<DomainFailure>,
    },
}

/// Certificate lifecycle engine
#[async_trait]
pub trait CertEngine: Send + Sync {
    /// ACME account contact used for the next registration
    fn set_email(&self, email: &str);

    fn set_renewal_window_ratio(&self, ratio: f64);

    /// Where `cert_obtained` goes; the engine does not keep the sink alive
    fn set_event_sink(&self, sink: Weak<dyn EventSink>);

    /// Start the background renewal loop; no-op when already running
    fn start_maintenance(&self);

    /// Stop the background renewal loop; no-op when stopped
    fn stop_maintenance(&self);

    /// Ensure every domain has a valid, non-expiring certificate
    ///
    /// Blocks until each domain was obtained, renewed, confirmed current or
    /// failed. One failing domain does not stop the others.
    async fn manage_sync(&self, domains: &[String]) -> Result<(), EngineError>;

    /// Stop renewing `domains`; stored certificates and Secrets are kept
    fn unmanage(&self, domains: &[String]);

    /// Snapshot of managed domains
    fn status(&self) -> Vec<ManagedDomain>;
}
