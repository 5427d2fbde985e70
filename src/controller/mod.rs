//! # Controller
//!
//! Watches the desired-state ConfigMap and drives [`CertMgr::reconcile`].
//!
//! ```text
//!  watch ──▶ EventFilter ──▶ WorkQueue ──▶ worker ──▶ CertMgr::reconcile
//!    └──▶ Store (lister) ◀───────────────────┘
//! ```
//!
//! A single worker drains the queue, so reconciliations never interleave.
//! What happens to a failed item is the [`RetryPolicy`].
//!
//! - `backoff`: Fibonacci backoff for rate-limited requeues
//! - `queue`: deduplicating work queue
//! - `watch`: ConfigMap watch, event filter and lister

pub mod backoff;
pub mod queue;
pub mod watch;

use crate::cert::{ConfigError, ConfigMgr};
use crate::certmgr::{CertMgr, CertMgrError};
use crate::observability::metrics;
use backoff::FibonacciBackoff;
use queue::WorkQueue;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

pub use watch::{run_watch, ConfigMapLister, EventFilter, WatchOptions};

/// What the worker does with an item whose reconciliation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Log and drop; a later edit of the ConfigMap triggers the next attempt
    NoRetry,
    /// Requeue after a Fibonacci delay, reset on success
    RateLimited,
}

impl FromStr for RetryPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "no-retry" | "" => Ok(Self::NoRetry),
            "rate-limited" => Ok(Self::RateLimited),
            other => Err(format!(
                "unknown retry policy {other:?}, expected none or rate-limited"
            )),
        }
    }
}

impl std::fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::NoRetry => "none",
            Self::RateLimited => "rate-limited",
        })
    }
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("invalid certificate config: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Reconcile(#[from] CertMgrError),
}

/// Single-worker reconciliation loop over the desired-state ConfigMap
pub struct Controller {
    namespace: String,
    cert_mgr: Arc<CertMgr>,
    lister: Arc<dyn ConfigMapLister>,
    queue: Arc<WorkQueue>,
    retry_policy: RetryPolicy,
    backoff: Mutex<FibonacciBackoff>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("namespace", &self.namespace)
            .field("retry_policy", &self.retry_policy)
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl Controller {
    #[must_use]
    pub fn new(
        namespace: &str,
        cert_mgr: Arc<CertMgr>,
        lister: Arc<dyn ConfigMapLister>,
        queue: Arc<WorkQueue>,
        retry_policy: RetryPolicy,
        backoff: FibonacciBackoff,
    ) -> Self {
        Self {
            namespace: namespace.to_string(),
            cert_mgr,
            lister,
            queue,
            retry_policy,
            backoff: Mutex::new(backoff),
        }
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Reconcile the ConfigMap named `key` from the local store
    pub async fn process_item(&self, key: &str) -> Result<(), ControllerError> {
        let Some(configmap) = self.lister.get(&self.namespace, key) else {
            debug!(configmap = %key, "ConfigMap no longer in store, nothing to reconcile");
            return Ok(());
        };
        let new = ConfigMgr::parse_config_from_configmap(&configmap)?;
        let old = self.cert_mgr.config_mgr().get_config();

        let outcome = self
            .cert_mgr
            .reconcile(old.as_deref(), Arc::new(new))
            .await?;
        info!(
            automatic_https = outcome.automatic_https,
            managed = outcome.managed.len(),
            removed = outcome.removed.len(),
            "Reconciliation complete"
        );
        Ok(())
    }

    fn handle_result(&self, key: &str, result: Result<(), ControllerError>) {
        let mut backoff = self.backoff.lock().unwrap_or_else(PoisonError::into_inner);
        match result {
            Ok(()) => backoff.reset(),
            Err(e) => {
                metrics::increment_reconciliation_errors();
                match self.retry_policy {
                    RetryPolicy::NoRetry => {
                        error!(configmap = %key, "Reconciliation failed, dropping: {}", e);
                    }
                    RetryPolicy::RateLimited => {
                        let delay = backoff.next_backoff();
                        error!(
                            configmap = %key,
                            retry_in_secs = delay.as_secs(),
                            "Reconciliation failed, requeueing: {}",
                            e
                        );
                        metrics::increment_requeues_total("reconcile_error");
                        self.queue.add_after(key, delay);
                    }
                }
            }
        }
    }

    /// Drain the queue until `cancel` fires or the queue shuts down
    pub async fn run_worker(&self, cancel: CancellationToken) {
        info!(retry_policy = %self.retry_policy, "Controller worker started");
        loop {
            let key = tokio::select! {
                () = cancel.cancelled() => break,
                key = self.queue.get() => key,
            };
            let Some(key) = key else { break };

            let span = tracing::info_span!("reconcile", configmap = %key, namespace = %self.namespace);
            let started = Instant::now();
            metrics::increment_reconciliations();

            let result = tokio::select! {
                () = cancel.cancelled() => {
                    warn!(configmap = %key, "Reconciliation interrupted by shutdown");
                    break;
                }
                result = self.process_item(&key).instrument(span) => result,
            };
            metrics::observe_reconciliation_duration(started.elapsed().as_secs_f64());
            self.handle_result(&key, result);
        }
        self.queue.shut_down();
        info!("Controller worker stopped");
    }
}
