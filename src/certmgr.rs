//! # Certificate Manager
//!
//! Drives the [`CertEngine`] from desired-state changes and turns its
//! `cert_obtained` events into TLS Secrets.
//!
//! ## Reconcile
//!
//! 1. Note an email change (an existing ACME account is not rotated)
//! 2. Diff managed domains between the old and new config
//! 3. `automaticHttps: true`: clean up removed domains, push email and
//!    renewal ratio to the engine, start maintenance, then block on
//!    [`CertEngine::manage_sync`]
//! 4. `automaticHttps: false`: stop maintenance
//!
//! The new config is published before the engine is driven, so events raised
//! during `manage_sync` resolve Secrets against the config that asked for the
//! certificate. It stays published when the engine fails.

use crate::acme::certs::{annotation_instant, leaf_validity};
use crate::acme::{CertEngine, CertObtained, EngineError, EventSink, EVENT_CERT_OBTAINED};
use crate::cert::{Config, ConfigMgr};
use crate::observability::metrics;
use crate::secret::{SecretMgr, TlsMaterial};
use crate::storage::Storage;
use anyhow::Context;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::{debug, info, warn, Instrument};
use zeroize::Zeroizing;

#[derive(Debug, Error)]
pub enum CertMgrError {
    #[error("certificate engine: {0}")]
    Engine(#[from] EngineError),
}

/// What a reconciliation asked of the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub automatic_https: bool,
    /// Domains handed to `manage_sync`; empty when automation is off
    pub managed: Vec<String>,
    /// Domains dropped since the previous config
    pub removed: Vec<String>,
}

pub struct CertMgr {
    config_mgr: Arc<ConfigMgr>,
    storage: Arc<dyn Storage>,
    engine: Arc<dyn CertEngine>,
    secret_mgr: Arc<SecretMgr>,
}

impl std::fmt::Debug for CertMgr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertMgr")
            .field("config_mgr", &self.config_mgr)
            .field("secret_mgr", &self.secret_mgr)
            .finish_non_exhaustive()
    }
}

/// `old` managed domains missing from `new`, compared case-insensitively
fn removed_domains(old: &[String], new: &[String]) -> Vec<String> {
    old.iter()
        .filter(|d| !new.iter().any(|n| n.eq_ignore_ascii_case(d)))
        .cloned()
        .collect()
}

impl CertMgr {
    /// Build the manager and register it as the engine's event sink
    pub fn new(
        config_mgr: Arc<ConfigMgr>,
        storage: Arc<dyn Storage>,
        engine: Arc<dyn CertEngine>,
        secret_mgr: Arc<SecretMgr>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Self>| {
            let sink: Weak<dyn EventSink> = Weak::<Self>::clone(this);
            engine.set_event_sink(sink);
            Self {
                config_mgr,
                storage,
                engine,
                secret_mgr,
            }
        })
    }

    #[must_use]
    pub fn config_mgr(&self) -> &Arc<ConfigMgr> {
        &self.config_mgr
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<dyn CertEngine> {
        &self.engine
    }

    /// Apply `new` on top of `old`
    pub async fn reconcile(
        &self,
        old: Option<&Config>,
        new: Arc<Config>,
    ) -> Result<ReconcileOutcome, CertMgrError> {
        if let Some(old) = old {
            if old.email != new.email {
                info!(
                    old_email = %old.email,
                    new_email = %new.email,
                    "ACME email changed; the existing account is kept and must be rotated manually"
                );
            }
        }

        let managed = new.managed_domains();
        let removed = old.map_or_else(Vec::new, |old| {
            removed_domains(&old.managed_domains(), &managed)
        });
        let automatic_https = new.automatic_https;

        self.config_mgr.set_config(Arc::clone(&new));

        if !automatic_https {
            info!("Automatic HTTPS disabled, stopping certificate maintenance");
            self.engine.stop_maintenance();
            return Ok(ReconcileOutcome {
                automatic_https,
                managed: Vec::new(),
                removed,
            });
        }

        self.clean_sync(&removed);
        self.engine.set_email(&new.email);
        self.engine
            .set_renewal_window_ratio(new.renewal_window_ratio);
        self.engine.start_maintenance();

        info!(domains = ?managed, "Ensuring certificates for managed domains");
        self.engine.manage_sync(&managed).await?;

        Ok(ReconcileOutcome {
            automatic_https,
            managed,
            removed,
        })
    }

    /// Stop renewing domains no longer managed
    ///
    /// Stored certificates and issued Secrets are left in place.
    fn clean_sync(&self, removed: &[String]) {
        if removed.is_empty() {
            return;
        }
        // TODO: delete /certificates/<issuer>/<domain>.* once Secrets can be
        // garbage collected alongside them
        info!(
            domains = ?removed,
            "Domains removed from config; renewal stops, stored certificates are kept"
        );
        self.engine.unmanage(removed);
    }

    async fn handle_cert_obtained(&self, event: &CertObtained) -> anyhow::Result<()> {
        let private_key = Zeroizing::new(
            self.storage
                .load(&event.private_key_path)
                .await
                .with_context(|| format!("failed to load private key {}", event.private_key_path))?,
        );
        let certificate = self
            .storage
            .load(&event.certificate_path)
            .await
            .with_context(|| format!("failed to load certificate {}", event.certificate_path))?;
        let validity = leaf_validity(&certificate)
            .with_context(|| format!("failed to parse certificate {}", event.certificate_path))?;

        let secret_name = self.config_mgr.get_config().and_then(|config| {
            config
                .match_secret_name_by_domain(&event.identifier)
                .map(str::to_string)
        });
        let Some(secret_name) = secret_name else {
            warn!(
                domain = %event.identifier,
                "No credentialConfig entry matches the domain, certificate is not published"
            );
            return Ok(());
        };

        self.secret_mgr
            .update(
                &secret_name,
                &TlsMaterial {
                    domain: &event.identifier,
                    private_key: &private_key,
                    certificate: &certificate,
                    not_before: annotation_instant(validity.not_before),
                    not_after: annotation_instant(validity.not_after),
                    is_renew: event.renewal,
                },
            )
            .await?;
        metrics::increment_certificates_obtained(event.renewal);
        Ok(())
    }
}

#[async_trait]
impl EventSink for CertMgr {
    async fn on_event(&self, event: &str, data: &Map<String, Value>) -> anyhow::Result<()> {
        if event != EVENT_CERT_OBTAINED {
            debug!(event = %event, "Ignoring certificate engine event");
            return Ok(());
        }
        let obtained =
            CertObtained::from_payload(data).context("malformed cert_obtained payload")?;
        let span = tracing::info_span!(
            "certmgr.cert_obtained",
            domain = %obtained.identifier,
            renewal = obtained.renewal
        );
        self.handle_cert_obtained(&obtained).instrument(span).await
    }
}
