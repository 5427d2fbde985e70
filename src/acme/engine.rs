//! `instant-acme` backed [`CertEngine`]
//!
//! ## Storage layout
//!
//! - `/acme/<issuer>/users/<email>/account.json`: account credentials
//! - `/certificates/<issuer>/<domain>.crt`: PEM chain, leaf first
//! - `/certificates/<issuer>/<domain>.key`: PEM private key
//! - `/certificates/<issuer>/<domain>.json`: issuance metadata
//!
//! `<issuer>` is derived from the directory URL, see
//! [`issuer_key_for_directory`].
//!
//! ## Issuance
//!
//! For each domain without a current certificate: create an order, present
//! every pending HTTP-01 challenge through the [`ChallengeSolver`], wait for
//! the route to settle, mark the challenge ready and poll the order until the
//! CA validated it. Solver routes are removed whether or not validation
//! succeeded. The order is then finalized, the chain and key are stored and
//! `cert_obtained` is emitted.

use super::certs::{leaf_validity, Validity};
use super::events::{CertObtained, EVENT_CERT_OBTAINED};
use super::{
    CertEngine, Challenge, ChallengeSolver, ChallengeStore, DomainFailure, DomainState,
    EngineError, EventSink, ManagedDomain,
};
use crate::constants::{
    ACME_MAX_POLL_ATTEMPTS, ACME_POLL_INTERVAL_MS, CERTIFICATES_PREFIX,
    DEFAULT_RENEWAL_WINDOW_RATIO, DEFAULT_RENEW_CHECK_INTERVAL_SECS, LETS_ENCRYPT_PRODUCTION,
};
use crate::observability::metrics;
use crate::storage::Storage;
use async_trait::async_trait;
use chrono::Utc;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Storage namespace for a directory URL
///
/// `https://acme-v02.api.letsencrypt.org/directory` becomes
/// `acme-v02.api.letsencrypt.org-directory`.
#[must_use]
pub fn issuer_key_for_directory(directory_url: &str) -> String {
    let without_scheme = directory_url
        .split_once("://")
        .map_or(directory_url, |(_, rest)| rest);
    without_scheme
        .trim_matches('/')
        .replace(['/', ':'], "-")
}

/// Tunables for [`AcmeEngine`]
#[derive(Debug, Clone)]
pub struct AcmeEngineOptions {
    pub directory_url: String,
    pub email: String,
    pub renewal_window_ratio: f64,
    /// Interval between renewal sweeps of the maintenance loop
    pub renew_check_interval: Duration,
    /// Delay between order and certificate polls
    pub poll_interval: Duration,
    pub max_poll_attempts: usize,
}

impl Default for AcmeEngineOptions {
    fn default() -> Self {
        Self {
            directory_url: LETS_ENCRYPT_PRODUCTION.to_string(),
            email: String::new(),
            renewal_window_ratio: DEFAULT_RENEWAL_WINDOW_RATIO,
            renew_check_interval: Duration::from_secs(DEFAULT_RENEW_CHECK_INTERVAL_SECS),
            poll_interval: Duration::from_millis(ACME_POLL_INTERVAL_MS),
            max_poll_attempts: ACME_MAX_POLL_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone)]
struct Settings {
    email: String,
    renewal_window_ratio: f64,
}

/// Certificate engine speaking ACME with HTTP-01 challenges
pub struct AcmeEngine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AcmeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeEngine")
            .field("directory_url", &self.inner.directory_url)
            .field("issuer_key", &self.inner.issuer_key)
            .finish_non_exhaustive()
    }
}

struct Inner {
    directory_url: String,
    issuer_key: String,
    storage: Arc<dyn Storage>,
    solver: Arc<dyn ChallengeSolver>,
    challenges: Arc<ChallengeStore>,
    settings: RwLock<Settings>,
    sink: RwLock<Option<Weak<dyn EventSink>>>,
    managed: Mutex<BTreeMap<String, ManagedDomain>>,
    /// Cached account and the email it was registered with
    account: tokio::sync::Mutex<Option<(String, Account)>>,
    /// Serializes issuance per domain between `manage_sync` and maintenance
    domain_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    maintenance: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
    renew_check_interval: Duration,
    poll_interval: Duration,
    max_poll_attempts: usize,
}

impl AcmeEngine {
    #[must_use]
    pub fn new(
        options: AcmeEngineOptions,
        storage: Arc<dyn Storage>,
        solver: Arc<dyn ChallengeSolver>,
        challenges: Arc<ChallengeStore>,
        shutdown: CancellationToken,
    ) -> Self {
        let issuer_key = issuer_key_for_directory(&options.directory_url);
        Self {
            inner: Arc::new(Inner {
                directory_url: options.directory_url,
                issuer_key,
                storage,
                solver,
                challenges,
                settings: RwLock::new(Settings {
                    email: options.email,
                    renewal_window_ratio: options.renewal_window_ratio,
                }),
                sink: RwLock::new(None),
                managed: Mutex::new(BTreeMap::new()),
                account: tokio::sync::Mutex::new(None),
                domain_locks: Mutex::new(HashMap::new()),
                maintenance: Mutex::new(None),
                shutdown,
                renew_check_interval: options.renew_check_interval,
                poll_interval: options.poll_interval,
                max_poll_attempts: options.max_poll_attempts,
            }),
        }
    }

    #[must_use]
    pub fn issuer_key(&self) -> &str {
        &self.inner.issuer_key
    }

    #[must_use]
    pub fn is_maintenance_running(&self) -> bool {
        lock(&self.inner.maintenance).is_some()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Storage paths of one domain's material
struct CertPaths {
    site: String,
    certificate: String,
    private_key: String,
    metadata: String,
}

impl Inner {
    fn settings(&self) -> Settings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn cert_paths(&self, domain: &str) -> CertPaths {
        let site = format!("{CERTIFICATES_PREFIX}/{}/{domain}", self.issuer_key);
        CertPaths {
            certificate: format!("{site}.crt"),
            private_key: format!("{site}.key"),
            metadata: format!("{site}.json"),
            site,
        }
    }

    fn account_path(&self, email: &str) -> String {
        format!("/acme/{}/users/{email}/account.json", self.issuer_key)
    }

    fn record(&self, domain: &str, state: DomainState, validity: Option<Validity>, error: Option<String>) {
        let mut managed = lock(&self.managed);
        let entry = managed
            .entry(domain.to_string())
            .or_insert_with(|| ManagedDomain {
                domain: domain.to_string(),
                state: DomainState::Pending,
                not_after: None,
                last_error: None,
            });
        entry.state = state;
        if let Some(validity) = validity {
            entry.not_after = Some(validity.not_after);
        }
        entry.last_error = error;
    }

    fn domain_lock(&self, domain: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            lock(&self.domain_locks)
                .entry(domain.to_string())
                .or_default(),
        )
    }

    /// Validity of the stored certificate, if any
    async fn stored_validity(&self, paths: &CertPaths) -> Result<Option<Validity>, EngineError> {
        match self.storage.load(&paths.certificate).await {
            Ok(bundle) => Ok(Some(leaf_validity(&bundle)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Obtain or renew `domain` unless its stored certificate is current
    async fn ensure_domain(&self, domain: &str) -> Result<(), EngineError> {
        if domain.starts_with("*.") {
            return Err(EngineError::Order {
                domain: domain.to_string(),
                reason: "wildcard names cannot be validated with HTTP-01".to_string(),
            });
        }

        let domain_lock = self.domain_lock(domain);
        let _issuing = domain_lock.lock().await;

        let paths = self.cert_paths(domain);
        let ratio = self.settings().renewal_window_ratio;
        let now = Utc::now();
        let existing = self.stored_validity(&paths).await?;

        if let Some(validity) = existing {
            if !validity.needs_renewal(now, ratio) {
                debug!(domain = %domain, not_after = %validity.not_after, "Certificate is current");
                self.record(domain, DomainState::Valid, Some(validity), None);
                return Ok(());
            }
            info!(domain = %domain, not_after = %validity.not_after, "Certificate is due for renewal");
        }

        let lock_name = format!("issue_cert_{domain}");
        self.storage.lock(&lock_name).await?;
        let issued = self.issue(domain, &paths).await;
        if let Err(e) = self.storage.unlock(&lock_name).await {
            warn!(domain = %domain, "Failed to release storage lock: {}", e);
        }
        let validity = issued?;

        let event = CertObtained {
            renewal: existing.is_some(),
            remaining: existing.map_or(0, |v| v.remaining(now).num_seconds()),
            identifier: domain.to_string(),
            issuer: self.issuer_key.clone(),
            storage_path: paths.site.clone(),
            private_key_path: paths.private_key.clone(),
            certificate_path: paths.certificate.clone(),
            metadata_path: paths.metadata.clone(),
        };
        let emit_error = self.emit(EVENT_CERT_OBTAINED, &event).await;
        self.record(domain, DomainState::Valid, Some(validity), emit_error);
        Ok(())
    }

    /// Run the ACME exchange and store the result
    async fn issue(&self, domain: &str, paths: &CertPaths) -> Result<Validity, EngineError> {
        let account = self.account().await?;
        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account.new_order(&NewOrder::new(&identifiers)).await?;

        let mut presented = Vec::new();
        let authorized = self.authorize(&mut order, domain, &mut presented).await;
        for challenge in &presented {
            self.challenges.remove_challenge(&challenge.token).await;
            if let Err(e) = self.solver.cleanup(challenge).await {
                warn!(domain = %domain, "Failed to clean up challenge: {}", e);
            }
        }
        authorized?;

        let private_key = order.finalize().await?;
        let mut certificate = None;
        for _ in 0..self.max_poll_attempts {
            if let Some(chain) = order.certificate().await? {
                certificate = Some(chain);
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        let certificate = certificate.ok_or_else(|| EngineError::Order {
            domain: domain.to_string(),
            reason: "certificate was not issued in time".to_string(),
        })?;
        let validity = leaf_validity(certificate.as_bytes())?;

        let metadata = serde_json::json!({
            "sans": [domain],
            "issuer": self.issuer_key,
            "not_before": validity.not_before,
            "not_after": validity.not_after,
        });
        self.storage
            .store(&paths.private_key, private_key.as_bytes())
            .await?;
        self.storage
            .store(&paths.certificate, certificate.as_bytes())
            .await?;
        self.storage
            .store(&paths.metadata, &serde_json::to_vec(&metadata)?)
            .await?;

        info!(domain = %domain, not_after = %validity.not_after, "Certificate obtained");
        Ok(validity)
    }

    /// Complete every pending authorization and wait for the order to be ready
    async fn authorize(
        &self,
        order: &mut Order,
        domain: &str,
        presented: &mut Vec<Challenge>,
    ) -> Result<(), EngineError> {
        {
            let mut authorizations = order.authorizations();
            while let Some(authorization) = authorizations.next().await {
                let mut authorization = authorization?;
                match authorization.status {
                    AuthorizationStatus::Valid => continue,
                    AuthorizationStatus::Pending => {}
                    status => {
                        return Err(EngineError::Order {
                            domain: domain.to_string(),
                            reason: format!("unexpected authorization status {status:?}"),
                        })
                    }
                }

                let mut handle = authorization
                    .challenge(ChallengeType::Http01)
                    .ok_or_else(|| EngineError::Order {
                        domain: domain.to_string(),
                        reason: "no HTTP-01 challenge offered".to_string(),
                    })?;
                let challenge = Challenge {
                    domain: domain.to_string(),
                    token: handle.token.clone(),
                    key_authorization: handle.key_authorization().as_str().to_string(),
                };

                self.challenges
                    .add_challenge(&challenge.token, &challenge.key_authorization)
                    .await;
                presented.push(challenge.clone());
                self.solver.present(&challenge).await?;
                self.solver.wait(&self.shutdown, &challenge).await?;
                handle.set_ready().await?;
                debug!(domain = %domain, "Challenge set ready");
            }
        }

        for attempt in 1..=self.max_poll_attempts {
            tokio::time::sleep(self.poll_interval).await;
            let state = order.refresh().await?;
            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
                OrderStatus::Invalid => {
                    return Err(EngineError::Order {
                        domain: domain.to_string(),
                        reason: "order became invalid, challenge validation failed".to_string(),
                    })
                }
                status => debug!(domain = %domain, attempt, ?status, "Order not ready yet"),
            }
        }
        Err(EngineError::Order {
            domain: domain.to_string(),
            reason: format!("order not ready after {} polls", self.max_poll_attempts),
        })
    }

    /// Account for the configured email, loaded from storage or registered
    async fn account(&self) -> Result<Account, EngineError> {
        let email = self.settings().email;
        let mut cached = self.account.lock().await;
        if let Some((cached_email, account)) = cached.as_ref() {
            if *cached_email == email {
                return Ok(account.clone());
            }
        }

        let path = self.account_path(&email);
        let stored = match self.storage.load(&path).await {
            Ok(bytes) => Some(bytes),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };
        let account = if let Some(bytes) = stored {
            let credentials: AccountCredentials = serde_json::from_slice(&bytes)?;
            debug!(email = %email, "Restoring ACME account from storage");
            Account::builder()?.from_credentials(credentials).await?
        } else {
            info!(email = %email, directory = %self.directory_url, "Registering ACME account");
            let contact = format!("mailto:{email}");
            let (account, credentials) = Account::builder()?
                .create(
                    &NewAccount {
                        contact: &[&contact],
                        terms_of_service_agreed: true,
                        only_return_existing: false,
                    },
                    self.directory_url.clone(),
                    None,
                )
                .await?;
            self.storage
                .store(&path, &serde_json::to_vec(&credentials)?)
                .await?;
            account
        };

        *cached = Some((email, account.clone()));
        Ok(account)
    }

    /// Deliver an event, returning the handler's error message if it failed
    async fn emit(&self, event: &str, payload: &CertObtained) -> Option<String> {
        let sink = self
            .sink
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade);
        let Some(sink) = sink else {
            warn!(event = %event, domain = %payload.identifier, "No event sink registered, dropping event");
            return None;
        };
        match sink.on_event(event, &payload.to_payload()).await {
            Ok(()) => None,
            Err(e) => {
                error!(event = %event, domain = %payload.identifier, "Event handler failed: {:#}", e);
                Some(format!("{event} handler: {e:#}"))
            }
        }
    }

    async fn manage(&self, domains: &[String]) -> Result<(), EngineError> {
        for domain in domains {
            let mut managed = lock(&self.managed);
            managed
                .entry(domain.clone())
                .or_insert_with(|| ManagedDomain {
                    domain: domain.clone(),
                    state: DomainState::Pending,
                    not_after: None,
                    last_error: None,
                });
        }
        metrics::set_managed_domains(lock(&self.managed).len());

        let results = futures::future::join_all(domains.iter().map(|domain| {
            let span = tracing::info_span!("acme.ensure", domain = %domain);
            async move { (domain, self.ensure_domain(domain).await) }.instrument(span)
        }))
        .await;

        let failures: Vec<DomainFailure> = results
            .into_iter()
            .filter_map(|(domain, result)| {
                result.err().map(|e| {
                    error!(domain = %domain, "Certificate management failed: {}", e);
                    self.record(domain, DomainState::Failed, None, Some(e.to_string()));
                    DomainFailure {
                        domain: domain.clone(),
                        reason: e.to_string(),
                    }
                })
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Partial {
                total: domains.len(),
                failures,
            })
        }
    }

    /// One maintenance pass over every managed domain
    async fn renew_due(&self) {
        let domains: Vec<String> = lock(&self.managed).keys().cloned().collect();
        if domains.is_empty() {
            return;
        }
        debug!(count = domains.len(), "Checking managed certificates for renewal");
        if let Err(e) = self.manage(&domains).await {
            warn!("Renewal sweep finished with failures: {}", e);
        }
    }
}

#[async_trait]
impl CertEngine for AcmeEngine {
    fn set_email(&self, email: &str) {
        self.inner
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .email = email.to_string();
    }

    fn set_renewal_window_ratio(&self, ratio: f64) {
        self.inner
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .renewal_window_ratio = ratio;
    }

    fn set_event_sink(&self, sink: Weak<dyn EventSink>) {
        *self
            .inner
            .sink
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    fn start_maintenance(&self) {
        let mut maintenance = lock(&self.inner.maintenance);
        if maintenance.is_some() {
            return;
        }
        let token = self.inner.shutdown.child_token();
        *maintenance = Some(token.clone());

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            info!(
                interval_secs = inner.renew_check_interval.as_secs(),
                "Certificate maintenance loop started"
            );
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(inner.renew_check_interval) => inner.renew_due().await,
                }
            }
            info!("Certificate maintenance loop stopped");
        });
    }

    fn stop_maintenance(&self) {
        if let Some(token) = lock(&self.inner.maintenance).take() {
            token.cancel();
        }
    }

    async fn manage_sync(&self, domains: &[String]) -> Result<(), EngineError> {
        self.inner.manage(domains).await
    }

    fn unmanage(&self, domains: &[String]) {
        let mut managed = lock(&self.inner.managed);
        for domain in domains {
            if managed.remove(domain).is_some() {
                info!(domain = %domain, "Domain no longer managed, renewal stopped");
            }
        }
        metrics::set_managed_domains(managed.len());
    }

    fn status(&self) -> Vec<ManagedDomain> {
        lock(&self.inner.managed).values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::SolverError;
    use crate::k8s::InMemoryObjectApi;
    use crate::storage::ConfigmapStorage;
    use k8s_openapi::api::core::v1::ConfigMap;

    struct NoopSolver;

    #[async_trait]
    impl ChallengeSolver for NoopSolver {
        async fn present(&self, _challenge: &Challenge) -> Result<(), SolverError> {
            Ok(())
        }
        async fn wait(
            &self,
            _cancel: &CancellationToken,
            _challenge: &Challenge,
        ) -> Result<(), SolverError> {
            Ok(())
        }
        async fn cleanup(&self, _challenge: &Challenge) -> Result<(), SolverError> {
            Ok(())
        }
    }

    const WWW_CRT: &str =
        "/certificates/acme-v02.api.letsencrypt.org-directory/www.example.com.crt";

    fn engine() -> (Arc<ConfigmapStorage>, AcmeEngine) {
        engine_over(Arc::new(InMemoryObjectApi::<ConfigMap>::new()))
    }

    fn engine_over(api: Arc<InMemoryObjectApi<ConfigMap>>) -> (Arc<ConfigmapStorage>, AcmeEngine) {
        let storage = Arc::new(ConfigmapStorage::new("higress-system", api));
        let engine = AcmeEngine::new(
            AcmeEngineOptions {
                email: "ops@example.com".to_string(),
                ..AcmeEngineOptions::default()
            },
            storage.clone(),
            Arc::new(NoopSolver),
            Arc::new(ChallengeStore::new()),
            CancellationToken::new(),
        );
        (storage, engine)
    }

    fn long_lived_pem() -> String {
        let mut params = rcgen::CertificateParams::new(vec!["www.example.com".to_string()])
            .expect("valid params");
        params.not_before = rcgen::date_time_ymd(2020, 1, 1);
        params.not_after = rcgen::date_time_ymd(2099, 1, 1);
        let key = rcgen::KeyPair::generate().expect("key");
        params.self_signed(&key).expect("certificate").pem()
    }

    #[test]
    fn test_issuer_key_for_directory() {
        assert_eq!(
            issuer_key_for_directory(LETS_ENCRYPT_PRODUCTION),
            "acme-v02.api.letsencrypt.org-directory"
        );
        assert_eq!(
            issuer_key_for_directory("https://localhost:14000/dir/"),
            "localhost-14000-dir"
        );
    }

    #[tokio::test]
    async fn test_current_certificate_is_not_reissued() {
        let (storage, engine) = engine();
        storage
            .store(
                "/certificates/acme-v02.api.letsencrypt.org-directory/www.example.com.crt",
                long_lived_pem().as_bytes(),
            )
            .await
            .unwrap();

        engine
            .manage_sync(&["www.example.com".to_string()])
            .await
            .unwrap();

        let status = engine.status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].state, DomainState::Valid);
        assert!(status[0].not_after.is_some());
        // No account was registered
        assert!(storage.list("/acme", true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wildcards_fail_without_blocking_other_domains() {
        let (storage, engine) = engine();
        storage
            .store(
                "/certificates/acme-v02.api.letsencrypt.org-directory/www.example.com.crt",
                long_lived_pem().as_bytes(),
            )
            .await
            .unwrap();

        let err = engine
            .manage_sync(&["*.example.com".to_string(), "www.example.com".to_string()])
            .await
            .unwrap_err();
        match err {
            EngineError::Partial { total, failures } => {
                assert_eq!(total, 2);
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].domain, "*.example.com");
            }
            other => panic!("unexpected error: {other}"),
        }

        let states: BTreeMap<String, DomainState> = engine
            .status()
            .into_iter()
            .map(|m| (m.domain, m.state))
            .collect();
        assert_eq!(states["*.example.com"], DomainState::Failed);
        assert_eq!(states["www.example.com"], DomainState::Valid);
    }

    #[tokio::test]
    async fn test_storage_outage_is_not_treated_as_missing_certificate() {
        let api = Arc::new(InMemoryObjectApi::<ConfigMap>::new());
        let (storage, engine) = engine_over(api.clone());
        storage
            .store(WWW_CRT, long_lived_pem().as_bytes())
            .await
            .unwrap();
        let writes = api.writes();

        api.set_unavailable(true);
        let err = engine
            .manage_sync(&["www.example.com".to_string()])
            .await
            .unwrap_err();
        match err {
            EngineError::Partial { total, failures } => {
                assert_eq!(total, 1);
                assert_eq!(failures.len(), 1);
                assert!(
                    failures[0].reason.contains("connection refused"),
                    "{}",
                    failures[0].reason
                );
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(engine.status()[0].state, DomainState::Failed);
        api.set_unavailable(false);

        // Neither an account nor an order was attempted
        assert_eq!(api.writes(), writes);
        assert!(storage.list("/acme", true).await.unwrap().is_empty());
        assert!(storage.exists(WWW_CRT).await);
    }

    #[tokio::test]
    async fn test_unmanaged_domains_leave_the_renewal_set() {
        let (storage, engine) = engine();
        storage
            .store(WWW_CRT, long_lived_pem().as_bytes())
            .await
            .unwrap();
        engine
            .manage_sync(&["www.example.com".to_string(), "*.example.com".to_string()])
            .await
            .unwrap_err();
        assert_eq!(engine.status().len(), 2);

        engine.unmanage(&["*.example.com".to_string(), "never.example.com".to_string()]);

        let domains: Vec<String> = engine.status().into_iter().map(|m| m.domain).collect();
        assert_eq!(domains, vec!["www.example.com".to_string()]);
        // Stored material is kept
        assert!(storage.exists(WWW_CRT).await);

        // The renewal sweep only revisits what is still managed
        engine.inner.renew_due().await;
        let status = engine.status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].state, DomainState::Valid);
    }

    #[tokio::test]
    async fn test_maintenance_start_stop_is_idempotent() {
        let (_, engine) = engine();
        engine.start_maintenance();
        engine.start_maintenance();
        assert!(engine.is_maintenance_running());
        engine.stop_maintenance();
        engine.stop_maintenance();
        assert!(!engine.is_maintenance_running());
    }

    #[test]
    fn test_settings_are_updated_in_place() {
        let (_, engine) = engine();
        engine.set_email("new@example.com");
        engine.set_renewal_window_ratio(0.25);
        let settings = engine.inner.settings();
        assert_eq!(settings.email, "new@example.com");
        assert!((settings.renewal_window_ratio - 0.25).abs() < f64::EPSILON);
        assert_eq!(
            engine.inner.account_path("new@example.com"),
            "/acme/acme-v02.api.letsencrypt.org-directory/users/new@example.com/account.json"
        );
    }
}
