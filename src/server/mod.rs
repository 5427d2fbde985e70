//! # Server
//!
//! Composition root. Builds every component from a [`ControllerConfig`] and a
//! Kubernetes client, then runs four tasks until shutdown:
//!
//! - ConfigMap watch feeding the work queue
//! - Controller worker
//! - Operational HTTP server (metrics, probes, debug status)
//! - HTTP-01 challenge listener
//!
//! The first task to fail cancels the others.

pub mod challenge;
pub mod http;

pub use http::{Probe, ServerState};

use crate::acme::{
    AcmeEngine, AcmeEngineOptions, CertEngine, ChallengeSolver, ChallengeStore,
};
use crate::cert::ConfigMgr;
use crate::certmgr::CertMgr;
use crate::config::ControllerConfig;
use crate::constants::CONFIGMAP_NAME;
use crate::controller::backoff::FibonacciBackoff;
use crate::controller::queue::WorkQueue;
use crate::controller::{run_watch, ConfigMapLister, Controller, WatchOptions};
use crate::k8s::{KubeObjectApi, ObjectApi};
use crate::secret::SecretMgr;
use crate::solver::{IngressSolver, SolverOptions};
use crate::storage::{ConfigmapStorage, Storage};
use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::api::networking::v1::Ingress;
use kube::{Api, Client};
use kube_runtime::reflector::store::Writer;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Readiness probe names
pub const PROBE_CONFIG_LOADED: &str = "config-loaded";
pub const PROBE_CONTROLLER_SYNCED: &str = "controller-synced";

/// Wire the controller and run it until `cancel` fires or a task fails
#[allow(
    clippy::missing_errors_doc,
    clippy::too_many_lines,
    reason = "Startup wiring reads top to bottom; errors are startup failures"
)]
pub async fn run(config: ControllerConfig, client: Client, cancel: CancellationToken) -> Result<()> {
    let namespace = config.namespace.as_str();
    warn!(
        namespace = %namespace,
        "Storage locks are process-local; run exactly one replica of this controller"
    );

    let configmaps: Arc<dyn ObjectApi<ConfigMap>> =
        Arc::new(KubeObjectApi::<ConfigMap>::new(client.clone()));
    let secrets: Arc<dyn ObjectApi<Secret>> = Arc::new(KubeObjectApi::<Secret>::new(client.clone()));
    let ingresses: Arc<dyn ObjectApi<Ingress>> =
        Arc::new(KubeObjectApi::<Ingress>::new(client.clone()));

    let config_mgr = Arc::new(ConfigMgr::new(namespace, Arc::clone(&configmaps)));
    let initial = config_mgr
        .init_config(&config.email)
        .await
        .context("Failed to initialize certificate config")?;
    info!(
        email = %initial.email,
        automatic_https = initial.automatic_https,
        domains = initial.managed_domains().len(),
        "Certificate config loaded"
    );
    let engine_options = AcmeEngineOptions {
        directory_url: config.acme_directory_url.clone(),
        email: initial.email.clone(),
        renewal_window_ratio: initial.renewal_window_ratio,
        renew_check_interval: config.renew_check_interval(),
        ..AcmeEngineOptions::default()
    };
    config_mgr.set_config(Arc::new(initial));

    let storage: Arc<dyn Storage> =
        Arc::new(ConfigmapStorage::new(namespace, Arc::clone(&configmaps)));
    let challenges = Arc::new(ChallengeStore::new());
    let solver: Arc<dyn ChallengeSolver> = Arc::new(IngressSolver::new(
        namespace,
        ingresses,
        SolverOptions::from(&config),
    ));
    let engine = AcmeEngine::new(
        engine_options,
        Arc::clone(&storage),
        solver,
        Arc::clone(&challenges),
        cancel.child_token(),
    );
    info!(
        directory = %config.acme_directory_url,
        issuer_key = %engine.issuer_key(),
        "ACME engine configured with HTTP-01 challenges"
    );
    let engine: Arc<dyn CertEngine> = Arc::new(engine);
    let secret_mgr = Arc::new(SecretMgr::new(namespace, secrets));
    let cert_mgr = CertMgr::new(Arc::clone(&config_mgr), storage, engine, secret_mgr);

    let writer: Writer<ConfigMap> = Writer::default();
    let lister: Arc<dyn ConfigMapLister> = Arc::new(writer.as_reader());
    let queue = Arc::new(WorkQueue::new());
    let synced = Arc::new(AtomicBool::new(false));
    let controller = Controller::new(
        namespace,
        Arc::clone(&cert_mgr),
        lister,
        Arc::clone(&queue),
        config.retry_policy,
        FibonacciBackoff::new(config.backoff_min_secs, config.backoff_max_secs),
    );

    let state = Arc::new(ServerState {
        probes: vec![
            Probe::new(PROBE_CONFIG_LOADED, move || config_mgr.get_config().is_some()),
            Probe::flag(PROBE_CONTROLLER_SYNCED, Arc::clone(&synced)),
        ],
        cert_mgr,
    });

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();
    tasks.spawn(http::serve(
        config.metrics_port,
        http::router(state),
        cancel.clone(),
    ));
    tasks.spawn(http::serve(
        config.challenge_port,
        challenge::router(challenges),
        cancel.clone(),
    ));
    {
        let api = Api::<ConfigMap>::namespaced(client, namespace);
        let options = WatchOptions {
            namespace: namespace.to_string(),
            name: CONFIGMAP_NAME.to_string(),
            restart_delay: config.watch_restart_delay(),
        };
        let queue = Arc::clone(&queue);
        let cancel = cancel.clone();
        tasks.spawn(async move {
            run_watch(api, options, writer, queue, synced, cancel).await;
            Ok(())
        });
    }
    {
        let cancel = cancel.clone();
        tasks.spawn(async move {
            controller.run_worker(cancel).await;
            Ok(())
        });
    }

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let result = match joined {
            Ok(result) => result,
            Err(e) => Err(anyhow::Error::from(e).context("Controller task panicked")),
        };
        if let Err(e) = result {
            error!("Controller task failed: {:#}", e);
            cancel.cancel();
            first_error.get_or_insert(e);
        } else if !cancel.is_cancelled() {
            warn!("Controller task exited early, shutting down");
            cancel.cancel();
        }
    }
    queue.shut_down();

    match first_error {
        Some(e) => Err(e),
        None => {
            info!("Controller stopped");
            Ok(())
        }
    }
}
