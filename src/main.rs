//! # Auto HTTPS Controller
//!
//! Kubernetes controller that keeps ACME certificates for gateway domains
//! issued, renewed and published as TLS Secrets.
//!
//! ## Overview
//!
//! 1. **Desired state** - The `higress-https` ConfigMap lists domains and the
//!    Secrets their certificates belong in; a default one is created on first start
//! 2. **Issuance** - Domains are validated with HTTP-01 through a transient
//!    solver Ingress pointing at this process
//! 3. **Persistence** - Account and certificate material lives in sharded
//!    ConfigMaps, so a restart does not re-issue
//! 4. **Publication** - Every obtained certificate is written to its `kubernetes.io/tls` Secret
//!
//! Settings come from environment variables (see [`ControllerConfig`]);
//! the flags below override them.

use anyhow::{Context, Result};
use auto_https_controller::config::ControllerConfig;
use auto_https_controller::observability::{self, LogFormat};
use auto_https_controller::server;
use clap::Parser;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Automatic HTTPS certificate controller
#[derive(Debug, Parser)]
#[command(name = "auto-https-controller", version, long_about = None)]
struct Args {
    /// Namespace holding the config ConfigMap, certificate store and solver Ingresses
    #[arg(long)]
    namespace: Option<String>,

    /// ACME contact email used when no config exists yet
    #[arg(long)]
    email: Option<String>,

    /// Port for metrics, health probes and debug status
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Port for the HTTP-01 challenge listener
    #[arg(long)]
    challenge_port: Option<u16>,
}

impl Args {
    fn apply(self, config: &mut ControllerConfig) {
        if let Some(namespace) = self.namespace {
            config.namespace = namespace;
        }
        if let Some(email) = self.email {
            config.email = email;
        }
        if let Some(port) = self.metrics_port {
            config.metrics_port = port;
        }
        if let Some(port) = self.challenge_port {
            config.challenge_port = port;
        }
    }
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Must run before any rustls connection is opened
    rustls::crypto::ring::default_provider()
        .install_default()
        .unwrap_or_else(|_| panic!("Failed to install rustls crypto provider"));

    let args = Args::parse();
    let mut config = ControllerConfig::from_env();
    args.apply(&mut config);

    let format = config.log_format.parse::<LogFormat>().unwrap_or_else(|e| {
        eprintln!("{e}; falling back to text");
        LogFormat::Text
    });
    observability::init_tracing(format, &config.log_level)?;

    info!("Starting Auto HTTPS Controller");
    info!(
        "Build info: timestamp={}, datetime={}, git_hash={}",
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_DATETIME"),
        env!("BUILD_GIT_HASH")
    );
    info!(
        namespace = %config.namespace,
        metrics_port = config.metrics_port,
        challenge_port = config.challenge_port,
        retry_policy = %config.retry_policy,
        "Controller configuration loaded"
    );

    observability::metrics::register_metrics()?;

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            cancel.cancel();
        });
    }

    server::run(config, client, cancel).await
}
