//! # HTTP Server
//!
//! Operational endpoints:
//! - `/metrics` - Prometheus metrics in text format
//! - `/healthz` - Liveness probe (always returns 200)
//! - `/readyz` - Readiness probe, 503 listing every failing named probe
//! - `/debug/certs` - Authoritative config summary and per-domain engine state
//!
//! The server runs on port 8080 by default (configurable via `METRICS_PORT`).

use crate::acme::ManagedDomain;
use crate::cert::Config;
use crate::certmgr::CertMgr;
use crate::observability::metrics;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Readiness check; `true` means ready
pub type ProbeFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// Readiness check reported under `name`
#[derive(Clone)]
pub struct Probe {
    pub name: String,
    check: ProbeFn,
}

impl std::fmt::Debug for Probe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Probe").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Probe {
    pub fn new(name: &str, check: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        Self {
            name: name.to_string(),
            check: Arc::new(check),
        }
    }

    /// Probe that passes once `flag` is set
    #[must_use]
    pub fn flag(name: &str, flag: Arc<AtomicBool>) -> Self {
        Self::new(name, move || flag.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn check(&self) -> bool {
        (self.check)()
    }
}

#[derive(Debug)]
pub struct ServerState {
    pub probes: Vec<Probe>,
    pub cert_mgr: Arc<CertMgr>,
}

impl ServerState {
    /// Names of failing probes, in registration order
    #[must_use]
    pub fn failing_probes(&self) -> Vec<&str> {
        self.probes
            .iter()
            .filter(|p| !p.check())
            .map(|p| p.name.as_str())
            .collect()
    }
}

/// `/debug/certs` body
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertStatus {
    pub config: Option<ConfigSummary>,
    pub domains: Vec<ManagedDomain>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSummary {
    pub email: String,
    pub automatic_https: bool,
    pub renewal_window_ratio: f64,
    pub version: String,
    pub managed_domains: Vec<String>,
    pub credential_entries: usize,
}

impl From<&Config> for ConfigSummary {
    fn from(config: &Config) -> Self {
        Self {
            email: config.email.clone(),
            automatic_https: config.automatic_https,
            renewal_window_ratio: config.renewal_window_ratio,
            version: config.version.clone(),
            managed_domains: config.managed_domains(),
            credential_entries: config.credential_config.len(),
        }
    }
}

#[must_use]
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/debug/certs", get(debug_certs_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve `router` on `port` until `cancel` fires
pub async fn serve(port: u16, app: Router, cancel: CancellationToken) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;

    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    Ok(())
}

async fn metrics_handler() -> Response {
    match metrics::gather_text() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                format!("Failed to encode metrics: {e}"),
            )
                .into_response()
        }
    }
}

async fn healthz_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz_handler(State(state): State<Arc<ServerState>>) -> Response {
    let failing = state.failing_probes();
    if failing.is_empty() {
        (StatusCode::OK, "ok").into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("not ready: {}", failing.join(", ")),
        )
            .into_response()
    }
}

async fn debug_certs_handler(State(state): State<Arc<ServerState>>) -> Json<CertStatus> {
    let config = state.cert_mgr.config_mgr().get_config();
    Json(CertStatus {
        config: config.as_deref().map(ConfigSummary::from),
        domains: state.cert_mgr.engine().status(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::testing::RecordingEngine;
    use crate::cert::{ConfigMgr, CredentialEntry};
    use crate::k8s::InMemoryObjectApi;
    use crate::secret::SecretMgr;
    use crate::storage::ConfigmapStorage;
    use axum::body::Body;
    use axum::http::Request;
    use k8s_openapi::api::core::v1::{ConfigMap, Secret};
    use tower::ServiceExt;

    const NS: &str = "higress-system";

    fn cert_mgr() -> Arc<CertMgr> {
        CertMgr::new(
            Arc::new(ConfigMgr::new(NS, Arc::new(InMemoryObjectApi::<ConfigMap>::new()))),
            Arc::new(ConfigmapStorage::new(
                NS,
                Arc::new(InMemoryObjectApi::<ConfigMap>::new()),
            )),
            Arc::new(RecordingEngine::default()),
            Arc::new(SecretMgr::new(NS, Arc::new(InMemoryObjectApi::<Secret>::new()))),
        )
    }

    fn state(probes: Vec<Probe>) -> Arc<ServerState> {
        Arc::new(ServerState {
            probes,
            cert_mgr: cert_mgr(),
        })
    }

    async fn body_text(resp: Response) -> String {
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[test]
    fn server_state_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ServerState>();
    }

    #[tokio::test]
    async fn healthz_returns_200() {
        let app = router(state(vec![Probe::new("never", || false)]));
        let req = Request::get("/healthz").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn readyz_lists_failing_probes() {
        let synced = Arc::new(AtomicBool::new(false));
        let app = router(state(vec![
            Probe::new("config-loaded", || true),
            Probe::flag("controller-synced", Arc::clone(&synced)),
        ]));

        let req = Request::get("/readyz").body(Body::empty()).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let text = body_text(resp).await;
        assert!(text.contains("controller-synced"));
        assert!(!text.contains("config-loaded"));

        synced.store(true, Ordering::SeqCst);
        let req = Request::get("/readyz").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_returns_prometheus_text() {
        let _ = metrics::register_metrics();
        metrics::increment_reconciliations();
        let app = router(state(Vec::new()));
        let req = Request::get("/metrics").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_text(resp)
            .await
            .contains("auto_https_reconciliations_total"));
    }

    #[tokio::test]
    async fn debug_certs_without_config() {
        let app = router(state(Vec::new()));
        let req = Request::get("/debug/certs").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert!(json["config"].is_null());
        assert_eq!(json["domains"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn debug_certs_summarizes_config() {
        let state = state(Vec::new());
        state.cert_mgr.config_mgr().set_config(Arc::new(Config {
            email: "ops@example.com".to_string(),
            domains: vec!["legacy.example.com".to_string()],
            credential_config: vec![CredentialEntry {
                domains: vec!["a.example.com".to_string()],
                tls_issuer: "letsencrypt".to_string(),
                tls_secret: "a-tls".to_string(),
                cacert_secret: String::new(),
            }],
            ..Config::default()
        }));

        let app = router(state);
        let req = Request::get("/debug/certs").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(json["config"]["email"], "ops@example.com");
        assert_eq!(json["config"]["automaticHttps"], true);
        assert_eq!(json["config"]["credentialEntries"], 1);
        assert_eq!(
            json["config"]["managedDomains"],
            serde_json::json!(["legacy.example.com", "a.example.com"])
        );
    }
}
