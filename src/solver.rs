//! # HTTP-01 Ingress Solver
//!
//! Presents a challenge by creating an Ingress that routes
//! `/.well-known/acme-challenge/<token>` on the challenged host to the
//! in-cluster challenge listener.
//!
//! One Ingress per domain, named `higress-http-solver-<domain with dashes>`.
//! Presenting again for the same domain replaces the route with the newest
//! token.

use crate::acme::{Challenge, ChallengeSolver, SolverError};
use crate::config::ControllerConfig;
use crate::constants::SOLVER_INGRESS_PREFIX;
use crate::k8s::{ClusterError, ObjectApi};
use async_trait::async_trait;
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Label marking Ingresses owned by the solver
pub const SOLVER_LABEL: &str = "higress.io/acme-http-solver";

/// Where solver Ingresses send challenge traffic
#[derive(Debug, Clone)]
pub struct SolverOptions {
    pub service_name: String,
    pub service_port: i32,
    pub ingress_class: String,
    pub settle_delay: Duration,
}

impl From<&ControllerConfig> for SolverOptions {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            service_name: config.challenge_service_name.clone(),
            service_port: config.challenge_service_port,
            ingress_class: config.ingress_class.clone(),
            settle_delay: config.solver_settle_delay(),
        }
    }
}

/// Deterministic Ingress name for a domain
#[must_use]
pub fn solver_ingress_name(domain: &str) -> String {
    let sanitized = domain
        .to_ascii_lowercase()
        .replace('.', "-")
        .replace('*', "wildcard");
    format!("{SOLVER_INGRESS_PREFIX}{sanitized}")
}

pub struct IngressSolver {
    namespace: String,
    ingresses: Arc<dyn ObjectApi<Ingress>>,
    options: SolverOptions,
    /// Serializes Ingress mutations across concurrently validated domains
    mutations: Mutex<()>,
}

impl std::fmt::Debug for IngressSolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngressSolver")
            .field("namespace", &self.namespace)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl IngressSolver {
    #[must_use]
    pub fn new(
        namespace: &str,
        ingresses: Arc<dyn ObjectApi<Ingress>>,
        options: SolverOptions,
    ) -> Self {
        Self {
            namespace: namespace.to_string(),
            ingresses,
            options,
            mutations: Mutex::new(()),
        }
    }

    fn build_ingress(&self, challenge: &Challenge) -> Ingress {
        let backend = IngressBackend {
            service: Some(IngressServiceBackend {
                name: self.options.service_name.clone(),
                port: Some(ServiceBackendPort {
                    number: Some(self.options.service_port),
                    ..Default::default()
                }),
            }),
            ..Default::default()
        };

        Ingress {
            metadata: ObjectMeta {
                name: Some(solver_ingress_name(&challenge.domain)),
                namespace: Some(self.namespace.clone()),
                labels: Some(BTreeMap::from([(
                    SOLVER_LABEL.to_string(),
                    "true".to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                ingress_class_name: Some(self.options.ingress_class.clone()),
                rules: Some(vec![IngressRule {
                    host: Some(challenge.domain.clone()),
                    http: Some(HTTPIngressRuleValue {
                        paths: vec![HTTPIngressPath {
                            path: Some(challenge.http01_resource_path()),
                            path_type: "Exact".to_string(),
                            backend,
                        }],
                    }),
                }]),
                ..Default::default()
            }),
            status: None,
        }
    }

    /// Remove the solver Ingress of `domain`; absent Ingresses are fine
    pub async fn delete(&self, domain: &str) -> Result<(), SolverError> {
        let _guard = self.mutations.lock().await;
        let name = solver_ingress_name(domain);
        match self.ingresses.delete(&self.namespace, &name).await {
            Ok(()) => {
                info!(domain = %domain, ingress = %name, "Removed solver Ingress");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(domain = %domain, ingress = %name, "Solver Ingress already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ChallengeSolver for IngressSolver {
    async fn present(&self, challenge: &Challenge) -> Result<(), SolverError> {
        let _guard = self.mutations.lock().await;
        let mut desired = self.build_ingress(challenge);
        let name = solver_ingress_name(&challenge.domain);

        match self.ingresses.get(&self.namespace, &name).await? {
            None => match self.ingresses.create(&self.namespace, &desired).await {
                Ok(_) => {}
                // Lost a race with another writer; fall through to replace
                Err(ClusterError::AlreadyExists { .. }) => {
                    self.ingresses
                        .replace(&self.namespace, &name, &desired)
                        .await?;
                }
                Err(e) => return Err(e.into()),
            },
            Some(existing) => {
                desired.metadata.resource_version = existing.metadata.resource_version;
                self.ingresses
                    .replace(&self.namespace, &name, &desired)
                    .await?;
            }
        }

        info!(
            domain = %challenge.domain,
            ingress = %name,
            path = %challenge.http01_resource_path(),
            "Presented HTTP-01 challenge"
        );
        Ok(())
    }

    async fn wait(
        &self,
        cancel: &CancellationToken,
        challenge: &Challenge,
    ) -> Result<(), SolverError> {
        tokio::select! {
            () = cancel.cancelled() => Err(SolverError::Cancelled(challenge.domain.clone())),
            () = tokio::time::sleep(self.options.settle_delay) => Ok(()),
        }
    }

    async fn cleanup(&self, challenge: &Challenge) -> Result<(), SolverError> {
        self.delete(&challenge.domain).await
    }
}
