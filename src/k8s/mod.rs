//! # Kubernetes Object Access
//!
//! Every cluster side effect in this crate (storage shards, the desired-state
//! ConfigMap, TLS Secrets, solver Ingresses) goes through [`ObjectApi`], a small
//! capability trait over namespaced objects of one kind.
//!
//! - [`KubeObjectApi`] talks to the API server through a `kube::Client`
//! - [`InMemoryObjectApi`] keeps objects in a map and backs the unit tests
//!
//! Not-found and already-exists are surfaced as dedicated [`ClusterError`]
//! variants so callers can tell "absent" from "backend unavailable".

mod kube_api;
mod memory;

pub use kube_api::KubeObjectApi;
pub use memory::InMemoryObjectApi;

use async_trait::async_trait;
use thiserror::Error;

/// Errors from cluster object operations
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("{kind} {namespace}/{name} was modified concurrently")]
    Conflict {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("object has no metadata.name")]
    MissingName,

    #[error("cluster unavailable: {0}")]
    Unavailable(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

impl ClusterError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

/// Namespaced CRUD over one Kubernetes object kind
#[async_trait]
pub trait ObjectApi<K>: Send + Sync
where
    K: Clone + Send + Sync + 'static,
{
    /// Fetch an object, `Ok(None)` when it does not exist
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, ClusterError>;

    /// Create an object, failing with [`ClusterError::AlreadyExists`] if present
    async fn create(&self, namespace: &str, obj: &K) -> Result<K, ClusterError>;

    /// Replace an existing object, failing with [`ClusterError::NotFound`] if absent
    async fn replace(&self, namespace: &str, name: &str, obj: &K) -> Result<K, ClusterError>;

    /// Delete an object, failing with [`ClusterError::NotFound`] if absent
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    /// List objects matching an equality-based label selector (`k=v,k2=v2`)
    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>, ClusterError>;
}
