//! # Storage
//!
//! Hierarchical key/value storage used by the ACME engine for account and
//! certificate material.
//!
//! Keys are path-like strings (`/certificates/<issuer>/<domain>.crt`). The
//! [`Storage`] trait mirrors a small filesystem: values can be stored, loaded
//! and deleted, prefixes can be listed with or without recursion, and
//! [`Storage::stat`] tells files (terminal nodes) from directories.
//!
//! [`ConfigmapStorage`] is the only implementation. See [`keys`] for the
//! sharding and encoding rules.

mod configmap;
pub mod keys;

pub use configmap::ConfigmapStorage;

use crate::k8s::ClusterError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors from storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// The key (or, for `stat`, the key and every descendant) does not exist
    #[error("key {0} does not exist")]
    NotFound(String),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("malformed entry in {shard}: {source}")]
    Envelope {
        shard: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode entry: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("value of {key} is not valid base64: {source}")]
    Decode {
        key: String,
        #[source]
        source: base64::DecodeError,
    },

    #[error("ConfigMap {shard} would grow to {size} bytes, over the {limit} byte limit")]
    ShardFull {
        shard: String,
        size: usize,
        limit: usize,
    },
}

impl StorageError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result of [`Storage::stat`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    pub key: String,
    /// Time of the stat call; shards do not track modification times
    pub modified: DateTime<Utc>,
    /// Value size in bytes, zero for directories
    pub size: u64,
    /// `true` for a stored key, `false` for a prefix of stored keys
    pub is_terminal: bool,
}

/// Key/value contract consumed by the ACME engine
#[async_trait]
pub trait Storage: Send + Sync {
    /// Whether `key` is stored; backend failures read as `false`
    async fn exists(&self, key: &str) -> bool;

    async fn store(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Fails with [`StorageError::NotFound`] when absent
    async fn load(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Delete `key`, or every key below it when it names a directory.
    /// Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Keys under `prefix`; non-recursive listings stop at the next segment
    async fn list(&self, prefix: &str, recursive: bool) -> Result<Vec<String>, StorageError>;

    async fn stat(&self, key: &str) -> Result<KeyInfo, StorageError>;

    /// Process-local only; never blocks
    async fn lock(&self, name: &str) -> Result<(), StorageError>;

    async fn unlock(&self, name: &str) -> Result<(), StorageError>;
}
