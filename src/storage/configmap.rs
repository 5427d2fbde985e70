use super::keys::{
    collapse_to_children, data_size, fast_hash, is_certificate_scope, shard_name_for_key, Envelope,
};
use super::{KeyInfo, Storage, StorageError};
use crate::constants::{
    CERT_STORE_CERTIFICATES_PREFIX, CERT_STORE_TYPE_CERTIFICATES, CERT_STORE_TYPE_DEFAULT,
    CERT_STORE_TYPE_LABEL, CONFIGMAP_MAX_DATA_BYTES,
};
use crate::k8s::ObjectApi;
use crate::observability::metrics;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// [`Storage`] backed by ConfigMaps in one namespace
///
/// Each ConfigMap ("shard") maps `fast_hash(key)` to an [`Envelope`]. Keys
/// under `/certificates` are spread over per-domain shards labelled
/// `higress.io/cert-store-type=certificates`; everything else, ACME account
/// material included, shares `higress-cert-store-default` and is therefore
/// bounded by a single ConfigMap's 1 MiB.
///
/// All operations are serialized by a process-local read/write lock.
/// [`Storage::lock`] does not coordinate across processes, so only one
/// controller replica may use a namespace at a time.
pub struct ConfigmapStorage {
    namespace: String,
    configmaps: Arc<dyn ObjectApi<ConfigMap>>,
    guard: RwLock<()>,
}

impl std::fmt::Debug for ConfigmapStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigmapStorage")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

/// Decoded envelopes of one shard, keyed by hashed data key
struct Shard {
    name: String,
    entries: Vec<(String, Envelope)>,
}

impl ConfigmapStorage {
    #[must_use]
    pub fn new(namespace: &str, configmaps: Arc<dyn ObjectApi<ConfigMap>>) -> Self {
        Self {
            namespace: namespace.to_string(),
            configmaps,
            guard: RwLock::new(()),
        }
    }

    async fn get_shard(&self, name: &str) -> Result<Option<ConfigMap>, StorageError> {
        Ok(self.configmaps.get(&self.namespace, name).await?)
    }

    /// Shards a lookup of `key` has to scan
    ///
    /// Every certificate shard for keys under `/certificates`, otherwise the
    /// single owning shard. Missing shards are skipped, never created.
    async fn scope(&self, key: &str) -> Result<Vec<ConfigMap>, StorageError> {
        if is_certificate_scope(key) {
            let selector = format!("{CERT_STORE_TYPE_LABEL}={CERT_STORE_TYPE_CERTIFICATES}");
            Ok(self.configmaps.list(&self.namespace, &selector).await?)
        } else {
            Ok(self
                .get_shard(&shard_name_for_key(key))
                .await?
                .into_iter()
                .collect())
        }
    }

    fn decode_shard(configmap: &ConfigMap) -> Result<Shard, StorageError> {
        let name = configmap.metadata.name.clone().unwrap_or_default();
        let entries = configmap
            .data
            .iter()
            .flatten()
            .map(|(hashed, raw)| Ok((hashed.clone(), Envelope::decode(&name, raw)?)))
            .collect::<Result<Vec<_>, StorageError>>()?;
        Ok(Shard { name, entries })
    }

    /// Stored envelope for exactly `key`
    async fn find_exact(&self, key: &str) -> Result<Option<Envelope>, StorageError> {
        let shard_name = shard_name_for_key(key);
        let Some(configmap) = self.get_shard(&shard_name).await? else {
            return Ok(None);
        };
        let hashed = fast_hash(key.as_bytes());
        configmap
            .data
            .as_ref()
            .and_then(|data| data.get(&hashed))
            .map(|raw| Envelope::decode(&shard_name, raw))
            .transpose()
    }

    /// Every stored key starting with `prefix`, sorted
    ///
    /// Matching is on the raw string, not on path segments:
    /// `/certificates/i1` also matches `/certificates/i10/x.crt`. Directory
    /// deletes do not go through here and stop at `<key>/`.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        for configmap in self.scope(prefix).await? {
            let shard = Self::decode_shard(&configmap)?;
            keys.extend(
                shard
                    .entries
                    .into_iter()
                    .map(|(_, envelope)| envelope.k)
                    .filter(|k| k.starts_with(prefix)),
            );
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    /// Write `data` back to shard `name`, creating the ConfigMap if needed
    async fn write_shard(
        &self,
        name: &str,
        existing: Option<ConfigMap>,
        data: BTreeMap<String, String>,
    ) -> Result<(), StorageError> {
        let size = data_size(&data);
        if size > CONFIGMAP_MAX_DATA_BYTES {
            return Err(StorageError::ShardFull {
                shard: name.to_string(),
                size,
                limit: CONFIGMAP_MAX_DATA_BYTES,
            });
        }

        let store_type = if name.starts_with(CERT_STORE_CERTIFICATES_PREFIX) {
            CERT_STORE_TYPE_CERTIFICATES
        } else {
            CERT_STORE_TYPE_DEFAULT
        };

        match existing {
            Some(mut configmap) => {
                configmap
                    .metadata
                    .labels
                    .get_or_insert_with(BTreeMap::new)
                    .insert(CERT_STORE_TYPE_LABEL.to_string(), store_type.to_string());
                configmap.data = Some(data);
                self.configmaps
                    .replace(&self.namespace, name, &configmap)
                    .await?;
            }
            None => {
                let configmap = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        namespace: Some(self.namespace.clone()),
                        labels: Some(BTreeMap::from([(
                            CERT_STORE_TYPE_LABEL.to_string(),
                            store_type.to_string(),
                        )])),
                        ..Default::default()
                    },
                    data: Some(data),
                    ..Default::default()
                };
                self.configmaps.create(&self.namespace, &configmap).await?;
                debug!("Created storage shard {}/{}", self.namespace, name);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for ConfigmapStorage {
    async fn exists(&self, key: &str) -> bool {
        let _read = self.guard.read().await;
        metrics::increment_storage_operations("exists");
        match self.find_exact(key).await {
            Ok(found) => found.is_some(),
            Err(e) => {
                debug!(key = %key, "Treating unreadable key as absent: {}", e);
                false
            }
        }
    }

    async fn store(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let _write = self.guard.write().await;
        metrics::increment_storage_operations("store");
        let shard_name = shard_name_for_key(key);
        let encoded = Envelope::new(key, value).encode()?;

        let existing = self.get_shard(&shard_name).await?;
        let mut data = existing
            .as_ref()
            .and_then(|configmap| configmap.data.clone())
            .unwrap_or_default();
        data.insert(fast_hash(key.as_bytes()), encoded);

        self.write_shard(&shard_name, existing, data).await?;
        debug!(key = %key, shard = %shard_name, bytes = value.len(), "Stored key");
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let _read = self.guard.read().await;
        metrics::increment_storage_operations("load");
        match self.find_exact(key).await? {
            Some(envelope) => envelope.value(),
            None => Err(StorageError::NotFound(key.to_string())),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let _write = self.guard.write().await;
        metrics::increment_storage_operations("delete");

        let shard_name = shard_name_for_key(key);
        let hashed = fast_hash(key.as_bytes());
        if let Some(configmap) = self.get_shard(&shard_name).await? {
            if let Some(data) = configmap.data.as_ref().filter(|d| d.contains_key(&hashed)) {
                let mut data = data.clone();
                data.remove(&hashed);
                self.write_shard(&shard_name, Some(configmap), data).await?;
                debug!(key = %key, shard = %shard_name, "Deleted key");
                return Ok(());
            }
        }

        // Not a stored key: treat it as a directory and drop its descendants
        let dir = if key.ends_with('/') {
            key.to_string()
        } else {
            format!("{key}/")
        };
        for configmap in self.scope(key).await? {
            let shard = Self::decode_shard(&configmap)?;
            let doomed: Vec<String> = shard
                .entries
                .iter()
                .filter(|(_, envelope)| envelope.k.starts_with(&dir))
                .map(|(hashed, _)| hashed.clone())
                .collect();
            if doomed.is_empty() {
                continue;
            }
            let mut data = configmap.data.clone().unwrap_or_default();
            for hashed in &doomed {
                data.remove(hashed);
            }
            self.write_shard(&shard.name, Some(configmap), data).await?;
            debug!(prefix = %dir, shard = %shard.name, count = doomed.len(), "Deleted keys");
        }
        Ok(())
    }

    async fn list(&self, prefix: &str, recursive: bool) -> Result<Vec<String>, StorageError> {
        let _read = self.guard.read().await;
        metrics::increment_storage_operations("list");

        if self.find_exact(prefix).await?.is_some() {
            return Ok(vec![prefix.to_string()]);
        }
        let keys = self.keys_with_prefix(prefix).await?;
        if recursive {
            Ok(keys)
        } else {
            Ok(collapse_to_children(prefix, &keys))
        }
    }

    async fn stat(&self, key: &str) -> Result<KeyInfo, StorageError> {
        let _read = self.guard.read().await;
        metrics::increment_storage_operations("stat");

        if let Some(envelope) = self.find_exact(key).await? {
            return Ok(KeyInfo {
                key: key.to_string(),
                modified: chrono::Utc::now(),
                size: envelope.value_len(),
                is_terminal: true,
            });
        }
        if self.keys_with_prefix(key).await?.is_empty() {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(KeyInfo {
            key: key.to_string(),
            modified: chrono::Utc::now(),
            size: 0,
            is_terminal: false,
        })
    }

    async fn lock(&self, _name: &str) -> Result<(), StorageError> {
        Ok(())
    }

    async fn unlock(&self, _name: &str) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::{ClusterError, InMemoryObjectApi};

    const NS: &str = "higress-system";

    fn storage() -> (Arc<InMemoryObjectApi<ConfigMap>>, ConfigmapStorage) {
        let api = Arc::new(InMemoryObjectApi::<ConfigMap>::new());
        let storage = ConfigmapStorage::new(NS, api.clone());
        (api, storage)
    }

    async fn seed(storage: &ConfigmapStorage, keys: &[&str]) {
        for key in keys {
            storage.store(key, key.as_bytes()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_store_load_exists_delete() {
        let (_, storage) = storage();
        let key = "/certificates/issuer1/domain1.crt";
        assert!(!storage.exists(key).await);

        storage.store(key, b"test-data1").await.unwrap();
        assert!(storage.exists(key).await);
        assert_eq!(storage.load(key).await.unwrap(), b"test-data1");

        storage.store(key, b"renewed").await.unwrap();
        assert_eq!(storage.load(key).await.unwrap(), b"renewed");

        storage.delete(key).await.unwrap();
        assert!(!storage.exists(key).await);
        assert!(storage.load(key).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_store_writes_envelope_into_sharded_configmap() {
        let (api, storage) = storage();
        storage
            .store("/certificates/issuer1/domain1.crt", b"test-data1")
            .await
            .unwrap();

        let shard = api
            .object(NS, "higress-cert-store-certificates-befe5d80")
            .unwrap();
        assert_eq!(
            shard.data.unwrap(),
            BTreeMap::from([(
                "1dd48f72".to_string(),
                r#"{"k":"/certificates/issuer1/domain1.crt","v":"dGVzdC1kYXRhMQ=="}"#.to_string()
            )])
        );
        assert_eq!(
            shard.metadata.labels.unwrap().get(CERT_STORE_TYPE_LABEL),
            Some(&"certificates".to_string())
        );
    }

    #[tokio::test]
    async fn test_non_certificate_keys_share_default_store() {
        let (api, storage) = storage();
        seed(&storage, &["/acme/a/users/x/account.json", "/other-prefix/key1/file1"]).await;
        let shards = api.objects(NS);
        assert_eq!(shards.len(), 1);
        assert_eq!(
            shards[0].metadata.name.as_deref(),
            Some("higress-cert-store-default")
        );
        assert_eq!(shards[0].data.as_ref().map(BTreeMap::len), Some(2));
    }

    #[tokio::test]
    async fn test_list_certificates() {
        let (_, storage) = storage();
        seed(
            &storage,
            &[
                "/certificates/i1/a.crt",
                "/certificates/i1/b.crt",
                "/certificates/i2/c.crt",
            ],
        )
        .await;

        let mut dirs = storage.list("/certificates", false).await.unwrap();
        dirs.sort();
        assert_eq!(dirs, vec!["/certificates/i1", "/certificates/i2"]);

        let mut all = storage.list("/certificates", true).await.unwrap();
        all.sort();
        assert_eq!(
            all,
            vec![
                "/certificates/i1/a.crt",
                "/certificates/i1/b.crt",
                "/certificates/i2/c.crt"
            ]
        );
    }

    #[tokio::test]
    async fn test_list_default_store() {
        let (_, storage) = storage();
        seed(
            &storage,
            &[
                "/other-prefix/key1/file1",
                "/other-prefix/key1/file2",
                "/other-prefix/key2/file1",
            ],
        )
        .await;

        assert_eq!(
            storage.list("/other-prefix", false).await.unwrap(),
            vec!["/other-prefix/key1", "/other-prefix/key2"]
        );
        assert_eq!(
            storage.list("/other-prefix/key1", false).await.unwrap(),
            vec!["/other-prefix/key1/file1", "/other-prefix/key1/file2"]
        );
        assert_eq!(
            storage.list("/other-prefix/key1/file1", false).await.unwrap(),
            vec!["/other-prefix/key1/file1"]
        );
        assert!(storage.list("/nothing", true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stat() {
        let (_, storage) = storage();
        seed(&storage, &["/certificates/i1/a.crt", "/acme/dir/users/x/account.json"]).await;

        let file = storage.stat("/certificates/i1/a.crt").await.unwrap();
        assert!(file.is_terminal);
        assert_eq!(file.size, "/certificates/i1/a.crt".len() as u64);

        let dir = storage.stat("/certificates/i1").await.unwrap();
        assert!(!dir.is_terminal);
        assert!(!storage.stat("/acme/dir").await.unwrap().is_terminal);

        assert!(storage.stat("/certificates/i9").await.unwrap_err().is_not_found());
        assert!(storage.stat("/unknown").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_reads_never_create_shards() {
        let (api, storage) = storage();
        assert!(!storage.exists("/acme/x").await);
        assert!(storage.load("/certificates/i/a.crt").await.is_err());
        assert!(storage.list("/acme", true).await.unwrap().is_empty());
        assert!(storage.stat("/acme").await.is_err());
        assert_eq!(api.writes(), 0);
        assert!(api.objects(NS).is_empty());
    }

    #[tokio::test]
    async fn test_delete_directory_removes_descendants() {
        let (_, storage) = storage();
        seed(
            &storage,
            &[
                "/certificates/i1/a.crt",
                "/certificates/i1/a.key",
                "/certificates/i2/c.crt",
            ],
        )
        .await;
        storage.delete("/certificates/i1").await.unwrap();
        assert_eq!(
            storage.list("/certificates", true).await.unwrap(),
            vec!["/certificates/i2/c.crt"]
        );
        // Missing keys delete cleanly
        storage.delete("/certificates/i1/a.crt").await.unwrap();
    }

    #[tokio::test]
    async fn test_not_found_is_distinct_from_backend_errors() {
        let (api, storage) = storage();
        api.set_unavailable(true);
        assert!(matches!(
            storage.load("/acme/x").await,
            Err(StorageError::Cluster(ClusterError::Unavailable(_)))
        ));
        assert!(!storage.exists("/acme/x").await);
    }

    #[tokio::test]
    async fn test_shard_size_guard() {
        let (api, storage) = storage();
        let big = vec![b'x'; CONFIGMAP_MAX_DATA_BYTES];
        let err = storage.store("/acme/big", &big).await.unwrap_err();
        assert!(matches!(err, StorageError::ShardFull { .. }));
        assert_eq!(api.writes(), 0);
    }

    #[tokio::test]
    async fn test_lock_is_a_no_op() {
        let (_, storage) = storage();
        storage.lock("issue_cert_a.test").await.unwrap();
        storage.lock("issue_cert_a.test").await.unwrap();
        storage.unlock("issue_cert_a.test").await.unwrap();
    }
}
