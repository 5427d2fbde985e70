use super::{ClusterError, ObjectApi};
use async_trait::async_trait;
use kube::Resource;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// [`ObjectApi`] over an in-process map
///
/// Mirrors the API server semantics this crate relies on: `create` refuses
/// existing names, `replace`/`delete` refuse missing ones, every write bumps
/// `metadata.resourceVersion`, and `list` understands equality selectors.
/// [`Self::set_unavailable`] makes every call fail like a dropped connection.
#[derive(Debug)]
pub struct InMemoryObjectApi<K> {
    objects: Mutex<BTreeMap<(String, String), K>>,
    revision: AtomicU64,
    writes: AtomicU64,
    unavailable: AtomicBool,
}

impl<K> Default for InMemoryObjectApi<K> {
    fn default() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            revision: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            unavailable: AtomicBool::new(false),
        }
    }
}

impl<K> InMemoryObjectApi<K>
where
    K: Resource + k8s_openapi::Resource + Clone,
{
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object without counting it as a write
    pub fn insert(&self, namespace: &str, obj: K) {
        let name = obj.meta().name.clone().unwrap_or_default();
        self.lock().insert((namespace.to_string(), name), obj);
    }

    /// Snapshot of one object
    pub fn object(&self, namespace: &str, name: &str) -> Option<K> {
        self.lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Every object in a namespace, ordered by name
    pub fn objects(&self, namespace: &str) -> Vec<K> {
        self.lock()
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, obj)| obj.clone())
            .collect()
    }

    /// Number of successful create/replace/delete calls
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<(String, String), K>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), ClusterError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ClusterError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }

    fn stamp(&self, obj: &K) -> K {
        let mut stored = obj.clone();
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        stored.meta_mut().resource_version = Some(revision.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        stored
    }

    fn not_found(namespace: &str, name: &str) -> ClusterError {
        ClusterError::NotFound {
            kind: <K as k8s_openapi::Resource>::KIND,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

/// Equality-based selector match: `a=b,c=d`, or a bare `a` for existence
fn matches_selector(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => {
                labels.and_then(|l| l.get(key.trim())).map(String::as_str) == Some(value.trim())
            }
            None => labels.is_some_and(|l| l.contains_key(term)),
        })
}

#[async_trait]
impl<K> ObjectApi<K> for InMemoryObjectApi<K>
where
    K: Resource + k8s_openapi::Resource + Clone + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, ClusterError> {
        self.check_available()?;
        Ok(self.object(namespace, name))
    }

    async fn create(&self, namespace: &str, obj: &K) -> Result<K, ClusterError> {
        self.check_available()?;
        let name = obj.meta().name.clone().ok_or(ClusterError::MissingName)?;
        let key = (namespace.to_string(), name.clone());
        let mut objects = self.lock();
        if objects.contains_key(&key) {
            return Err(ClusterError::AlreadyExists {
                kind: <K as k8s_openapi::Resource>::KIND,
                namespace: namespace.to_string(),
                name,
            });
        }
        let mut stored = self.stamp(obj);
        stored.meta_mut().namespace = Some(namespace.to_string());
        objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn replace(&self, namespace: &str, name: &str, obj: &K) -> Result<K, ClusterError> {
        self.check_available()?;
        let key = (namespace.to_string(), name.to_string());
        let mut objects = self.lock();
        let Some(existing) = objects.get(&key) else {
            return Err(Self::not_found(namespace, name));
        };
        let expected = obj.meta().resource_version.as_ref();
        if expected.is_some() && expected != existing.meta().resource_version.as_ref() {
            return Err(ClusterError::Conflict {
                kind: <K as k8s_openapi::Resource>::KIND,
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }
        let mut stored = self.stamp(obj);
        stored.meta_mut().namespace = Some(namespace.to_string());
        objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.check_available()?;
        let key = (namespace.to_string(), name.to_string());
        if self.lock().remove(&key).is_none() {
            return Err(Self::not_found(namespace, name));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>, ClusterError> {
        self.check_available()?;
        Ok(self
            .objects(namespace)
            .into_iter()
            .filter(|obj| matches_selector(obj.meta().labels.as_ref(), label_selector))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    fn configmap(name: &str, labels: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_get_replace_delete() {
        let api = InMemoryObjectApi::<ConfigMap>::new();
        let created = api.create("ns", &configmap("a", &[])).await.unwrap();
        assert_eq!(created.metadata.resource_version.as_deref(), Some("1"));

        let err = api.create("ns", &configmap("a", &[])).await.unwrap_err();
        assert!(err.is_already_exists());

        let replaced = api.replace("ns", "a", &created).await.unwrap();
        assert_eq!(replaced.metadata.resource_version.as_deref(), Some("2"));

        // Stale resource version is rejected
        let err = api.replace("ns", "a", &created).await.unwrap_err();
        assert!(matches!(err, ClusterError::Conflict { .. }));

        api.delete("ns", "a").await.unwrap();
        assert!(api.get("ns", "a").await.unwrap().is_none());
        assert!(api.delete("ns", "a").await.unwrap_err().is_not_found());
        assert_eq!(api.writes(), 3);
    }

    #[tokio::test]
    async fn test_list_filters_by_namespace_and_labels() {
        let api = InMemoryObjectApi::<ConfigMap>::new();
        api.insert("ns", configmap("a", &[("type", "certificates")]));
        api.insert("ns", configmap("b", &[("type", "default")]));
        api.insert("other", configmap("c", &[("type", "certificates")]));

        let found = api.list("ns", "type=certificates").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].metadata.name.as_deref(), Some("a"));
        assert_eq!(api.list("ns", "").await.unwrap().len(), 2);
        assert_eq!(api.list("ns", "type").await.unwrap().len(), 2);
        assert!(api.list("ns", "missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_fails_every_call() {
        let api = InMemoryObjectApi::<ConfigMap>::new();
        api.set_unavailable(true);
        assert!(matches!(
            api.get("ns", "a").await,
            Err(ClusterError::Unavailable(_))
        ));
        assert!(matches!(
            api.list("ns", "").await,
            Err(ClusterError::Unavailable(_))
        ));
    }
}
