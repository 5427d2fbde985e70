use super::{ClusterError, ObjectApi};
use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::marker::PhantomData;

/// [`ObjectApi`] backed by the Kubernetes API server
pub struct KubeObjectApi<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeObjectApi<K> {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

impl<K> Debug for KubeObjectApi<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeObjectApi")
            .field("kind", &std::any::type_name::<K>())
            .finish_non_exhaustive()
    }
}

impl<K> KubeObjectApi<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn kind_of<K: k8s_openapi::Resource>() -> &'static str {
    K::KIND
}

#[async_trait]
impl<K> ObjectApi<K> for KubeObjectApi<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + k8s_openapi::Resource
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, ClusterError> {
        Ok(self.api(namespace).get_opt(name).await?)
    }

    async fn create(&self, namespace: &str, obj: &K) -> Result<K, ClusterError> {
        match self.api(namespace).create(&PostParams::default(), obj).await {
            Ok(created) => Ok(created),
            Err(kube::Error::Api(api_err)) if api_err.code == 409 => {
                Err(ClusterError::AlreadyExists {
                    kind: kind_of::<K>(),
                    namespace: namespace.to_string(),
                    name: obj.meta().name.clone().unwrap_or_default(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn replace(&self, namespace: &str, name: &str, obj: &K) -> Result<K, ClusterError> {
        match self
            .api(namespace)
            .replace(name, &PostParams::default(), obj)
            .await
        {
            Ok(replaced) => Ok(replaced),
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => Err(ClusterError::NotFound {
                kind: kind_of::<K>(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
            Err(kube::Error::Api(api_err)) if api_err.code == 409 => Err(ClusterError::Conflict {
                kind: kind_of::<K>(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        match self
            .api(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => Err(ClusterError::NotFound {
                kind: kind_of::<K>(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>, ClusterError> {
        let params = if label_selector.is_empty() {
            ListParams::default()
        } else {
            ListParams::default().labels(label_selector)
        };
        Ok(self.api(namespace).list(&params).await?.items)
    }
}
