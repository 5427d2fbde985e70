//! # Config Manager
//!
//! Owns the authoritative [`Config`] and its backing ConfigMap.
//!
//! The in-memory copy is an immutable snapshot behind an [`ArcSwapOption`]:
//! readers (HTTP status, the controller) never block the reconciliation path,
//! which is the only writer.

use super::config::{Config, ConfigError};
use crate::constants::{CONFIGMAP_DATA_KEY, CONFIGMAP_NAME};
use crate::k8s::{ClusterError, ObjectApi};
use arc_swap::ArcSwapOption;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

pub struct ConfigMgr {
    namespace: String,
    configmaps: Arc<dyn ObjectApi<ConfigMap>>,
    current: ArcSwapOption<Config>,
}

impl std::fmt::Debug for ConfigMgr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigMgr")
            .field("namespace", &self.namespace)
            .field("loaded", &self.current.load().is_some())
            .finish_non_exhaustive()
    }
}

impl ConfigMgr {
    #[must_use]
    pub fn new(namespace: &str, configmaps: Arc<dyn ObjectApi<ConfigMap>>) -> Self {
        Self {
            namespace: namespace.to_string(),
            configmaps,
            current: ArcSwapOption::empty(),
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Current authoritative config, if one has been published
    #[must_use]
    pub fn get_config(&self) -> Option<Arc<Config>> {
        self.current.load_full()
    }

    /// Publish a new authoritative config
    pub fn set_config(&self, config: Arc<Config>) {
        self.current.store(Some(config));
    }

    /// Load the persisted config, creating a default one on first start
    ///
    /// A blank `seed_email` gets a random placeholder. An existing but invalid
    /// document is an error; it is never replaced with defaults.
    pub async fn init_config(&self, seed_email: &str) -> Result<Config, ConfigError> {
        match self.get_configmap().await? {
            Some(configmap) => {
                let config = Self::parse_config_from_configmap(&configmap)?;
                info!(
                    "Loaded certificate config from ConfigMap {}/{}",
                    self.namespace, CONFIGMAP_NAME
                );
                Ok(config)
            }
            None => {
                let config = Config::new_default(seed_email);
                self.apply_configmap(&config).await?;
                info!(
                    email = %config.email,
                    "Created default certificate config in ConfigMap {}/{}",
                    self.namespace, CONFIGMAP_NAME
                );
                Ok(config)
            }
        }
    }

    /// Parse and validate the document held by `configmap`
    pub fn parse_config_from_configmap(configmap: &ConfigMap) -> Result<Config, ConfigError> {
        let data = configmap
            .data
            .as_ref()
            .and_then(|d| d.get(CONFIGMAP_DATA_KEY))
            .ok_or_else(|| ConfigError::MissingDataKey {
                key: CONFIGMAP_DATA_KEY.to_string(),
                configmap: configmap.metadata.name.clone().unwrap_or_default(),
            })?;
        Config::from_yaml(data)
    }

    /// Fetch the ConfigMap and parse it in one call
    pub async fn get_config_from_configmap(&self) -> Result<Config, ConfigError> {
        let configmap = self
            .get_configmap()
            .await?
            .ok_or_else(|| ClusterError::NotFound {
                kind: "ConfigMap",
                namespace: self.namespace.clone(),
                name: CONFIGMAP_NAME.to_string(),
            })?;
        Self::parse_config_from_configmap(&configmap)
    }

    pub async fn get_configmap(&self) -> Result<Option<ConfigMap>, ConfigError> {
        Ok(self.configmaps.get(&self.namespace, CONFIGMAP_NAME).await?)
    }

    /// Create or replace the backing ConfigMap with `config`
    pub async fn apply_configmap(&self, config: &Config) -> Result<(), ConfigError> {
        let yaml = config.to_yaml()?;
        let existing = self.configmaps.get(&self.namespace, CONFIGMAP_NAME).await?;

        match existing {
            Some(mut configmap) => {
                configmap
                    .data
                    .get_or_insert_with(BTreeMap::new)
                    .insert(CONFIGMAP_DATA_KEY.to_string(), yaml);
                self.configmaps
                    .replace(&self.namespace, CONFIGMAP_NAME, &configmap)
                    .await?;
                debug!("Updated ConfigMap {}/{}", self.namespace, CONFIGMAP_NAME);
            }
            None => {
                let configmap = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(CONFIGMAP_NAME.to_string()),
                        namespace: Some(self.namespace.clone()),
                        ..Default::default()
                    },
                    data: Some(BTreeMap::from([(CONFIGMAP_DATA_KEY.to_string(), yaml)])),
                    ..Default::default()
                };
                self.configmaps.create(&self.namespace, &configmap).await?;
                debug!("Created ConfigMap {}/{}", self.namespace, CONFIGMAP_NAME);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::InMemoryObjectApi;

    fn manager() -> (Arc<InMemoryObjectApi<ConfigMap>>, ConfigMgr) {
        let api = Arc::new(InMemoryObjectApi::<ConfigMap>::new());
        let mgr = ConfigMgr::new("higress-system", api.clone());
        (api, mgr)
    }

    fn configmap_with(data: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(CONFIGMAP_NAME.to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                CONFIGMAP_DATA_KEY.to_string(),
                data.to_string(),
            )])),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_init_config_creates_default_on_empty_namespace() {
        let (api, mgr) = manager();
        let config = mgr.init_config("").await.unwrap();

        assert!(config.automatic_https);
        assert!((config.renewal_window_ratio - 0.5).abs() < f64::EPSILON);
        assert!(config.domains.is_empty());
        assert!(config.email.starts_with("your"));

        let stored = api.object("higress-system", CONFIGMAP_NAME).unwrap();
        let persisted = ConfigMgr::parse_config_from_configmap(&stored).unwrap();
        assert_eq!(persisted, config);
    }

    #[tokio::test]
    async fn test_init_config_uses_seed_email() {
        let (_, mgr) = manager();
        let config = mgr.init_config("ops@example.com").await.unwrap();
        assert_eq!(config.email, "ops@example.com");
    }

    #[tokio::test]
    async fn test_init_config_rejects_invalid_existing_document() {
        let (api, mgr) = manager();
        api.insert(
            "higress-system",
            configmap_with("email: ops@example.com\nrenewalWindowRatio: 1.5\n"),
        );
        assert!(matches!(
            mgr.init_config("").await,
            Err(ConfigError::InvalidRenewalWindowRatio(_))
        ));
        // Nothing was overwritten
        assert_eq!(api.writes(), 0);
    }

    #[tokio::test]
    async fn test_init_config_propagates_cluster_errors() {
        let (api, mgr) = manager();
        api.set_unavailable(true);
        assert!(matches!(
            mgr.init_config("").await,
            Err(ConfigError::Cluster(ClusterError::Unavailable(_)))
        ));
    }

    #[test]
    fn test_parse_requires_data_key() {
        let configmap = ConfigMap {
            metadata: ObjectMeta {
                name: Some(CONFIGMAP_NAME.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            ConfigMgr::parse_config_from_configmap(&configmap),
            Err(ConfigError::MissingDataKey { .. })
        ));
    }

    #[tokio::test]
    async fn test_apply_configmap_updates_in_place() {
        let (api, mgr) = manager();
        let mut config = Config::new_default("ops@example.com");
        mgr.apply_configmap(&config).await.unwrap();

        config.automatic_https = false;
        mgr.apply_configmap(&config).await.unwrap();

        let fetched = mgr.get_config_from_configmap().await.unwrap();
        assert!(!fetched.automatic_https);
        assert_eq!(api.writes(), 2);
    }

    #[tokio::test]
    async fn test_get_config_from_missing_configmap_is_not_found() {
        let (_, mgr) = manager();
        match mgr.get_config_from_configmap().await {
            Err(ConfigError::Cluster(e)) => assert!(e.is_not_found()),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_set_and_get_config() {
        let (_, mgr) = manager();
        assert!(mgr.get_config().is_none());
        let config = Arc::new(Config::new_default("ops@example.com"));
        mgr.set_config(Arc::clone(&config));
        assert_eq!(mgr.get_config().as_deref(), Some(config.as_ref()));
    }
}
