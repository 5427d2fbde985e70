//! # TLS Secret Materialization
//!
//! Publishes issued certificates as `kubernetes.io/tls` Secrets the data plane
//! already watches.
//!
//! A Secret is only ever overwritten when it carries
//! [`ANNOTATION_CERT_DOMAIN`]. Operator-managed Secrets that share a name with
//! a configured `tlsSecret` are left alone and the write fails with
//! [`SecretError::NotOwned`].

use crate::cert::parse_tls_secret;
use crate::constants::{
    ANNOTATION_CERT_DOMAIN, ANNOTATION_CERT_NOT_AFTER, ANNOTATION_CERT_NOT_BEFORE,
    ANNOTATION_CERT_RENEW, ANNOTATION_CERT_RENEW_TIME, ANNOTATION_TIME_FORMAT,
};
use crate::k8s::{ClusterError, ObjectApi};
use crate::observability::metrics;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub const SECRET_TYPE_TLS: &str = "kubernetes.io/tls";
pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("tlsSecret {0:?} is not a valid name or namespace/name")]
    InvalidName(String),

    #[error(
        "secret {namespace}/{name} exists and was not created by automatic https \
         (missing higress.io/cert-domain annotation), refusing to overwrite"
    )]
    NotOwned { namespace: String, name: String },

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Material and bookkeeping for one Secret write
#[derive(Debug, Clone)]
pub struct TlsMaterial<'a> {
    pub domain: &'a str,
    pub private_key: &'a [u8],
    pub certificate: &'a [u8],
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub is_renew: bool,
}

pub struct SecretMgr {
    namespace: String,
    secrets: Arc<dyn ObjectApi<Secret>>,
}

impl std::fmt::Debug for SecretMgr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretMgr")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

fn format_time(time: DateTime<Utc>) -> String {
    time.format(ANNOTATION_TIME_FORMAT).to_string()
}

impl SecretMgr {
    #[must_use]
    pub fn new(namespace: &str, secrets: Arc<dyn ObjectApi<Secret>>) -> Self {
        Self {
            namespace: namespace.to_string(),
            secrets,
        }
    }

    /// Resolve `name` or `namespace/name` against the automation namespace
    pub fn resolve<'a>(&'a self, secret_name: &'a str) -> Result<(&'a str, &'a str), SecretError> {
        let (namespace, name) = parse_tls_secret(secret_name)
            .ok_or_else(|| SecretError::InvalidName(secret_name.to_string()))?;
        Ok((namespace.unwrap_or(self.namespace.as_str()), name))
    }

    fn build_annotations(material: &TlsMaterial<'_>) -> BTreeMap<String, String> {
        let mut annotations = BTreeMap::from([
            (ANNOTATION_CERT_DOMAIN.to_string(), material.domain.to_string()),
            (
                ANNOTATION_CERT_NOT_AFTER.to_string(),
                format_time(material.not_after),
            ),
            (
                ANNOTATION_CERT_NOT_BEFORE.to_string(),
                format_time(material.not_before),
            ),
            (
                ANNOTATION_CERT_RENEW.to_string(),
                material.is_renew.to_string(),
            ),
        ]);
        if material.is_renew {
            annotations.insert(
                ANNOTATION_CERT_RENEW_TIME.to_string(),
                format_time(Utc::now()),
            );
        }
        annotations
    }

    /// Create or update the TLS Secret `secret_name` for `material.domain`
    pub async fn update(
        &self,
        secret_name: &str,
        material: &TlsMaterial<'_>,
    ) -> Result<(), SecretError> {
        let (namespace, name) = self.resolve(secret_name)?;
        let annotations = Self::build_annotations(material);
        let data = BTreeMap::from([
            (
                TLS_CERT_KEY.to_string(),
                ByteString(material.certificate.to_vec()),
            ),
            (
                TLS_PRIVATE_KEY_KEY.to_string(),
                ByteString(material.private_key.to_vec()),
            ),
        ]);

        let Some(existing) = self.secrets.get(namespace, name).await? else {
            let secret = Secret {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some(namespace.to_string()),
                    annotations: Some(annotations),
                    ..Default::default()
                },
                type_: Some(SECRET_TYPE_TLS.to_string()),
                data: Some(data),
                ..Default::default()
            };
            self.secrets.create(namespace, &secret).await?;
            metrics::increment_secret_writes("create");
            info!(domain = %material.domain, secret = %format!("{namespace}/{name}"), "Created TLS secret");
            return Ok(());
        };

        let owned = existing
            .metadata
            .annotations
            .as_ref()
            .is_some_and(|a| a.contains_key(ANNOTATION_CERT_DOMAIN));
        if !owned {
            metrics::increment_secret_refusals();
            warn!(
                domain = %material.domain,
                secret = %format!("{namespace}/{name}"),
                "Refusing to overwrite a secret not managed by automatic https"
            );
            return Err(SecretError::NotOwned {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }

        let mut secret = existing;
        let merged = secret.metadata.annotations.get_or_insert_with(BTreeMap::new);
        if !material.is_renew {
            merged.remove(ANNOTATION_CERT_RENEW_TIME);
        }
        merged.extend(annotations);
        secret.type_ = Some(SECRET_TYPE_TLS.to_string());
        secret.data = Some(data);
        secret.string_data = None;
        self.secrets.replace(namespace, name, &secret).await?;
        metrics::increment_secret_writes("update");
        info!(
            domain = %material.domain,
            secret = %format!("{namespace}/{name}"),
            renewal = material.is_renew,
            "Updated TLS secret"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::InMemoryObjectApi;
    use chrono::TimeZone;

    const NS: &str = "higress-system";

    fn material(is_renew: bool) -> TlsMaterial<'static> {
        TlsMaterial {
            domain: "www.example.com",
            private_key: b"KEY",
            certificate: b"CERT",
            not_before: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap(),
            not_after: Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 1).unwrap(),
            is_renew,
        }
    }

    fn manager() -> (Arc<InMemoryObjectApi<Secret>>, SecretMgr) {
        let api = Arc::new(InMemoryObjectApi::<Secret>::new());
        let mgr = SecretMgr::new(NS, api.clone());
        (api, mgr)
    }

    fn annotation<'a>(secret: &'a Secret, key: &str) -> Option<&'a str> {
        secret
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    fn seed(api: &InMemoryObjectApi<Secret>, ns: &str, name: &str, annotations: &[(&str, &str)]) {
        api.insert(
            ns,
            Secret {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some(ns.to_string()),
                    resource_version: Some("7".to_string()),
                    annotations: Some(
                        annotations
                            .iter()
                            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                            .collect(),
                    ),
                    ..Default::default()
                },
                data: Some(BTreeMap::from([(
                    TLS_CERT_KEY.to_string(),
                    ByteString(b"OLD".to_vec()),
                )])),
                ..Default::default()
            },
        );
    }

    #[tokio::test]
    async fn test_creates_tls_secret_with_annotations() {
        let (api, mgr) = manager();
        mgr.update("www-example-com", &material(false)).await.unwrap();

        let secret = api.object(NS, "www-example-com").unwrap();
        assert_eq!(secret.type_.as_deref(), Some(SECRET_TYPE_TLS));
        let data = secret.data.as_ref().unwrap();
        assert_eq!(data[TLS_CERT_KEY].0, b"CERT");
        assert_eq!(data[TLS_PRIVATE_KEY_KEY].0, b"KEY");
        assert_eq!(
            annotation(&secret, ANNOTATION_CERT_DOMAIN),
            Some("www.example.com")
        );
        assert_eq!(
            annotation(&secret, ANNOTATION_CERT_NOT_AFTER),
            Some("2024-04-01 00:00:01")
        );
        assert_eq!(
            annotation(&secret, ANNOTATION_CERT_NOT_BEFORE),
            Some("2024-01-01 00:00:01")
        );
        assert_eq!(annotation(&secret, ANNOTATION_CERT_RENEW), Some("false"));
        assert!(annotation(&secret, ANNOTATION_CERT_RENEW_TIME).is_none());
    }

    #[tokio::test]
    async fn test_cross_namespace_name() {
        let (api, mgr) = manager();
        mgr.update("gateway/www-tls", &material(false)).await.unwrap();
        assert!(api.object("gateway", "www-tls").is_some());
        assert!(api.objects(NS).is_empty());
    }

    #[tokio::test]
    async fn test_refuses_unowned_secret_without_writing() {
        let (api, mgr) = manager();
        seed(&api, NS, "operator-tls", &[("team", "edge")]);

        let err = mgr
            .update("operator-tls", &material(false))
            .await
            .unwrap_err();
        assert!(matches!(err, SecretError::NotOwned { .. }));
        assert_eq!(api.writes(), 0);
        let secret = api.object(NS, "operator-tls").unwrap();
        assert_eq!(secret.data.as_ref().unwrap()[TLS_CERT_KEY].0, b"OLD");
    }

    #[tokio::test]
    async fn test_updates_owned_secret_in_place() {
        let (api, mgr) = manager();
        seed(
            &api,
            NS,
            "www-example-com",
            &[(ANNOTATION_CERT_DOMAIN, "www.example.com"), ("team", "edge")],
        );

        mgr.update("www-example-com", &material(true)).await.unwrap();

        assert_eq!(api.writes(), 1);
        let secret = api.object(NS, "www-example-com").unwrap();
        assert_eq!(secret.data.as_ref().unwrap()[TLS_CERT_KEY].0, b"CERT");
        assert_eq!(annotation(&secret, ANNOTATION_CERT_RENEW), Some("true"));
        assert!(annotation(&secret, ANNOTATION_CERT_RENEW_TIME).is_some());
        assert_eq!(annotation(&secret, "team"), Some("edge"));
    }

    #[tokio::test]
    async fn test_fresh_issuance_clears_previous_renew_time() {
        let (api, mgr) = manager();
        seed(
            &api,
            NS,
            "www-example-com",
            &[(ANNOTATION_CERT_DOMAIN, "www.example.com")],
        );

        mgr.update("www-example-com", &material(true)).await.unwrap();
        let renewed = api.object(NS, "www-example-com").unwrap();
        assert!(annotation(&renewed, ANNOTATION_CERT_RENEW_TIME).is_some());

        mgr.update("www-example-com", &material(false)).await.unwrap();
        let issued = api.object(NS, "www-example-com").unwrap();
        assert_eq!(annotation(&issued, ANNOTATION_CERT_RENEW), Some("false"));
        assert!(annotation(&issued, ANNOTATION_CERT_RENEW_TIME).is_none());
        assert_eq!(
            annotation(&issued, ANNOTATION_CERT_DOMAIN),
            Some("www.example.com")
        );
    }

    #[tokio::test]
    async fn test_invalid_secret_name() {
        let (_, mgr) = manager();
        assert!(matches!(
            mgr.update("a/b/c", &material(false)).await,
            Err(SecretError::InvalidName(_))
        ));
    }
}
