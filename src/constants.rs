//! # Constants
//!
//! Well-known names and defaults shared across the controller.
//!
//! Names that other components (the gateway data plane, operators' manifests)
//! depend on live here so they cannot drift between modules. Tunables can be
//! overridden via environment variables, see [`crate::config::ControllerConfig`].

/// ConfigMap holding the desired-state certificate document
pub const CONFIGMAP_NAME: &str = "higress-https";

/// Data key inside [`CONFIGMAP_NAME`] that carries the YAML document
pub const CONFIGMAP_DATA_KEY: &str = "cert";

/// Issuer name for ACME certificates issued through Let's Encrypt
pub const ISSUER_LETSENCRYPT: &str = "letsencrypt";

/// Let's Encrypt production ACME directory
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging ACME directory
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Default renewal window as a fraction of certificate lifetime
pub const DEFAULT_RENEWAL_WINDOW_RATIO: f64 = 0.5;

// Storage layout

/// Root of certificate keys inside the storage namespace
pub const CERTIFICATES_PREFIX: &str = "/certificates";

/// Name prefix of sharded certificate ConfigMaps
pub const CERT_STORE_CERTIFICATES_PREFIX: &str = "higress-cert-store-certificates-";

/// ConfigMap that receives every key outside `/certificates`
pub const CERT_STORE_DEFAULT: &str = "higress-cert-store-default";

/// Label distinguishing certificate shards from the default store
pub const CERT_STORE_TYPE_LABEL: &str = "higress.io/cert-store-type";

/// [`CERT_STORE_TYPE_LABEL`] value on certificate shards
pub const CERT_STORE_TYPE_CERTIFICATES: &str = "certificates";

/// [`CERT_STORE_TYPE_LABEL`] value on the default store
pub const CERT_STORE_TYPE_DEFAULT: &str = "default";

/// Kubernetes rejects ConfigMaps whose data exceeds 1 MiB
pub const CONFIGMAP_MAX_DATA_BYTES: usize = 1024 * 1024;

// Secret annotations

/// Ownership annotation; a Secret without it is never overwritten
pub const ANNOTATION_CERT_DOMAIN: &str = "higress.io/cert-domain";

/// Certificate expiry, second granularity
pub const ANNOTATION_CERT_NOT_AFTER: &str = "higress.io/cert-notAfter";

/// Certificate start of validity, second granularity
pub const ANNOTATION_CERT_NOT_BEFORE: &str = "higress.io/cert-notBefore";

/// Whether the last write was a renewal
pub const ANNOTATION_CERT_RENEW: &str = "higress.io/cert-renew";

/// Time of the last renewal write
pub const ANNOTATION_CERT_RENEW_TIME: &str = "higress.io/cert-renew-time";

/// Timestamp layout used by every certificate annotation
pub const ANNOTATION_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// HTTP-01 challenge

/// Well-known path prefix probed by the CA
pub const ACME_CHALLENGE_PATH_PREFIX: &str = "/.well-known/acme-challenge/";

/// Prefix of transient solver Ingress names
pub const SOLVER_INGRESS_PREFIX: &str = "higress-http-solver-";

/// Default in-cluster service serving challenge responses
pub const DEFAULT_CHALLENGE_SERVICE_NAME: &str = "higress-controller";

/// Default port of [`DEFAULT_CHALLENGE_SERVICE_NAME`]
pub const DEFAULT_CHALLENGE_SERVICE_PORT: i32 = 8889;

/// Default ingress class for solver Ingresses
pub const DEFAULT_INGRESS_CLASS: &str = "higress";

/// Default settle delay after presenting a challenge (seconds)
pub const DEFAULT_SOLVER_SETTLE_DELAY_SECS: u64 = 5;

// Process defaults

/// Default namespace when `POD_NAMESPACE` is unset
pub const DEFAULT_NAMESPACE: &str = "higress-system";

/// Default HTTP server port for metrics, health probes and debug status
pub const DEFAULT_METRICS_PORT: u16 = 8080;

/// Default HTTP-01 challenge listener port
pub const DEFAULT_CHALLENGE_PORT: u16 = 8889;

/// Default interval between renewal sweeps (seconds)
pub const DEFAULT_RENEW_CHECK_INTERVAL_SECS: u64 = 600;

/// Default Fibonacci backoff minimum for rate-limited retries (seconds)
pub const DEFAULT_BACKOFF_MIN_SECS: u64 = 5;

/// Default Fibonacci backoff maximum for rate-limited retries (seconds)
pub const DEFAULT_BACKOFF_MAX_SECS: u64 = 300;

/// Default delay before restarting the watch stream after it ends (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_SECS: u64 = 5;

/// Delay between ACME order status polls
pub const ACME_POLL_INTERVAL_MS: u64 = 2000;

/// Order polls before giving up on a pending order
pub const ACME_MAX_POLL_ATTEMPTS: usize = 30;
