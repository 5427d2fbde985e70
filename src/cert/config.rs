//! # Certificate Configuration
//!
//! The desired-state document operators edit in the `higress-https` ConfigMap.
//!
//! ```yaml
//! email: ops@example.com
//! automaticHttps: true
//! renewalWindowRatio: 0.5
//! fallbackForInvalidSecret: false
//! domains: []
//! credentialConfig:
//!   - domains: ["www.example.com"]
//!     tlsIssuer: letsencrypt
//!     tlsSecret: gateway/www-example-com
//!   - domains: ["*.internal.example.com"]
//!     tlsSecret: internal-wildcard
//! version: "20240101120000"
//! ```
//!
//! Documents are parsed over [`Config::default`], so omitted fields keep their
//! defaults, and then validated with [`Config::validate`].

use crate::constants::{DEFAULT_RENEWAL_WINDOW_RATIO, ISSUER_LETSENCRYPT};
use crate::k8s::ClusterError;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::LazyLock;
use thiserror::Error;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$")
        .expect("Failed to compile email regex - this should never happen")
});

/// Errors raised while loading, validating or persisting [`Config`]
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("email {0:?} is invalid")]
    InvalidEmail(String),

    #[error("renewalWindowRatio {0} must be strictly between 0 and 1")]
    InvalidRenewalWindowRatio(f64),

    #[error("credentialConfig[{0}] domains is empty")]
    EmptyCredentialDomains(usize),

    #[error("credentialConfig[{0}] tlsSecret is empty")]
    EmptyTlsSecret(usize),

    #[error("credentialConfig tlsSecret {0} is not supported")]
    UnsupportedTlsSecret(String),

    #[error("credentialConfig tlsIssuer {0} is not supported")]
    UnsupportedIssuer(String),

    #[error("credentialConfig tlsIssuer {0} only supports one domain")]
    IssuerSingleDomain(String),

    #[error("no cert key {key} in configmap {configmap}")]
    MissingDataKey { key: String, configmap: String },

    #[error("failed to parse certificate config: {0}")]
    Parse(#[source] serde_yaml::Error),

    #[error("failed to serialize certificate config: {0}")]
    Serialize(#[source] serde_yaml::Error),

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Desired certificate state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// ACME account contact
    pub email: String,
    /// Master switch for issuance and renewal
    pub automatic_https: bool,
    /// Serve the fallback certificate when a referenced Secret is unusable
    pub fallback_for_invalid_secret: bool,
    /// Renew once remaining lifetime drops to this fraction of the total
    pub renewal_window_ratio: f64,
    /// Legacy flat domain list, issued through the ACME issuer
    pub domains: Vec<String>,
    /// Domain pattern to Secret mapping, scanned in declaration order
    pub credential_config: Vec<CredentialEntry>,
    /// Stamp written when the document was synthesized
    pub version: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            email: String::new(),
            automatic_https: true,
            fallback_for_invalid_secret: false,
            renewal_window_ratio: DEFAULT_RENEWAL_WINDOW_RATIO,
            domains: Vec::new(),
            credential_config: Vec::new(),
            version: String::new(),
        }
    }
}

/// One entry of `credentialConfig`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CredentialEntry {
    pub domains: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tls_issuer: String,
    /// `name` or `namespace/name`
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tls_secret: String,
    #[serde(rename = "cacertSecret", skip_serializing_if = "String::is_empty")]
    pub cacert_secret: String,
}

impl CredentialEntry {
    /// Whether any pattern of this entry covers `domain`
    #[must_use]
    pub fn matches(&self, domain: &str) -> bool {
        self.domains
            .iter()
            .any(|pattern| domain_matches(pattern, domain))
    }
}

impl Config {
    /// Default document for a fresh install
    ///
    /// A blank `email` is replaced with a random placeholder.
    #[must_use]
    pub fn new_default(email: &str) -> Self {
        let email = if email.trim().is_empty() {
            random_placeholder_email()
        } else {
            email.trim().to_string()
        };
        Self {
            email,
            version: chrono::Utc::now().format("%Y%m%d%H%M%S").to_string(),
            ..Self::default()
        }
    }

    /// Parse a YAML document over the defaults and validate it
    pub fn from_yaml(data: &str) -> Result<Self, ConfigError> {
        let config: Self = if data.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(data).map_err(ConfigError::Parse)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(ConfigError::Serialize)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_email(&self.email) {
            return Err(ConfigError::InvalidEmail(self.email.clone()));
        }
        // NaN fails both comparisons
        if !(self.renewal_window_ratio > 0.0 && self.renewal_window_ratio < 1.0) {
            return Err(ConfigError::InvalidRenewalWindowRatio(
                self.renewal_window_ratio,
            ));
        }

        for (index, entry) in self.credential_config.iter().enumerate() {
            if entry.domains.is_empty() {
                return Err(ConfigError::EmptyCredentialDomains(index));
            }
            if entry.tls_secret.is_empty() {
                return Err(ConfigError::EmptyTlsSecret(index));
            }
            if parse_tls_secret(&entry.tls_secret).is_none() {
                return Err(ConfigError::UnsupportedTlsSecret(entry.tls_secret.clone()));
            }
            match entry.tls_issuer.as_str() {
                "" => {}
                ISSUER_LETSENCRYPT => {
                    if entry.domains.len() > 1 {
                        return Err(ConfigError::IssuerSingleDomain(entry.tls_issuer.clone()));
                    }
                }
                other => return Err(ConfigError::UnsupportedIssuer(other.to_string())),
            }
        }
        Ok(())
    }

    /// Target Secret of the first credential entry covering `domain`
    #[must_use]
    pub fn match_secret_name_by_domain(&self, domain: &str) -> Option<&str> {
        self.credential_config
            .iter()
            .find(|entry| entry.matches(domain))
            .map(|entry| entry.tls_secret.as_str())
    }

    /// Like [`Self::match_secret_name_by_domain`], restricted to one issuer
    #[must_use]
    pub fn get_secret_name_by_domain(&self, issuer: &str, domain: &str) -> Option<&str> {
        self.credential_config
            .iter()
            .filter(|entry| entry.tls_issuer == issuer)
            .find(|entry| entry.matches(domain))
            .map(|entry| entry.tls_secret.as_str())
    }

    /// Domains the ACME engine must keep certificates for
    ///
    /// Legacy `domains` first, then the domains of every `letsencrypt`
    /// credential entry, de-duplicated in first-seen order.
    #[must_use]
    pub fn managed_domains(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.domains
            .iter()
            .chain(
                self.credential_config
                    .iter()
                    .filter(|entry| entry.tls_issuer == ISSUER_LETSENCRYPT)
                    .flat_map(|entry| entry.domains.iter()),
            )
            .map(|d| d.trim())
            .filter(|d| !d.is_empty())
            .filter(|d| seen.insert(d.to_ascii_lowercase()))
            .map(str::to_string)
            .collect()
    }
}

/// Whether `pattern` covers `domain`
///
/// Case-insensitive exact match, `*.suffix` matching any name ending in
/// `.suffix`, or the catch-all `*`.
#[must_use]
pub fn domain_matches(pattern: &str, domain: &str) -> bool {
    let pattern = pattern.trim().to_ascii_lowercase();
    let domain = domain.trim().to_ascii_lowercase();
    if pattern == "*" || pattern == domain {
        return true;
    }
    match pattern.strip_prefix('*') {
        Some(suffix) if suffix.starts_with('.') => domain.ends_with(suffix),
        _ => false,
    }
}

/// Split a `tlsSecret` reference into `(namespace, name)`
///
/// `name` yields no namespace; `namespace/name` yields both; anything else
/// (empty parts, more than one `/`) is unsupported.
#[must_use]
pub fn parse_tls_secret(tls_secret: &str) -> Option<(Option<&str>, &str)> {
    let mut parts = tls_secret.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(name), None, None) if !name.is_empty() => Some((None, name)),
        (Some(ns), Some(name), None) if !ns.is_empty() && !name.is_empty() => {
            Some((Some(ns), name))
        }
        _ => None,
    }
}

#[must_use]
pub fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(email)
}

/// `your<n>@yours<m>.com` with n, m drawn from 100..100000
#[must_use]
pub fn random_placeholder_email() -> String {
    let mut rng = rand::thread_rng();
    let n1: u32 = rng.gen_range(100..100_000);
    let n2: u32 = rng.gen_range(100..100_000);
    format!("your{n1}@yours{n2}.com")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(domains: &[&str], issuer: &str, secret: &str) -> CredentialEntry {
        CredentialEntry {
            domains: domains.iter().map(ToString::to_string).collect(),
            tls_issuer: issuer.to_string(),
            tls_secret: secret.to_string(),
            cacert_secret: String::new(),
        }
    }

    fn config_with(entries: Vec<CredentialEntry>) -> Config {
        Config {
            email: "ops@example.com".to_string(),
            credential_config: entries,
            ..Config::default()
        }
    }

    #[test]
    fn test_domain_matches() {
        assert!(domain_matches("www.example.com", "WWW.Example.com"));
        assert!(domain_matches("*.example.com", "api.example.com"));
        assert!(domain_matches("*.example.com", "a.b.example.com"));
        assert!(!domain_matches("*.example.com", "example.com"));
        assert!(!domain_matches("*.example.com", "badexample.com"));
        assert!(domain_matches("*", "anything.test"));
        assert!(!domain_matches("www.example.com", "api.example.com"));
    }

    #[test]
    fn test_first_matching_entry_wins() {
        let config = config_with(vec![
            entry(&["*.example.com"], "", "wildcard"),
            entry(&["www.example.com"], ISSUER_LETSENCRYPT, "exact"),
            entry(&["*"], "", "catch-all"),
        ]);
        assert_eq!(
            config.match_secret_name_by_domain("www.example.com"),
            Some("wildcard")
        );
        assert_eq!(
            config.match_secret_name_by_domain("other.test"),
            Some("catch-all")
        );
        assert_eq!(
            config.get_secret_name_by_domain(ISSUER_LETSENCRYPT, "www.example.com"),
            Some("exact")
        );
        assert_eq!(
            config.get_secret_name_by_domain(ISSUER_LETSENCRYPT, "api.example.com"),
            None
        );
    }

    #[test]
    fn test_no_match_yields_none() {
        let config = config_with(vec![entry(&["a.test"], "", "a")]);
        assert_eq!(config.match_secret_name_by_domain("b.test"), None);
    }

    #[test]
    fn test_parse_tls_secret() {
        assert_eq!(parse_tls_secret("tls"), Some((None, "tls")));
        assert_eq!(parse_tls_secret("ns/tls"), Some((Some("ns"), "tls")));
        assert_eq!(parse_tls_secret("a/b/c"), None);
        assert_eq!(parse_tls_secret("/tls"), None);
        assert_eq!(parse_tls_secret(""), None);
    }

    #[test]
    fn test_validate_rejects_bad_documents() {
        let mut config = config_with(vec![]);
        config.email = "not-an-email".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidEmail(_))
        ));

        for ratio in [0.0, 1.0, -0.5, f64::NAN] {
            let mut config = config_with(vec![]);
            config.renewal_window_ratio = ratio;
            assert!(matches!(
                config.validate(),
                Err(ConfigError::InvalidRenewalWindowRatio(_))
            ));
        }

        let config = config_with(vec![entry(&["a.test", "b.test"], ISSUER_LETSENCRYPT, "s")]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::IssuerSingleDomain(_))
        ));

        let config = config_with(vec![entry(&["a.test"], "aliyunssl", "s")]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnsupportedIssuer(_))
        ));

        let config = config_with(vec![entry(&[], "", "s")]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::EmptyCredentialDomains(0))
        ));

        let config = config_with(vec![entry(&["a.test"], "", "")]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::EmptyTlsSecret(0))
        ));

        let config = config_with(vec![entry(&["a.test"], "", "a/b/c")]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnsupportedTlsSecret(_))
        ));
    }

    #[test]
    fn test_from_yaml_keeps_defaults_for_omitted_fields() {
        let config = Config::from_yaml(
            "email: ops@example.com\ncredentialConfig:\n  - domains: [www.example.com]\n    tlsIssuer: letsencrypt\n    tlsSecret: gw/www\n",
        )
        .unwrap();
        assert!(config.automatic_https);
        assert!((config.renewal_window_ratio - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.credential_config.len(), 1);
        assert_eq!(config.credential_config[0].tls_secret, "gw/www");
    }

    #[test]
    fn test_from_yaml_surfaces_parse_errors() {
        assert!(matches!(
            Config::from_yaml("email: [unterminated"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_managed_domains_unions_and_dedups() {
        let mut config = config_with(vec![
            entry(&["b.test"], ISSUER_LETSENCRYPT, "b"),
            entry(&["c.test"], "", "c"),
            entry(&["A.test"], ISSUER_LETSENCRYPT, "a"),
        ]);
        config.domains = vec!["a.test".to_string(), " ".to_string()];
        assert_eq!(config.managed_domains(), vec!["a.test", "b.test"]);
    }

    #[test]
    fn test_new_default() {
        let config = Config::new_default("");
        assert!(is_valid_email(&config.email));
        assert!(config.email.starts_with("your"));
        assert!(config.automatic_https);
        assert!(config.domains.is_empty());
        assert_eq!(config.version.len(), 14);
        config.validate().unwrap();

        let config = Config::new_default(" ops@example.com ");
        assert_eq!(config.email, "ops@example.com");
    }

    #[test]
    fn test_yaml_round_trip_preserves_document() {
        let config = config_with(vec![entry(&["x.test"], ISSUER_LETSENCRYPT, "ns/x")]);
        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("automaticHttps: true"));
        assert!(yaml.contains("tlsSecret: ns/x"));
        assert_eq!(Config::from_yaml(&yaml).unwrap(), config);
    }
}
