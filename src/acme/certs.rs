//! PEM bundle helpers

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("failed to parse PEM bundle: {0}")]
    Pem(#[from] pem::PemError),

    #[error("PEM bundle contains no CERTIFICATE block")]
    NoCertificate,

    #[error("invalid X509 certificate: {0}")]
    X509(String),

    #[error("certificate validity {0} is out of range")]
    OutOfRange(i64),
}

/// Validity window of a leaf certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validity {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl Validity {
    #[must_use]
    pub fn lifetime(&self) -> TimeDelta {
        self.not_after - self.not_before
    }

    #[must_use]
    pub fn remaining(&self, now: DateTime<Utc>) -> TimeDelta {
        self.not_after - now
    }

    /// Whether the certificate is inside its renewal window at `now`
    ///
    /// The window opens once remaining lifetime is at or below
    /// `ratio * lifetime`.
    #[must_use]
    pub fn needs_renewal(&self, now: DateTime<Utc>, ratio: f64) -> bool {
        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            reason = "Certificate lifetimes are far below f64 precision limits"
        )]
        let window = TimeDelta::seconds((self.lifetime().num_seconds() as f64 * ratio) as i64);
        self.remaining(now) <= window
    }
}

fn to_utc(timestamp: i64) -> Result<DateTime<Utc>, CertificateError> {
    DateTime::from_timestamp(timestamp, 0).ok_or(CertificateError::OutOfRange(timestamp))
}

/// Validity of the first certificate in a PEM chain
pub fn leaf_validity(bundle: &[u8]) -> Result<Validity, CertificateError> {
    let blocks = pem::parse_many(bundle)?;
    let leaf = blocks
        .iter()
        .find(|block| block.tag() == "CERTIFICATE")
        .ok_or(CertificateError::NoCertificate)?;

    let (_, cert) = x509_parser::parse_x509_certificate(leaf.contents())
        .map_err(|e| CertificateError::X509(e.to_string()))?;
    let validity = cert.validity();

    Ok(Validity {
        not_before: to_utc(validity.not_before.to_datetime().unix_timestamp())?,
        not_after: to_utc(validity.not_after.to_datetime().unix_timestamp())?,
    })
}

/// Timestamp written to Secret annotations
///
/// Truncated to whole seconds and moved one second forward, so the annotated
/// instant never falls on the exact validity boundary.
#[must_use]
pub fn annotation_instant(time: DateTime<Utc>) -> DateTime<Utc> {
    let truncated = DateTime::from_timestamp(time.timestamp(), 0).unwrap_or(time);
    truncated + TimeDelta::seconds(1)
}
