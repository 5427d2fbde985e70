//! Pure key utilities: hashing, shard resolution, envelopes and directory
//! listing. Nothing here touches the cluster.

use super::StorageError;
use crate::constants::{CERTIFICATES_PREFIX, CERT_STORE_CERTIFICATES_PREFIX, CERT_STORE_DEFAULT};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const FNV32_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV32_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a of `input`, lowercase hex without padding
#[must_use]
pub fn fast_hash(input: &[u8]) -> String {
    let hash = input.iter().fold(FNV32_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV32_PRIME)
    });
    format!("{hash:x}")
}

/// Whether `key` lives under the certificates root
#[must_use]
pub fn is_certificate_scope(key: &str) -> bool {
    key.strip_prefix(CERTIFICATES_PREFIX)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

/// ConfigMap that owns `key`
///
/// `/certificates/<issuer>/<domain>[.crt|.key|.json][/...]` is sharded by
/// `fast_hash(issuer + domain)`, so a domain's certificate, key and metadata
/// share one ConfigMap. Every other key lands in the default store.
#[must_use]
pub fn shard_name_for_key(key: &str) -> String {
    let parts: Vec<&str> = key.split('/').collect();
    if parts.len() >= 4 && parts[0].is_empty() && parts[1] == "certificates" {
        let issuer = parts[2];
        let domain = [".crt", ".key", ".json"]
            .iter()
            .find_map(|ext| parts[3].strip_suffix(ext))
            .unwrap_or(parts[3]);
        if !issuer.is_empty() && !domain.is_empty() {
            return format!(
                "{CERT_STORE_CERTIFICATES_PREFIX}{}",
                fast_hash(format!("{issuer}{domain}").as_bytes())
            );
        }
    }
    CERT_STORE_DEFAULT.to_string()
}

/// Stored form of one key/value pair: `{"k": key, "v": base64(value)}`
///
/// Keeps the original key next to the value so prefix scans work on hashed
/// ConfigMap data keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub k: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub v: String,
}

impl Envelope {
    #[must_use]
    pub fn new(key: &str, value: &[u8]) -> Self {
        Self {
            k: key.to_string(),
            v: STANDARD.encode(value),
        }
    }

    pub fn encode(&self) -> Result<String, StorageError> {
        serde_json::to_string(self).map_err(StorageError::Encode)
    }

    pub fn decode(shard: &str, raw: &str) -> Result<Self, StorageError> {
        serde_json::from_str(raw).map_err(|source| StorageError::Envelope {
            shard: shard.to_string(),
            source,
        })
    }

    pub fn value(&self) -> Result<Vec<u8>, StorageError> {
        STANDARD
            .decode(&self.v)
            .map_err(|source| StorageError::Decode {
                key: self.k.clone(),
                source,
            })
    }

    /// Decoded value size without allocating the value
    #[must_use]
    pub fn value_len(&self) -> u64 {
        let padding = self.v.bytes().rev().take_while(|b| *b == b'=').count();
        ((self.v.len() / 4) * 3).saturating_sub(padding) as u64
    }
}

/// Collapse matching keys to the next path segment below `prefix`
///
/// Keys with nothing but a final segment after `prefix` are returned as is;
/// deeper keys collapse to `prefix/<segment>`. Output is de-duplicated and
/// keeps first-seen order.
#[must_use]
pub fn collapse_to_children<I, S>(prefix: &str, keys: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut children = Vec::new();
    for key in keys {
        let key = key.as_ref();
        let Some(rest) = key.strip_prefix(prefix) else {
            continue;
        };
        let trimmed = rest.trim_start_matches('/');
        let separators = rest.len() - trimmed.len();
        let child = match trimmed.find('/') {
            Some(idx) => &key[..prefix.len() + separators + idx],
            None => key,
        };
        if seen.insert(child.to_string()) {
            children.push(child.to_string());
        }
    }
    children
}

/// Size of a ConfigMap's data as counted against the 1 MiB limit
pub fn data_size<'a, I>(entries: I) -> usize
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    entries.into_iter().map(|(k, v)| k.len() + v.len()).sum()
}
