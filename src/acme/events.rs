//! Engine event payloads

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Emitted after a certificate and its key were written to storage
pub const EVENT_CERT_OBTAINED: &str = "cert_obtained";

/// Payload of [`EVENT_CERT_OBTAINED`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertObtained {
    pub renewal: bool,
    /// Seconds the previous certificate had left, zero for first issuance
    #[serde(default)]
    pub remaining: i64,
    pub identifier: String,
    pub issuer: String,
    #[serde(default)]
    pub storage_path: String,
    pub private_key_path: String,
    pub certificate_path: String,
    #[serde(default)]
    pub metadata_path: String,
}

impl CertObtained {
    /// Payload map handed to [`super::EventSink::on_event`]
    #[must_use]
    pub fn to_payload(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            // A struct of strings, bools and integers always serializes to an object
            _ => Map::new(),
        }
    }

    pub fn from_payload(data: &Map<String, Value>) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(data.clone()))
    }
}
