//! Recording [`CertEngine`] for unit tests

use super::{
    CertEngine, CertObtained, DomainFailure, EngineError, EventSink, ManagedDomain,
    EVENT_CERT_OBTAINED,
};
use crate::storage::{ConfigmapStorage, Storage};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, Weak};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    Email(String),
    Ratio(f64),
    Start,
    Stop,
    Manage(Vec<String>),
    Unmanage(Vec<String>),
}

/// Records calls; optionally stores a certificate and emits
/// `cert_obtained` for every managed domain
#[derive(Default)]
pub(crate) struct RecordingEngine {
    pub(crate) calls: Mutex<Vec<Call>>,
    pub(crate) sink: Mutex<Option<Weak<dyn EventSink>>>,
    pub(crate) issue: Option<(Arc<ConfigmapStorage>, String)>,
    pub(crate) fail: Vec<String>,
}

impl RecordingEngine {
    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn push(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl CertEngine for RecordingEngine {
    fn set_email(&self, email: &str) {
        self.push(Call::Email(email.to_string()));
    }
    fn set_renewal_window_ratio(&self, ratio: f64) {
        self.push(Call::Ratio(ratio));
    }
    fn set_event_sink(&self, sink: Weak<dyn EventSink>) {
        *self.sink.lock().unwrap() = Some(sink);
    }
    fn start_maintenance(&self) {
        self.push(Call::Start);
    }
    fn stop_maintenance(&self) {
        self.push(Call::Stop);
    }
    async fn manage_sync(&self, domains: &[String]) -> Result<(), EngineError> {
        self.push(Call::Manage(domains.to_vec()));
        if let Some((storage, pem)) = &self.issue {
            let sink = self.sink.lock().unwrap().clone().and_then(|s| s.upgrade());
            for domain in domains {
                let crt = format!("/certificates/test/{domain}.crt");
                let key = format!("/certificates/test/{domain}.key");
                storage.store(&crt, pem.as_bytes()).await.unwrap();
                storage.store(&key, b"PRIVATE").await.unwrap();
                let event = CertObtained {
                    renewal: false,
                    remaining: 0,
                    identifier: domain.clone(),
                    issuer: "test".to_string(),
                    storage_path: format!("/certificates/test/{domain}"),
                    private_key_path: key,
                    certificate_path: crt,
                    metadata_path: String::new(),
                };
                if let Some(sink) = &sink {
                    sink.on_event(EVENT_CERT_OBTAINED, &event.to_payload())
                        .await
                        .unwrap();
                }
            }
        }
        if self.fail.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Partial {
                total: domains.len(),
                failures: self
                    .fail
                    .iter()
                    .map(|d| DomainFailure {
                        domain: d.clone(),
                        reason: "order invalid".to_string(),
                    })
                    .collect(),
            })
        }
    }
    fn unmanage(&self, domains: &[String]) {
        self.push(Call::Unmanage(domains.to_vec()));
    }
    fn status(&self) -> Vec<ManagedDomain> {
        Vec::new()
    }
}
