//! # ConfigMap Watch
//!
//! Watches the single desired-state ConfigMap, keeps a local store of it for
//! the worker, and enqueues its name on add and update.

use super::queue::WorkQueue;
use futures::{pin_mut, StreamExt};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::Api;
use kube_runtime::reflector::store::Writer;
use kube_runtime::reflector::{ObjectRef, Store};
use kube_runtime::{watcher, WatchStreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Read access to watched ConfigMaps
pub trait ConfigMapLister: Send + Sync {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<ConfigMap>>;
}

impl ConfigMapLister for Store<ConfigMap> {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<ConfigMap>> {
        Store::get(self, &ObjectRef::new(name).within(namespace))
    }
}

impl ConfigMapLister for HashMap<(String, String), Arc<ConfigMap>> {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<ConfigMap>> {
        HashMap::get(self, &(namespace.to_string(), name.to_string())).cloned()
    }
}

/// Decides which watch events enqueue the ConfigMap
///
/// Adds always enqueue. Updates enqueue unless the new object equals the
/// previous one in full, metadata included, so practically every update
/// does. Deletes are not handled.
#[derive(Debug)]
pub struct EventFilter {
    name: String,
    last: Option<ConfigMap>,
}

impl EventFilter {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            last: None,
        }
    }

    /// Key to enqueue for `event`, if any
    pub fn handle(&mut self, event: &watcher::Event<ConfigMap>) -> Option<String> {
        match event {
            watcher::Event::Apply(configmap) | watcher::Event::InitApply(configmap) => {
                if configmap.metadata.name.as_deref() != Some(self.name.as_str()) {
                    return None;
                }
                let changed = self.last.as_ref() != Some(configmap);
                self.last = Some(configmap.clone());
                changed.then(|| self.name.clone())
            }
            watcher::Event::Delete(configmap) => {
                if configmap.metadata.name.as_deref() == Some(self.name.as_str()) {
                    warn!(
                        configmap = %self.name,
                        "Desired-state ConfigMap deleted; current certificates stay managed"
                    );
                    self.last = None;
                }
                None
            }
            watcher::Event::Init | watcher::Event::InitDone => None,
        }
    }
}

/// Watch settings
#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub namespace: String,
    pub name: String,
    pub restart_delay: Duration,
}

/// Run the watch until `cancel` fires, restarting the stream when it ends
///
/// `synced` flips to true once the first listing completed.
pub async fn run_watch(
    api: Api<ConfigMap>,
    options: WatchOptions,
    mut writer: Writer<ConfigMap>,
    queue: Arc<WorkQueue>,
    synced: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut filter = EventFilter::new(&options.name);

    loop {
        info!(
            "Starting watch for ConfigMap '{}' in namespace '{}'",
            options.name, options.namespace
        );
        let watcher_config =
            watcher::Config::default().fields(&format!("metadata.name={}", options.name));
        let stream = watcher(api.clone(), watcher_config).default_backoff();
        pin_mut!(stream);

        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => return,
                next = stream.next() => next,
            };
            let Some(event_result) = next else {
                break;
            };
            match event_result {
                Ok(event) => {
                    writer.apply_watcher_event(&event);
                    if matches!(event, watcher::Event::InitDone) {
                        if !synced.swap(true, Ordering::SeqCst) {
                            info!("ConfigMap watch synced");
                        }
                    }
                    if let Some(key) = filter.handle(&event) {
                        debug!(key = %key, "Enqueueing ConfigMap");
                        queue.add(&key);
                    }
                }
                Err(e) => {
                    // The backoff wrapper retries on its own
                    error!("Error watching ConfigMap: {}", e);
                }
            }
        }

        warn!(
            "ConfigMap watch stream ended, restarting in {}s",
            options.restart_delay.as_secs()
        );
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(options.restart_delay) => {}
        }
    }
}
