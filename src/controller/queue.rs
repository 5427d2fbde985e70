//! # Work Queue
//!
//! FIFO of object keys. A key that is already waiting is not queued twice,
//! so a burst of watch events collapses into one reconciliation. Once a key
//! has been handed to the worker it can be queued again.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Default)]
struct Pending {
    order: VecDeque<String>,
    keys: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct WorkQueue {
    pending: Mutex<Pending>,
    notify: Notify,
    shut_down: AtomicBool,
}

impl WorkQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `key` unless it is already waiting or the queue is shut down
    pub fn add(&self, key: &str) {
        if self.is_shut_down() {
            return;
        }
        let mut pending = self.pending();
        if pending.keys.insert(key.to_string()) {
            pending.order.push_back(key.to_string());
            drop(pending);
            self.notify.notify_one();
        } else {
            debug!(key = %key, "Key already queued");
        }
    }

    /// Queue `key` once `delay` has passed
    pub fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Next key, waiting until one arrives; `None` after [`Self::shut_down`]
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            if self.is_shut_down() {
                return None;
            }
            {
                let mut pending = self.pending();
                if let Some(key) = pending.order.pop_front() {
                    pending.keys.remove(&key);
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending().order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake every waiter and refuse further keys
    pub fn shut_down(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}
