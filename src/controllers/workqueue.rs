//! Rate limited work queue
//!
//! Keys are de-duplicated while they wait and while they are being processed: adding a
//! key that is already queued is a no-op, and adding a key that a worker currently holds
//! marks it dirty so it is queued again once the worker calls [`WorkQueue::done`].
//! Failed keys are re-added after a per-key exponential backoff until they are forgotten.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use kube::Resource;
use tokio::sync::Notify;
use tracing::debug;

use crate::metrics;

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

/// FIFO work queue with per-key de-duplication
#[derive(Debug)]
pub struct WorkQueue {
    name: &'static str,
    namespace: String,
    state: Mutex<QueueState>,
    notify: Notify,
}

/// `namespace/name` key of an object
pub fn object_key<K: Resource>(obj: &K) -> Option<String> {
    Some(format!("{}/{}", obj.meta().namespace.as_deref()?, obj.meta().name.as_deref()?))
}

/// Split a `namespace/name` key
pub fn split_key(key: &str) -> Option<(&str, &str)> {
    key.split_once('/')
        .filter(|(ns, name)| !ns.is_empty() && !name.is_empty() && !name.contains('/'))
}

/// Delay before the `failures`-th retry of a key
pub fn backoff_for(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(31);
    BASE_DELAY
        .checked_mul(1u32 << exp)
        .map(|d| d.min(MAX_DELAY))
        .unwrap_or(MAX_DELAY)
}

impl WorkQueue {
    pub fn new(name: &'static str, namespace: &str) -> Arc<Self> {
        Arc::new(Self {
            name,
            namespace: namespace.to_string(),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_depth(&self, depth: usize) {
        metrics::QUEUE_DEPTH
            .with_label_values(&[self.name, &self.namespace])
            .set(depth as f64);
    }

    /// Queue `key` unless it is already waiting
    pub fn add(&self, key: &str) {
        let depth = {
            let mut state = self.lock();
            if state.shutting_down || state.dirty.contains(key) {
                return;
            }
            state.dirty.insert(key.to_string());
            if state.processing.contains(key) {
                return;
            }
            state.queue.push_back(key.to_string());
            state.queue.len()
        };
        self.record_depth(depth);
        self.notify.notify_one();
    }

    /// Wait for the next key; `None` once the queue is shut down and drained
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let depth = state.queue.len();
                    drop(state);
                    self.record_depth(depth);
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark `key` as no longer being processed, re-queueing it if it was added meanwhile
    pub fn done(&self, key: &str) {
        let requeued = {
            let mut state = self.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) {
                state.queue.push_back(key.to_string());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Stop tracking failures of `key`
    pub fn forget(&self, key: &str) {
        self.lock().failures.remove(key);
    }

    /// Number of times `key` has been re-added through [`WorkQueue::add_rate_limited`]
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Re-add `key` once its backoff has elapsed
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let failures = {
            let mut state = self.lock();
            let failures = state.failures.entry(key.to_string()).or_insert(0);
            *failures += 1;
            *failures
        };
        self.add_after(key, backoff_for(failures));
    }

    /// Re-add `key` after `delay`
    pub fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Stop accepting keys and wake every waiting worker
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        debug!(queue = self.name, namespace = %self.namespace, "Work queue shutting down");
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Number of keys waiting to be processed
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        assert_eq!(backoff_for(1), Duration::from_millis(5));
        assert_eq!(backoff_for(2), Duration::from_millis(10));
        assert_eq!(backoff_for(3), Duration::from_millis(20));
        assert_eq!(backoff_for(40), MAX_DELAY);
    }

    #[test]
    fn test_split_key() {
        assert_eq!(split_key("pgo/task-1"), Some(("pgo", "task-1")));
        assert_eq!(split_key("task-1"), None);
        assert_eq!(split_key("/task-1"), None);
        assert_eq!(split_key("a/b/c"), None);
    }
}
