//! Rate-limited work queues.
//!
//! Semantics follow the client-go workqueue: an item added while queued is
//! deduplicated, an item re-added while being processed is parked and
//! re-queued when its processing finishes, and failed items come back through
//! an exponential per-item backoff. Each queue is drained by exactly one
//! worker, so per-key processing is strictly serial.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    failures: HashMap<T, u32>,
    shut_down: bool,
}

impl<T> Default for State<T> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            failures: HashMap::new(),
            shut_down: false,
        }
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
            }),
        }
    }

    pub fn add(&self, item: T) {
        {
            let mut state = self.inner.state.lock();
            if state.shut_down || state.dirty.contains(&item) {
                return;
            }
            state.dirty.insert(item.clone());
            if state.processing.contains(&item) {
                // parked; re-queued by done()
                return;
            }
            state.queue.push_back(item);
        }
        self.inner.notify.notify_one();
    }

    /// Waits for the next item and marks it in-flight. Returns `None` once
    /// the queue has shut down and drained.
    pub async fn get(&self) -> Option<T> {
        loop {
            {
                let mut state = self.inner.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
                if state.shut_down {
                    return None;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    /// Finishes processing of `item`. If it was re-added in the meantime it
    /// goes back on the queue.
    pub fn done(&self, item: &T) {
        let requeued = {
            let mut state = self.inner.state.lock();
            state.processing.remove(item);
            if state.dirty.contains(item) {
                state.queue.push_back(item.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.inner.notify.notify_one();
        }
    }

    /// Clears the failure history of `item`.
    pub fn forget(&self, item: &T) {
        self.inner.state.lock().failures.remove(item);
    }

    /// Re-queues `item` after the exponential backoff for its failure count.
    pub fn add_rate_limited(&self, item: T) {
        let delay = {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return;
            }
            let failures = state.failures.entry(item.clone()).or_insert(0);
            let delay = backoff_delay(*failures);
            *failures += 1;
            delay
        };
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.inner
            .state
            .lock()
            .failures
            .get(item)
            .copied()
            .unwrap_or(0)
    }

    /// Stops the queue: pending items are still delivered, new adds are
    /// dropped, and `get` returns `None` once empty. Idempotent.
    pub fn shut_down(&self) {
        self.inner.state.lock().shut_down = true;
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }
}

fn backoff_delay(failures: u32) -> Duration {
    let exp = failures.min(30);
    BASE_DELAY.saturating_mul(1u32 << exp).min(MAX_DELAY)
}
