//! Rate-limited, deduplicating work queue.
//!
//! Keys added while pending coalesce into one entry; keys added while being
//! processed are parked and re-queued when the processor calls [`done`].
//! Together those two rules give the at-most-one-in-flight-per-key property
//! the reconcile engine relies on. Failed keys come back through
//! [`add_rate_limited`] with per-key exponential backoff.
//!
//! [`done`]: RateLimitingQueue::done
//! [`add_rate_limited`]: RateLimitingQueue::add_rate_limited

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

pub struct RateLimitingQueue<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    failures: HashMap<T, u32>,
    shutting_down: bool,
}

impl<T> RateLimitingQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                failures: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
        })
    }

    /// Enqueue an item. Non-blocking, idempotent for pending items, and a
    /// no-op after shutdown.
    pub fn add(&self, item: T) {
        let mut s = self.state.lock().unwrap();
        if s.shutting_down || s.dirty.contains(&item) {
            return;
        }
        s.dirty.insert(item.clone());
        if s.processing.contains(&item) {
            // parked; done() will re-queue it
            return;
        }
        s.queue.push_back(item);
        drop(s);
        self.notify.notify_one();
    }

    /// Enqueue after a delay. Skipped entirely once shutdown has begun.
    pub fn add_after(self: &Arc<Self>, item: T, delay: Duration) {
        if self.state.lock().unwrap().shutting_down {
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Enqueue with the item's current exponential backoff.
    pub fn add_rate_limited(self: &Arc<Self>, item: T) {
        let delay = {
            let mut s = self.state.lock().unwrap();
            let failures = s.failures.entry(item.clone()).or_insert(0);
            let delay = backoff(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        debug!(delay_ms = delay.as_millis() as u64, "requeueing with backoff");
        self.add_after(item, delay);
    }

    /// Clear an item's failure history after a successful pass.
    pub fn forget(&self, item: &T) {
        self.state.lock().unwrap().failures.remove(item);
    }

    /// Await the next item. Returns `None` once the queue is shut down and
    /// its backlog has drained.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut s = self.state.lock().unwrap();
                if let Some(item) = s.queue.pop_front() {
                    s.dirty.remove(&item);
                    s.processing.insert(item.clone());
                    if !s.queue.is_empty() {
                        // chain the wakeup so sibling workers drain the rest
                        self.notify.notify_one();
                    }
                    return Some(item);
                }
                if s.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark an item's processing finished. If the item was re-added while in
    /// flight it goes back on the queue.
    pub fn done(&self, item: &T) {
        let mut s = self.state.lock().unwrap();
        s.processing.remove(item);
        if s.dirty.contains(item) {
            s.queue.push_back(item.clone());
            drop(s);
            self.notify.notify_one();
        }
    }

    /// Stop accepting new work and wake every waiting worker. Items already
    /// queued are still handed out so in-flight work can drain.
    pub fn shut_down(&self) {
        self.state.lock().unwrap().shutting_down = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn backoff(failures: u32) -> Duration {
    let delay = BASE_DELAY.saturating_mul(1u32 << failures.min(24));
    delay.min(MAX_DELAY)
}
