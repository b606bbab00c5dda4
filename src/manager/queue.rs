use std::collections::{HashSet, VecDeque};
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::key::ObjectKey;
use super::rate_limiter::{default_controller_rate_limiter, RateLimiter};

#[derive(Default)]
struct QueueState {
    /// Keys waiting to be handed out, in FIFO order
    queue: VecDeque<ObjectKey>,
    /// Keys that need processing; a superset of `queue` minus in-flight keys
    dirty: HashSet<ObjectKey>,
    /// Keys currently owned by a worker
    processing: HashSet<ObjectKey>,
    shutting_down: bool,
}

/// A deduplicating, rate limited FIFO of object keys.
///
/// A key is handed to at most one caller of [`WorkQueue::get`] at a time.
/// Adding a key that is in flight marks it dirty; it is queued again once
/// the owner calls [`WorkQueue::done`].
pub struct WorkQueue {
    name: String,
    state: Mutex<QueueState>,
    notify: Notify,
    rate_limiter: Box<dyn RateLimiter>,
    /// Cancels pending delayed adds on shutdown
    shutdown: CancellationToken,
}

impl WorkQueue {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_rate_limiter(name, default_controller_rate_limiter())
    }

    pub fn with_rate_limiter(name: impl Into<String>, rate_limiter: Box<dyn RateLimiter>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            rate_limiter,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        // no code path panics while holding the lock, but don't propagate poison if one ever does
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, key: ObjectKey) {
        {
            let mut state = self.state();
            if state.shutting_down {
                return;
            }
            if !state.dirty.insert(key.clone()) {
                return;
            }
            if state.processing.contains(&key) {
                trace!(queue = %self.name, %key, "key is in flight, marked dirty");
                return;
            }
            state.queue.push_back(key);
        }
        self.notify.notify_waiters();
    }

    /// Add `key` once `delay` has passed. Pending adds are dropped on shutdown.
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = queue.shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.add(key),
            }
        });
    }

    /// Add `key` after the delay its rate limiter dictates.
    pub fn add_rate_limited(self: &Arc<Self>, key: ObjectKey) {
        let delay = self.rate_limiter.when(&key);
        trace!(queue = %self.name, %key, ?delay, "requeueing with backoff");
        self.add_after(key, delay);
    }

    /// Reset the backoff of `key`.
    pub fn forget(&self, key: &ObjectKey) {
        self.rate_limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &ObjectKey) -> u32 {
        self.rate_limiter.num_requeues(key)
    }

    /// Wait for the next key. Returns `None` once the queue is shutting down
    /// and has no more keys to hand out.
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let mut notified = pin!(self.notify.notified());
            // register interest before inspecting state so a concurrent add can't be missed
            notified.as_mut().enable();
            {
                let mut state = self.state();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark `key` as no longer in flight.
    pub fn done(&self, key: &ObjectKey) {
        let requeued = {
            let mut state = self.state();
            state.processing.remove(key);
            if state.dirty.contains(key) {
                state.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_waiters();
        }
    }

    /// Stop accepting keys and wake every blocked [`WorkQueue::get`].
    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.shutdown.cancel();
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    /// Number of keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
