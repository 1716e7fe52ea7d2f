//! A deduplicating, rate limited work queue for controller keys.
//!
//! A key is in at most one of these states at any time: waiting in the queue, being processed by
//! a worker, or neither. Adding a key that's already waiting is a no-op. Adding a key that's being
//! processed marks it dirty, and it gets put back on the queue once the worker calls `done`. This
//! guarantees that no two workers ever process the same key concurrently, while still making sure
//! that changes observed during processing aren't lost.
mod rate_limiter;

pub use self::rate_limiter::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter,
    MaxOfRateLimiter, RateLimiter,
};

use crate::runner::metrics::QueueMetrics;

use tokio::sync::Notify;

use std::collections::{HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug)]
struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

struct QueueInner<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    rate_limiter: Box<dyn RateLimiter<K>>,
    metrics: Option<QueueMetrics>,
}

/// Handle to a shared work queue. Clones all refer to the same queue.
pub struct WorkQueue<K> {
    inner: Arc<QueueInner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        WorkQueue {
            inner: self.inner.clone(),
        }
    }
}

impl<K> std::fmt::Debug for WorkQueue<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("WorkQueue")
    }
}

impl<K> WorkQueue<K>
where
    K: Hash + Eq + Clone + Debug + Send + 'static,
{
    pub fn new(rate_limiter: impl RateLimiter<K> + 'static) -> WorkQueue<K> {
        WorkQueue::create(Box::new(rate_limiter), None)
    }

    pub fn with_metrics(
        rate_limiter: impl RateLimiter<K> + 'static,
        metrics: QueueMetrics,
    ) -> WorkQueue<K> {
        WorkQueue::create(Box::new(rate_limiter), Some(metrics))
    }

    fn create(rate_limiter: Box<dyn RateLimiter<K>>, metrics: Option<QueueMetrics>) -> WorkQueue<K> {
        let state = QueueState {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            shutting_down: false,
        };
        WorkQueue {
            inner: Arc::new(QueueInner {
                state: Mutex::new(state),
                notify: Notify::new(),
                rate_limiter,
                metrics,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks the key as needing to be processed
    pub fn add(&self, key: K) {
        let mut state = self.lock();
        if state.shutting_down {
            log::trace!("Ignoring add of {:?} because the queue is shutting down", key);
            return;
        }
        if !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            log::trace!("{:?} is being processed and will be requeued when it's done", key);
            return;
        }
        state.queue.push_back(key);
        if let Some(metrics) = self.inner.metrics.as_ref() {
            metrics.added(state.queue.len());
        }
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Adds the key after the given delay has elapsed. Must be called from within a tokio runtime
    /// unless the delay is zero.
    pub fn add_after(&self, key: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay == Duration::from_secs(0) {
            self.add(key);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Adds the key after the delay returned by the rate limiter
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.inner.rate_limiter.when(&key);
        if let Some(metrics) = self.inner.metrics.as_ref() {
            metrics.retry();
        }
        log::debug!("Requeueing {:?} in {}ms", key, delay.as_millis());
        self.add_after(key, delay);
    }

    /// Stops tracking failures of the key, so that the next failure starts over at the base delay
    pub fn forget(&self, key: &K) {
        self.inner.rate_limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner.rate_limiter.num_requeues(key)
    }

    /// Waits for the next key to process. Returns `None` once the queue is shutting down and has
    /// no more keys. Each key that's returned must be passed to `done` after it's processed.
    pub async fn get(&self) -> Option<K> {
        loop {
            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    if let Some(metrics) = self.inner.metrics.as_ref() {
                        metrics.depth(state.queue.len());
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    drop(state);
                    // pass the wakeup along to any other worker that's about to wait
                    self.inner.notify.notify_one();
                    return None;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    /// Marks processing of the key as finished. If it was added again while being processed,
    /// then it goes back on the queue.
    pub fn done(&self, key: &K) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            if let Some(metrics) = self.inner.metrics.as_ref() {
                metrics.added(state.queue.len());
            }
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Number of keys that are waiting to be processed
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops accepting new keys and wakes up all the workers that are waiting in `get`
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::RateLimitConfig;
    use tokio::runtime;

    fn queue() -> WorkQueue<String> {
        WorkQueue::new(default_controller_rate_limiter(&RateLimitConfig::default()))
    }

    fn rt() -> runtime::Runtime {
        runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap()
    }

    #[test]
    fn duplicate_keys_are_coalesced() {
        let queue = queue();
        queue.add("a".to_owned());
        queue.add("b".to_owned());
        queue.add("a".to_owned());
        assert_eq!(2, queue.len());

        rt().block_on(async {
            assert_eq!(Some("a".to_owned()), queue.get().await);
            assert_eq!(Some("b".to_owned()), queue.get().await);
        });
        assert!(queue.is_empty());
    }

    #[test]
    fn key_added_while_processing_is_requeued_when_done() {
        let queue = queue();
        queue.add("a".to_owned());
        rt().block_on(async {
            let key = queue.get().await.unwrap();
            queue.add("a".to_owned());
            // still processing, so it must not be handed to another worker yet
            assert_eq!(0, queue.len());
            queue.done(&key);
            assert_eq!(1, queue.len());
            assert_eq!(Some("a".to_owned()), queue.get().await);
        });
    }

    #[test]
    fn shut_down_wakes_up_waiting_workers() {
        let runtime = runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_time()
            .build()
            .unwrap();
        let queue = queue();
        runtime.block_on(async {
            let waiters = (0..3)
                .map(|_| {
                    let q = queue.clone();
                    tokio::spawn(async move { q.get().await })
                })
                .collect::<Vec<_>>();
            tokio::time::sleep(Duration::from_millis(50)).await;
            queue.shut_down();
            for waiter in waiters {
                let result = waiter.await.expect("waiter panicked");
                assert_eq!(None, result);
            }
        });
        queue.add("late".to_owned());
        assert_eq!(0, queue.len());
    }

    #[test]
    fn queued_keys_are_drained_after_shut_down() {
        let queue = queue();
        queue.add("a".to_owned());
        queue.shut_down();
        rt().block_on(async {
            assert_eq!(Some("a".to_owned()), queue.get().await);
            assert_eq!(None, queue.get().await);
        });
    }

    #[test]
    fn rate_limited_keys_are_added_after_a_delay() {
        let queue = queue();
        rt().block_on(async {
            queue.add_rate_limited("a".to_owned());
            assert_eq!(1, queue.num_requeues(&"a".to_owned()));
            assert_eq!(0, queue.len());
            let key = tokio::time::timeout(Duration::from_secs(1), queue.get())
                .await
                .expect("timed out waiting for key");
            assert_eq!(Some("a".to_owned()), key);
            queue.forget(&"a".to_owned());
            assert_eq!(0, queue.num_requeues(&"a".to_owned()));
        });
    }
}
