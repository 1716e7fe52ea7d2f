//! Rate limiters decide how long a key has to wait before it's retried after a failed sync.
use crate::config::RateLimitConfig;

use backoff::{backoff::Backoff, ExponentialBackoff};
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as GovernorRateLimiter};

use std::collections::HashMap;
use std::hash::Hash;
use std::num::NonZeroU32;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub trait RateLimiter<K>: Send + Sync {
    /// Returns how long the key should wait before it's processed again, and records the failure
    fn when(&self, key: &K) -> Duration;
    /// Clears any history of failures for the key
    fn forget(&self, key: &K);
    /// Returns the number of failures that have been recorded for the key since it was last forgotten
    fn num_requeues(&self, key: &K) -> u32;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct Failures {
    count: u32,
    backoff: ExponentialBackoff,
}

/// Per key exponential backoff: `base_delay * 2^failures`, capped at `max_delay`, with no jitter
#[derive(Debug)]
pub struct ItemExponentialFailureRateLimiter<K> {
    base_delay: Duration,
    max_delay: Duration,
    failures: Mutex<HashMap<K, Failures>>,
}

impl<K: Hash + Eq + Clone> ItemExponentialFailureRateLimiter<K> {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        ItemExponentialFailureRateLimiter {
            base_delay,
            max_delay,
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn new_backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.base_delay,
            max_interval: self.max_delay,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff.reset();
        backoff
    }
}

impl<K: Hash + Eq + Clone + Send> RateLimiter<K> for ItemExponentialFailureRateLimiter<K> {
    fn when(&self, key: &K) -> Duration {
        let mut failures = lock(&self.failures);
        if !failures.contains_key(key) {
            let backoff = self.new_backoff();
            failures.insert(key.clone(), Failures { count: 0, backoff });
        }
        match failures.get_mut(key) {
            Some(entry) => {
                entry.count = entry.count.saturating_add(1);
                entry
                    .backoff
                    .next_backoff()
                    .unwrap_or(self.max_delay)
                    .min(self.max_delay)
            }
            None => self.base_delay,
        }
    }

    fn forget(&self, key: &K) {
        lock(&self.failures).remove(key);
    }

    fn num_requeues(&self, key: &K) -> u32 {
        lock(&self.failures)
            .get(key)
            .map(|f| f.count)
            .unwrap_or(0)
    }
}

/// Overall token bucket, shared by all keys. A key that finds the bucket empty waits until the
/// next token is available. Denied calls don't take a token, so waiting keys don't push each
/// other further back.
pub struct BucketRateLimiter {
    // none when the rate can't be expressed as a period, which means no limit
    limiter: Option<DefaultDirectRateLimiter>,
    clock: DefaultClock,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> BucketRateLimiter {
        let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
        let limiter = Duration::try_from_secs_f64(1.0 / qps)
            .ok()
            .and_then(Quota::with_period)
            .map(|quota| GovernorRateLimiter::direct(quota.allow_burst(burst)));
        if limiter.is_none() {
            log::warn!("Requeue rate of {} per second is not usable, so it will not be limited", qps);
        }
        BucketRateLimiter {
            limiter,
            clock: DefaultClock::default(),
        }
    }

    fn reserve(&self) -> Duration {
        match self.limiter.as_ref().map(|l| l.check()) {
            Some(Err(not_until)) => not_until.wait_time_from(self.clock.now()),
            _ => Duration::from_secs(0),
        }
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _key: &K) -> Duration {
        self.reserve()
    }

    fn forget(&self, _key: &K) {}

    fn num_requeues(&self, _key: &K) -> u32 {
        0
    }
}

/// Returns the longest delay from any of its limiters
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        MaxOfRateLimiter { limiters }
    }
}

impl<K> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&self, key: &K) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.when(key))
            .max()
            .unwrap_or_else(|| Duration::from_secs(0))
    }

    fn forget(&self, key: &K) {
        for limiter in self.limiters.iter() {
            limiter.forget(key);
        }
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(key))
            .max()
            .unwrap_or(0)
    }
}

/// The usual limiter for controllers: per key exponential backoff combined with an overall
/// token bucket
pub fn default_controller_rate_limiter<K>(config: &RateLimitConfig) -> MaxOfRateLimiter<K>
where
    K: Hash + Eq + Clone + Send + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(
            config.base_delay,
            config.max_delay,
        )),
        Box::new(BucketRateLimiter::new(config.qps, config.burst)),
    ])
}

#[cfg(test)]
mod test {
    use super::*;

    fn millis(duration: Duration) -> u128 {
        duration.as_millis()
    }

    #[test]
    fn exponential_limiter_doubles_the_delay_for_each_failure() {
        let limiter = ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        );
        let key = "ns1".to_owned();
        assert_eq!(5, millis(limiter.when(&key)));
        assert_eq!(10, millis(limiter.when(&key)));
        assert_eq!(20, millis(limiter.when(&key)));
        assert_eq!(3, limiter.num_requeues(&key));

        let other = "ns2".to_owned();
        assert_eq!(5, millis(limiter.when(&other)));

        limiter.forget(&key);
        assert_eq!(0, limiter.num_requeues(&key));
        assert_eq!(5, millis(limiter.when(&key)));
    }

    #[test]
    fn exponential_limiter_is_capped_at_max_delay() {
        let limiter = ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(100),
            Duration::from_millis(300),
        );
        let key = "ns1";
        let delays = (0..5).map(|_| millis(limiter.when(&key))).collect::<Vec<_>>();
        assert_eq!(vec![100, 200, 300, 300, 300], delays);
    }

    #[test]
    fn bucket_limiter_allows_a_burst_then_delays() {
        let limiter = BucketRateLimiter::new(1.0, 2);
        let key = "ns1";
        assert_eq!(Duration::from_secs(0), RateLimiter::when(&limiter, &key));
        assert_eq!(Duration::from_secs(0), RateLimiter::when(&limiter, &key));
        let delay = RateLimiter::when(&limiter, &key);
        assert!(delay > Duration::from_millis(900), "delay was: {:?}", delay);
        assert!(delay <= Duration::from_secs(1), "delay was: {:?}", delay);
    }

    #[test]
    fn bucket_limiter_refills_at_the_configured_rate() {
        let limiter = BucketRateLimiter::new(100.0, 1);
        let key = "ns1";
        assert_eq!(Duration::from_secs(0), RateLimiter::when(&limiter, &key));
        let delay = RateLimiter::when(&limiter, &key);
        assert!(delay > Duration::from_secs(0), "delay was: {:?}", delay);
        assert!(delay <= Duration::from_millis(10), "delay was: {:?}", delay);

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(Duration::from_secs(0), RateLimiter::when(&limiter, &key));
    }

    #[test]
    fn bucket_limiter_treats_unusable_rates_as_unlimited() {
        for qps in &[0.0, -1.0] {
            let limiter = BucketRateLimiter::new(*qps, 1);
            for _ in 0..5 {
                assert_eq!(Duration::from_secs(0), RateLimiter::when(&limiter, &"ns1"));
            }
        }
    }

    #[test]
    fn max_of_limiter_uses_the_longest_delay() {
        let limiter = default_controller_rate_limiter::<String>(&RateLimitConfig::default());
        let key = "ns1".to_owned();
        assert_eq!(5, millis(limiter.when(&key)));
        assert_eq!(10, millis(limiter.when(&key)));
        assert_eq!(2, limiter.num_requeues(&key));
        limiter.forget(&key);
        assert_eq!(0, limiter.num_requeues(&key));
    }
}
