use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use super::key::ObjectKey;

/// Decides how long a key has to wait before it is handed out again.
pub trait RateLimiter: Send + Sync {
    /// Delay for the next retry of `key`; every call counts as one failure.
    fn when(&self, key: &ObjectKey) -> Duration;
    /// Stop tracking `key`, resetting its backoff.
    fn forget(&self, key: &ObjectKey);
    /// How many times `key` has been requeued since it was last forgotten.
    fn num_requeues(&self, key: &ObjectKey) -> u32;
}

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
pub struct ItemExponentialBackoff {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<ObjectKey, u32>>,
}

impl ItemExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl RateLimiter for ItemExponentialBackoff {
    fn when(&self, key: &ObjectKey) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let exp = failures.entry(key.clone()).or_insert(0);
        let current = *exp;
        *exp = exp.saturating_add(1);

        // 2^32 * base overflows long before it matters, clamp the exponent
        let factor = 1u64.checked_shl(current.min(62)).unwrap_or(u64::MAX);
        let nanos = (self.base.as_nanos() as u64).saturating_mul(factor);
        Duration::from_nanos(nanos).min(self.max)
    }

    fn forget(&self, key: &ObjectKey) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    fn num_requeues(&self, key: &ObjectKey) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Overall token bucket, shared by every key of a queue.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            qps,
            burst: f64::from(burst),
            bucket: Mutex::new(Bucket {
                tokens: f64::from(burst),
                last: Instant::now(),
            }),
        }
    }
}

impl RateLimiter for BucketRateLimiter {
    fn when(&self, _key: &ObjectKey) -> Duration {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last = now;
        // reserve a token even if it is not there yet; the debt is paid by waiting
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.qps)
        }
    }

    fn forget(&self, _key: &ObjectKey) {}

    fn num_requeues(&self, _key: &ObjectKey) -> u32 {
        0
    }
}

/// Waits for the slowest of its limiters.
pub struct MaxOfRateLimiter {
    limiters: Vec<Box<dyn RateLimiter>>,
}

impl MaxOfRateLimiter {
    pub fn new(limiters: Vec<Box<dyn RateLimiter>>) -> Self {
        Self { limiters }
    }
}

impl RateLimiter for MaxOfRateLimiter {
    fn when(&self, key: &ObjectKey) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.when(key))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, key: &ObjectKey) {
        for limiter in &self.limiters {
            limiter.forget(key);
        }
    }

    fn num_requeues(&self, key: &ObjectKey) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(key))
            .max()
            .unwrap_or(0)
    }
}

/// 5ms..1000s per-key backoff combined with a 10 qps / 100 burst bucket.
pub fn default_controller_rate_limiter() -> Box<dyn RateLimiter> {
    Box::new(MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialBackoff::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        )),
        Box::new(BucketRateLimiter::new(10.0, 100)),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let limiter =
            ItemExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1));
        let key = ObjectKey::new("team-a", "cluster1");

        let delays: Vec<Duration> = (0..12).map(|_| limiter.when(&key)).collect();
        assert_eq!(delays[0], Duration::from_millis(5));
        assert_eq!(delays[1], Duration::from_millis(10));
        assert_eq!(delays[2], Duration::from_millis(20));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]), "{delays:?}");
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(1));
        assert_eq!(limiter.num_requeues(&key), 12);
    }

    #[test]
    fn forget_resets_backoff() {
        let limiter =
            ItemExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1));
        let key = ObjectKey::new("team-a", "cluster1");
        for _ in 0..5 {
            limiter.when(&key);
        }
        limiter.forget(&key);
        assert_eq!(limiter.num_requeues(&key), 0);
        assert_eq!(limiter.when(&key), Duration::from_millis(5));
    }

    #[test]
    fn backoff_is_tracked_per_key() {
        let limiter =
            ItemExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1));
        let a = ObjectKey::new("team-a", "a");
        let b = ObjectKey::new("team-a", "b");
        limiter.when(&a);
        limiter.when(&a);
        assert_eq!(limiter.when(&b), Duration::from_millis(5));
    }

    #[test]
    fn huge_failure_counts_do_not_overflow() {
        let limiter =
            ItemExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1000));
        let key = ObjectKey::new("team-a", "cluster1");
        for _ in 0..200 {
            assert!(limiter.when(&key) <= Duration::from_secs(1000));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_allows_burst_then_throttles() {
        let limiter = BucketRateLimiter::new(10.0, 3);
        let key = ObjectKey::new("team-a", "cluster1");
        for _ in 0..3 {
            assert_eq!(limiter.when(&key), Duration::ZERO);
        }
        assert_eq!(limiter.when(&key), Duration::from_millis(100));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(limiter.when(&key), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn default_limiter_uses_the_slowest() {
        let limiter = default_controller_rate_limiter();
        let key = ObjectKey::new("team-a", "cluster1");
        assert_eq!(limiter.when(&key), Duration::from_millis(5));
        assert_eq!(limiter.when(&key), Duration::from_millis(10));
        limiter.forget(&key);
        assert_eq!(limiter.num_requeues(&key), 0);
    }
}
