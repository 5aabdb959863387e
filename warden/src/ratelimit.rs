//! Token-bucket rate limiting
//!
//! The admission-control primitive shared by the OAuth endpoints, sandbox
//! submission, and bus publishers. A bucket refills continuously; `acquire`
//! either consumes a token immediately or reports how long the caller should
//! cooperatively wait. Rate limiting never returns an error.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;

use crate::clock::Clock;
use crate::config::RateLimitConfig;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill_ms: i64,
}

/// A single continuously-refilling token bucket
///
/// Acquisition is atomic per bucket: the refill-and-consume step runs under
/// one short lock with no suspension point inside.
pub struct TokenBucket {
    max_tokens: f64,
    refill_per_ms: f64,
    state: Mutex<BucketState>,
    clock: Arc<dyn Clock>,
}

impl TokenBucket {
    /// Create a bucket holding `max_tokens` that refills at `refill_per_sec`
    pub fn new(max_tokens: u32, refill_per_sec: f64, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_ms();
        Self {
            max_tokens: f64::from(max_tokens),
            refill_per_ms: refill_per_sec / 1_000.0,
            state: Mutex::new(BucketState {
                tokens: f64::from(max_tokens),
                last_refill_ms: now,
            }),
            clock,
        }
    }

    /// Try to consume one token
    ///
    /// Returns `Duration::ZERO` when a token was consumed, otherwise the time
    /// the caller should wait before retrying. The wait is an estimate; the
    /// token is not reserved.
    pub fn acquire(&self) -> Duration {
        let now = self.clock.now_ms();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut state, now);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Duration::ZERO
        } else {
            let deficit = 1.0 - state.tokens;
            let wait_ms = (deficit / self.refill_per_ms).ceil() as u64;
            Duration::from_millis(wait_ms)
        }
    }

    /// Whole tokens currently available, after refill
    pub fn available_tokens(&self) -> u64 {
        let now = self.clock.now_ms();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut state, now);
        state.tokens.floor() as u64
    }

    /// Acquire a token, cooperatively sleeping for the reported wait
    pub async fn acquire_and_wait(&self) {
        loop {
            let wait = self.acquire();
            if wait.is_zero() {
                return;
            }
            tokio::time::sleep(wait).await;
        }
    }

    fn refill(&self, state: &mut BucketState, now_ms: i64) {
        let elapsed = now_ms.saturating_sub(state.last_refill_ms);
        if elapsed > 0 {
            state.tokens =
                (state.tokens + elapsed as f64 * self.refill_per_ms).min(self.max_tokens);
            state.last_refill_ms = now_ms;
        }
    }
}

/// Keyed registry of independent buckets
///
/// Buckets are keyed by client or user id; each key gets its own bucket with
/// the configured shape, created lazily on first use.
pub struct RateLimiter {
    buckets: DashMap<String, Arc<TokenBucket>>,
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a registry issuing buckets with the given shape
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: DashMap::new(),
            config,
            clock,
        }
    }

    /// Try to consume one token for `key`
    pub fn acquire(&self, key: &str) -> Duration {
        self.bucket(key).acquire()
    }

    /// Acquire for `key`, cooperatively sleeping until admitted
    pub async fn acquire_and_wait(&self, key: &str) {
        let bucket = self.bucket(key);
        bucket.acquire_and_wait().await;
    }

    /// Whole tokens currently available for `key`
    pub fn available_tokens(&self, key: &str) -> u64 {
        self.bucket(key).available_tokens()
    }

    /// Drop the bucket for `key`
    pub fn remove(&self, key: &str) {
        self.buckets.remove(key);
    }

    /// Number of live buckets
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// True when no bucket has been created yet
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    fn bucket(&self, key: &str) -> Arc<TokenBucket> {
        self.buckets
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(TokenBucket::new(
                    self.config.capacity,
                    self.config.refill_per_sec,
                    self.clock.clone(),
                ))
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn bucket(max: u32, refill_per_sec: f64) -> (TokenBucket, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let bucket = TokenBucket::new(max, refill_per_sec, clock.clone());
        (bucket, clock)
    }

    #[test]
    fn full_bucket_admits_immediately() {
        let (bucket, _clock) = bucket(2, 1.0);
        assert_eq!(bucket.acquire(), Duration::ZERO);
        assert_eq!(bucket.acquire(), Duration::ZERO);
        assert!(bucket.acquire() > Duration::ZERO);
    }

    #[test]
    fn exactly_one_token_admits() {
        let (bucket, clock) = bucket(1, 1.0);
        assert_eq!(bucket.acquire(), Duration::ZERO);
        // Refill to exactly 1.0 token: 1000ms at 1 token/sec.
        clock.advance(1_000);
        assert_eq!(bucket.acquire(), Duration::ZERO);
    }

    #[test]
    fn fractional_token_waits() {
        let (bucket, clock) = bucket(1, 1.0);
        assert_eq!(bucket.acquire(), Duration::ZERO);
        // 999ms at 1 token/sec refills to 0.999 tokens.
        clock.advance(999);
        let wait = bucket.acquire();
        assert!(wait > Duration::ZERO);
        assert_eq!(wait, Duration::from_millis(1));
    }

    #[test]
    fn wait_estimate_is_ceiling_of_deficit() {
        let (bucket, _clock) = bucket(1, 1.0);
        assert_eq!(bucket.acquire(), Duration::ZERO);
        // Empty bucket, deficit 1.0 token at 0.001 tokens/ms -> 1000ms.
        assert_eq!(bucket.acquire(), Duration::from_millis(1_000));
    }

    #[test]
    fn refill_caps_at_max() {
        let (bucket, clock) = bucket(3, 10.0);
        clock.advance(60_000);
        assert_eq!(bucket.available_tokens(), 3);
    }

    #[test]
    fn available_tokens_floors() {
        let (bucket, clock) = bucket(1, 1.0);
        assert_eq!(bucket.acquire(), Duration::ZERO);
        clock.advance(500);
        assert_eq!(bucket.available_tokens(), 0);
        clock.advance(500);
        assert_eq!(bucket.available_tokens(), 1);
    }

    #[test]
    fn keyed_buckets_are_independent() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = RateLimiter::new(
            RateLimitConfig {
                capacity: 1,
                refill_per_sec: 1.0,
            },
            clock,
        );

        assert_eq!(limiter.acquire("client-a"), Duration::ZERO);
        assert!(limiter.acquire("client-a") > Duration::ZERO);
        // A different key has its own bucket.
        assert_eq!(limiter.acquire("client-b"), Duration::ZERO);
        assert_eq!(limiter.len(), 2);

        limiter.remove("client-a");
        assert_eq!(limiter.len(), 1);
    }

    #[tokio::test]
    async fn acquire_and_wait_sleeps_until_admitted() {
        let limiter = RateLimiter::new(
            RateLimitConfig {
                capacity: 1,
                refill_per_sec: 1_000.0,
            },
            Arc::new(crate::clock::SystemClock),
        );
        limiter.acquire_and_wait("k").await;
        // Bucket is now empty; refill at 1000 tokens/sec admits after ~1ms.
        limiter.acquire_and_wait("k").await;
    }
}
