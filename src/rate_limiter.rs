//! Token-bucket rate limiter keyed per destination.
//!
//! Each key owns a [`TokenBucket`] that refills lazily: tokens are added in
//! proportion to the time elapsed since the last access, capped at the bucket
//! capacity. There is no background refill task.
//!
//! ## Architecture
//!
//! ```text
//! +------------------+     +------------------+     +------------------+
//! |  acquire(key, n) | --> |  refill (lazy)   | --> |  take n or fail  |
//! +------------------+     +------------------+     +------------------+
//!          |
//!          v  (wait_for_tokens)
//! +------------------+
//! | sleep(deficit /  |
//! | rate, jittered)  |
//! +------------------+
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use agent_bus::rate_limiter::RateLimiter;
//! use std::time::Duration;
//!
//! let limiter = RateLimiter::new();
//! limiter.update_rate("renderer", 5.0, Some(10.0)).await;
//!
//! if limiter.wait_for_tokens("renderer", 2.0, Duration::from_secs(1)).await {
//!     // admitted
//! }
//! ```

use crate::constants::{DEFAULT_BUCKET_CAPACITY, DEFAULT_BUCKET_RATE, MIN_TOKEN_WAIT_MS};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, trace};

// =============================================================================
// RATE LIMIT CONFIGURATION
// =============================================================================

/// Defaults applied to buckets created on first use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Refill rate in tokens per second.
    #[serde(default = "default_rate")]
    pub default_rate: f64,

    /// Bucket capacity in tokens.
    #[serde(default = "default_capacity")]
    pub default_capacity: f64,

    /// Whether rate limiting is enabled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_rate() -> f64 {
    DEFAULT_BUCKET_RATE
}

fn default_capacity() -> f64 {
    DEFAULT_BUCKET_CAPACITY
}

fn default_enabled() -> bool {
    true
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_rate: default_rate(),
            default_capacity: default_capacity(),
            enabled: default_enabled(),
        }
    }
}

impl RateLimitConfig {
    /// A configuration that admits everything.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

// =============================================================================
// TOKEN BUCKET
// =============================================================================

/// A single lazily refilled bucket.
///
/// `tokens` stays within `[0, capacity]` after every operation.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(rate: f64, capacity: f64) -> Self {
        let capacity = capacity.max(0.0);
        Self {
            rate: rate.max(0.0),
            capacity,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    /// Add tokens for the time elapsed since the last refill.
    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let added = elapsed.as_secs_f64() * self.rate;
        self.tokens = (self.tokens + added).min(self.capacity);
        self.last_refill = now;
    }

    /// Refill then take `tokens` if enough are available.
    pub fn try_acquire(&mut self, tokens: f64, now: Instant) -> bool {
        self.refill(now);
        if tokens <= self.tokens {
            self.tokens = (self.tokens - tokens).max(0.0);
            true
        } else {
            false
        }
    }

    /// Time until `tokens` would be available, or `None` if never.
    pub fn time_until(&self, tokens: f64) -> Option<Duration> {
        if tokens > self.capacity {
            return None;
        }
        let deficit = tokens - self.tokens;
        if deficit <= 0.0 {
            return Some(Duration::ZERO);
        }
        if self.rate <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(deficit / self.rate))
    }

    /// Change rate and optionally capacity, clamping the current tokens.
    pub fn reconfigure(&mut self, rate: f64, capacity: Option<f64>, now: Instant) {
        self.refill(now);
        self.rate = rate.max(0.0);
        if let Some(capacity) = capacity {
            self.capacity = capacity.max(0.0);
        }
        self.tokens = self.tokens.clamp(0.0, self.capacity);
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }
}

/// Point-in-time view of a bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketSnapshot {
    pub key: String,
    pub rate: f64,
    pub capacity: f64,
    pub tokens: f64,
}

// =============================================================================
// RATE LIMITER
// =============================================================================

/// Per-key token buckets.
///
/// Cheap to clone; clones share the same buckets.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Arc<Mutex<HashMap<String, TokenBucket>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    /// Create a limiter with default configuration.
    pub fn new() -> Self {
        Self::with_config(RateLimitConfig::default())
    }

    /// Create a limiter with custom configuration.
    pub fn with_config(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    // =========================================================================
    // ADMISSION
    // =========================================================================

    /// Take `tokens` from `key`'s bucket without blocking.
    ///
    /// Creates the bucket with default settings on first use.
    pub async fn acquire(&self, key: &str, tokens: f64) -> bool {
        if !self.config.enabled {
            return true;
        }

        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(self.config.default_rate, self.config.default_capacity));
        let granted = bucket.try_acquire(tokens, Instant::now());
        trace!(
            key,
            tokens,
            remaining = bucket.tokens(),
            granted,
            "Token acquisition"
        );
        granted
    }

    /// Acquire `tokens`, sleeping between attempts, until `timeout` elapses.
    ///
    /// Each sleep is the refill time of the current deficit scaled by a
    /// jitter factor in `[0.9, 1.1)`, never shorter than 10ms and never past
    /// the deadline.
    pub async fn wait_for_tokens(&self, key: &str, tokens: f64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            if self.acquire(key, tokens).await {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(key, tokens, ?timeout, "Timed out waiting for tokens");
                return false;
            }
            let remaining = deadline - now;

            let wait = match self.time_until(key, tokens).await {
                Some(wait) => wait,
                None => {
                    debug!(key, tokens, "Token request can never be satisfied");
                    return false;
                }
            };
            let jittered = wait.mul_f64(rand::thread_rng().gen_range(0.9..1.1));
            let sleep_for = jittered
                .max(Duration::from_millis(MIN_TOKEN_WAIT_MS))
                .min(remaining);
            tokio::time::sleep(sleep_for).await;
        }
    }

    async fn time_until(&self, key: &str, tokens: f64) -> Option<Duration> {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.get_mut(key)?;
        bucket.refill(Instant::now());
        bucket.time_until(tokens)
    }

    // =========================================================================
    // BUCKET MANAGEMENT
    // =========================================================================

    /// Change `key`'s rate (and optionally capacity), creating the bucket if needed.
    pub async fn update_rate(&self, key: &str, rate: f64, capacity: Option<f64>) {
        let mut buckets = self.buckets.lock().await;
        match buckets.get_mut(key) {
            Some(bucket) => bucket.reconfigure(rate, capacity, Instant::now()),
            None => {
                let capacity = capacity.unwrap_or(self.config.default_capacity);
                buckets.insert(key.to_string(), TokenBucket::new(rate, capacity));
            }
        }
        debug!(key, rate, ?capacity, "Bucket rate updated");
    }

    /// Snapshot of `key`'s bucket after a refill.
    pub async fn get_bucket(&self, key: &str) -> Option<BucketSnapshot> {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.get_mut(key)?;
        bucket.refill(Instant::now());
        Some(BucketSnapshot {
            key: key.to_string(),
            rate: bucket.rate(),
            capacity: bucket.capacity(),
            tokens: bucket.tokens(),
        })
    }

    /// Tokens currently available on `key`.
    pub async fn available_tokens(&self, key: &str) -> Option<f64> {
        self.get_bucket(key).await.map(|b| b.tokens)
    }

    /// Capacity of `key`'s bucket, or the default capacity if it has none yet.
    pub async fn capacity_of(&self, key: &str) -> f64 {
        let buckets = self.buckets.lock().await;
        buckets
            .get(key)
            .map(|b| b.capacity())
            .unwrap_or(self.config.default_capacity)
    }

    /// Drop `key`'s bucket.
    pub async fn remove_bucket(&self, key: &str) -> bool {
        self.buckets.lock().await.remove(key).is_some()
    }

    pub async fn bucket_count(&self) -> usize {
        self.buckets.lock().await.len()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -------------------------------------------------------------------------
    // Token bucket
    // -------------------------------------------------------------------------

    #[test]
    fn test_bucket_starts_full() {
        let bucket = TokenBucket::new(1.0, 10.0);
        assert_eq!(bucket.tokens(), 10.0);
        assert_eq!(bucket.capacity(), 10.0);
    }

    #[test]
    fn test_bucket_refill_capped_at_capacity() {
        let mut bucket = TokenBucket::new(100.0, 5.0);
        let start = Instant::now();
        assert!(bucket.try_acquire(5.0, start));
        assert_eq!(bucket.tokens(), 0.0);

        bucket.refill(start + Duration::from_secs(60));
        assert_eq!(bucket.tokens(), 5.0);
    }

    #[test]
    fn test_bucket_lazy_refill_proportional() {
        let mut bucket = TokenBucket::new(2.0, 10.0);
        let start = Instant::now();
        assert!(bucket.try_acquire(10.0, start));
        bucket.refill(start + Duration::from_millis(1500));
        assert!((bucket.tokens() - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_bucket_tokens_stay_in_range() {
        let mut bucket = TokenBucket::new(3.0, 4.0);
        let mut now = Instant::now();
        let requests = [0.5, 4.0, 1.0, 3.5, 0.1, 2.0, 4.5, 0.0, 1.5];
        for (i, tokens) in requests.iter().cycle().take(200).enumerate() {
            now += Duration::from_millis((i as u64 * 37) % 400);
            let _ = bucket.try_acquire(*tokens, now);
            assert!(bucket.tokens() >= 0.0);
            assert!(bucket.tokens() <= bucket.capacity());
            if i % 50 == 0 {
                bucket.reconfigure(1.0 + i as f64 / 100.0, Some(2.0 + (i % 3) as f64), now);
                assert!(bucket.tokens() <= bucket.capacity());
            }
        }
    }

    #[test]
    fn test_bucket_time_until() {
        let mut bucket = TokenBucket::new(2.0, 4.0);
        let now = Instant::now();
        assert!(bucket.try_acquire(4.0, now));
        let wait = bucket.time_until(1.0).unwrap();
        assert!((wait.as_secs_f64() - 0.5).abs() < 0.01);
        assert!(bucket.time_until(5.0).is_none());

        let stalled = TokenBucket::new(0.0, 1.0);
        assert_eq!(stalled.time_until(1.0), Some(Duration::ZERO));
    }

    // -------------------------------------------------------------------------
    // Limiter
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_acquire_creates_default_bucket() {
        let limiter = RateLimiter::new();
        assert!(limiter.acquire("agent-a", 1.0).await);
        let snapshot = limiter.get_bucket("agent-a").await.unwrap();
        assert_eq!(snapshot.rate, DEFAULT_BUCKET_RATE);
        assert_eq!(snapshot.capacity, DEFAULT_BUCKET_CAPACITY);
        assert!(snapshot.tokens < DEFAULT_BUCKET_CAPACITY);
    }

    #[tokio::test]
    async fn test_acquire_fails_without_blocking() {
        let limiter = RateLimiter::new();
        limiter.update_rate("b", 0.001, Some(1.0)).await;
        assert!(limiter.acquire("b", 1.0).await);

        let started = Instant::now();
        assert!(!limiter.acquire("b", 1.0).await);
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_wait_for_tokens_succeeds_after_refill() {
        let limiter = RateLimiter::new();
        limiter.update_rate("b", 20.0, Some(1.0)).await;
        assert!(limiter.acquire("b", 1.0).await);

        let started = Instant::now();
        assert!(limiter.wait_for_tokens("b", 1.0, Duration::from_secs(2)).await);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_wait_for_tokens_times_out() {
        let limiter = RateLimiter::new();
        limiter.update_rate("b", 0.1, Some(1.0)).await;
        assert!(limiter.acquire("b", 1.0).await);

        let started = Instant::now();
        assert!(!limiter.wait_for_tokens("b", 1.0, Duration::from_millis(100)).await);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_wait_for_unsatisfiable_request_returns_immediately() {
        let limiter = RateLimiter::new();
        limiter.update_rate("b", 1.0, Some(1.0)).await;
        let started = Instant::now();
        assert!(!limiter.wait_for_tokens("b", 5.0, Duration::from_secs(5)).await);
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_critical_costs_fit_small_bucket() {
        let limiter = RateLimiter::new();
        limiter.update_rate("target_B", 1.0, Some(1.0)).await;
        assert!(limiter.acquire("target_B", 0.1).await);
        assert!(limiter.acquire("target_B", 0.1).await);
    }

    #[tokio::test]
    async fn test_update_rate_clamps_tokens() {
        let limiter = RateLimiter::new();
        limiter.update_rate("b", 5.0, Some(10.0)).await;
        limiter.update_rate("b", 1.0, Some(2.0)).await;
        let snapshot = limiter.get_bucket("b").await.unwrap();
        assert_eq!(snapshot.rate, 1.0);
        assert_eq!(snapshot.capacity, 2.0);
        assert!(snapshot.tokens <= 2.0);
    }

    #[tokio::test]
    async fn test_remove_bucket() {
        let limiter = RateLimiter::new();
        limiter.acquire("a", 1.0).await;
        limiter.acquire("b", 1.0).await;
        assert_eq!(limiter.bucket_count().await, 2);
        assert!(limiter.remove_bucket("a").await);
        assert!(!limiter.remove_bucket("a").await);
        assert_eq!(limiter.bucket_count().await, 1);
        assert!(limiter.get_bucket("a").await.is_none());
    }

    #[tokio::test]
    async fn test_disabled_limiter_admits_everything() {
        let limiter = RateLimiter::with_config(RateLimitConfig::disabled());
        for _ in 0..1000 {
            assert!(limiter.acquire("b", 50.0).await);
        }
        assert_eq!(limiter.bucket_count().await, 0);
    }

    #[tokio::test]
    async fn test_capacity_of() {
        let limiter = RateLimiter::new();
        assert_eq!(limiter.capacity_of("x").await, DEFAULT_BUCKET_CAPACITY);
        limiter.update_rate("x", 1.0, Some(3.0)).await;
        assert_eq!(limiter.capacity_of("x").await, 3.0);
    }

    #[test]
    fn test_config_serde_defaults() {
        let config: RateLimitConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.default_rate, DEFAULT_BUCKET_RATE);
        assert!(config.enabled);
    }
}
