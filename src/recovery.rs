//! Failure isolation and retry policy.
//!
//! This module provides:
//!
//! - **Circuit Breaker**: a per-conversation gate with CLOSED/OPEN/HALF_OPEN states
//! - **Circuit Breaker Table**: breakers keyed by `(source, target)`
//! - **Retry Policy**: exponential backoff with jitter for command retries
//!
//! # Architecture
//!
//! ```text
//!              threshold consecutive failures
//!   +--------+ ----------------------------> +------+
//!   | CLOSED |                               | OPEN |
//!   +--------+ <--+                          +------+
//!                 | N successes                 |  reset timeout elapsed
//!                 |                             v  (observed on next access)
//!              +-----------+   any failure   +-----------+
//!              | HALF_OPEN | --------------> |   OPEN    |
//!              +-----------+                 +-----------+
//! ```
//!
//! While HALF_OPEN only a share of traffic (default 80%) is admitted.
//!
//! # Example
//!
//! ```rust,ignore
//! use agent_bus::recovery::{CircuitBreakerTable, CircuitDecision};
//!
//! let table = CircuitBreakerTable::default();
//! match table.check("coordinator", "renderer").await {
//!     CircuitDecision::Allow => { /* deliver */ }
//!     CircuitDecision::RejectOpen { retry_after } => { /* tell the sender */ }
//!     CircuitDecision::RejectHalfOpen => { /* shed */ }
//! }
//! ```

use crate::constants::{
    DEFAULT_BASE_DELAY_MS, DEFAULT_FAILURE_THRESHOLD, DEFAULT_HALF_OPEN_ADMIT_RATIO,
    DEFAULT_HALF_OPEN_SUCCESSES, DEFAULT_MAX_DELAY_MS, DEFAULT_MAX_RETRIES,
    DEFAULT_RESET_TIMEOUT_SECS, DEFAULT_RETRY_JITTER,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

// =============================================================================
// CIRCUIT BREAKER
// =============================================================================

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected.
    Open,
    /// Probing whether the peer recovered.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Tunables shared by every breaker in a table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed circuit.
    pub failure_threshold: u32,
    /// Time an open circuit waits before probing.
    pub reset_timeout: Duration,
    /// Successes in half-open state that close the circuit.
    pub half_open_success_threshold: u32,
    /// Share of traffic admitted while half-open.
    pub half_open_admit_ratio: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout: Duration::from_secs(DEFAULT_RESET_TIMEOUT_SECS),
            half_open_success_threshold: DEFAULT_HALF_OPEN_SUCCESSES,
            half_open_admit_ratio: DEFAULT_HALF_OPEN_ADMIT_RATIO,
        }
    }
}

/// Outcome of asking a breaker whether a request may pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CircuitDecision {
    Allow,
    /// Open circuit; the caller may retry after `retry_after`.
    RejectOpen { retry_after: Duration },
    /// Half-open circuit shed this request.
    RejectHalfOpen,
}

impl CircuitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, CircuitDecision::Allow)
    }
}

/// Circuit breaker for one conversation.
///
/// OPEN becomes HALF_OPEN lazily: the transition is observed on the next
/// call to [`CircuitBreaker::state`] or [`CircuitBreaker::check`].
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failures: u32,
    successes: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            opened_at: None,
        }
    }

    /// Create a breaker with default settings.
    ///
    /// Defaults: 5 failures threshold, 30 second reset window.
    pub fn default_config() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    fn refresh(&mut self, now: Instant) {
        if self.state != CircuitState::Open {
            return;
        }
        if let Some(opened_at) = self.opened_at {
            if now.saturating_duration_since(opened_at) >= self.config.reset_timeout {
                self.state = CircuitState::HalfOpen;
                self.successes = 0;
                debug!("Circuit breaker: reset timeout elapsed, circuit half-open");
            }
        }
    }

    fn trip(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.successes = 0;
    }

    /// Current state, applying the OPEN to HALF_OPEN timeout.
    pub fn state(&mut self) -> CircuitState {
        self.refresh(Instant::now());
        self.state
    }

    /// Decide whether a request may pass. `sample` is a uniform value in `[0, 1)`.
    pub fn check(&mut self, sample: f64) -> CircuitDecision {
        let now = Instant::now();
        self.refresh(now);
        match self.state {
            CircuitState::Closed => CircuitDecision::Allow,
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|t| now.saturating_duration_since(t))
                    .unwrap_or_default();
                CircuitDecision::RejectOpen {
                    retry_after: self.config.reset_timeout.saturating_sub(elapsed),
                }
            }
            CircuitState::HalfOpen => {
                if sample < self.config.half_open_admit_ratio {
                    CircuitDecision::Allow
                } else {
                    CircuitDecision::RejectHalfOpen
                }
            }
        }
    }

    /// Whether a request would be admitted ignoring half-open shedding.
    pub fn allows_request(&mut self) -> bool {
        self.state() != CircuitState::Open
    }

    /// Record a successful exchange.
    pub fn record_success(&mut self) {
        self.refresh(Instant::now());
        match self.state {
            CircuitState::Closed => self.failures = 0,
            CircuitState::HalfOpen => {
                self.successes += 1;
                if self.successes >= self.config.half_open_success_threshold {
                    self.state = CircuitState::Closed;
                    self.failures = 0;
                    self.successes = 0;
                    self.opened_at = None;
                    info!("Circuit breaker: recovered, circuit closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed exchange.
    pub fn record_failure(&mut self) {
        let now = Instant::now();
        self.refresh(now);
        self.failures = self.failures.saturating_add(1);
        match self.state {
            CircuitState::Closed => {
                if self.failures >= self.config.failure_threshold {
                    self.trip(now);
                    warn!("Circuit breaker: {} failures, circuit opened", self.failures);
                } else {
                    debug!(
                        "Circuit breaker: failure recorded ({}/{})",
                        self.failures, self.config.failure_threshold
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.trip(now);
                warn!("Circuit breaker: failure while half-open, circuit reopened");
            }
            CircuitState::Open => {}
        }
    }

    /// Get the current consecutive failure count.
    pub fn failure_count(&self) -> u32 {
        self.failures
    }

    /// Get the half-open success count.
    pub fn success_count(&self) -> u32 {
        self.successes
    }

    /// Reset to the initial closed state.
    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.failures = 0;
        self.successes = 0;
        self.opened_at = None;
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::default_config()
    }
}

// =============================================================================
// CIRCUIT BREAKER TABLE
// =============================================================================

/// Serializable view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub source: String,
    pub target: String,
    pub state: CircuitState,
    pub failures: u32,
    pub successes: u32,
}

/// Circuit breakers keyed by `(source, target)`.
///
/// Cheap to clone; clones share the same breakers.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerTable {
    config: CircuitBreakerConfig,
    breakers: Arc<Mutex<HashMap<(String, String), CircuitBreaker>>>,
}

impl CircuitBreakerTable {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn key(source: &str, target: &str) -> (String, String) {
        (source.to_string(), target.to_string())
    }

    /// Decide whether `source` may send to `target`.
    pub async fn check(&self, source: &str, target: &str) -> CircuitDecision {
        let mut breakers = self.breakers.lock().await;
        match breakers.get_mut(&Self::key(source, target)) {
            Some(breaker) => breaker.check(rand::thread_rng().gen()),
            None => CircuitDecision::Allow,
        }
    }

    pub async fn record_failure(&self, source: &str, target: &str) {
        let config = self.config;
        let mut breakers = self.breakers.lock().await;
        breakers
            .entry(Self::key(source, target))
            .or_insert_with(|| CircuitBreaker::new(config))
            .record_failure();
    }

    pub async fn record_success(&self, source: &str, target: &str) {
        let mut breakers = self.breakers.lock().await;
        if let Some(breaker) = breakers.get_mut(&Self::key(source, target)) {
            breaker.record_success();
        }
    }

    /// State of the pair; pairs never seen are closed.
    pub async fn state_of(&self, source: &str, target: &str) -> CircuitState {
        let mut breakers = self.breakers.lock().await;
        breakers
            .get_mut(&Self::key(source, target))
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    pub async fn reset(&self, source: &str, target: &str) -> bool {
        let mut breakers = self.breakers.lock().await;
        match breakers.get_mut(&Self::key(source, target)) {
            Some(breaker) => {
                breaker.reset();
                info!(source, target, "Circuit breaker reset");
                true
            }
            None => false,
        }
    }

    pub async fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut breakers = self.breakers.lock().await;
        let mut out: Vec<_> = breakers
            .iter_mut()
            .map(|((source, target), breaker)| BreakerSnapshot {
                source: source.clone(),
                target: target.clone(),
                state: breaker.state(),
                failures: breaker.failure_count(),
                successes: breaker.success_count(),
            })
            .collect();
        out.sort_by(|a, b| (&a.source, &a.target).cmp(&(&b.source, &b.target)));
        out
    }
}

// =============================================================================
// RETRY UTILITIES
// =============================================================================

/// Backoff policy for command retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Upper bound on any single delay.
    pub max_delay_ms: u64,
    /// Symmetric jitter as a fraction of the delay.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter: DEFAULT_RETRY_JITTER,
        }
    }
}

impl RetryConfig {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Delay before the retry following `attempt` (0-based), without jitter.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2f64.powi(attempt.min(32) as i32);
        let delay_ms = (self.base_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_secs_f64(delay_ms / 1000.0)
    }

    /// `min(base * 2^attempt, max_delay)` jittered by `±jitter`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for_attempt(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = 1.0 + jitter * rand::thread_rng().gen_range(-1.0..=1.0);
        base.mul_f64(factor.max(0.0))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config(threshold: u32, reset_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            reset_timeout: Duration::from_millis(reset_ms),
            ..Default::default()
        }
    }

    // ==========================================================================
    // Circuit Breaker Tests
    // ==========================================================================

    #[test]
    fn test_circuit_breaker_initial_state() {
        let mut breaker = CircuitBreaker::default();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allows_request());
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn test_circuit_breaker_opens_after_threshold() {
        let mut breaker = CircuitBreaker::new(fast_config(5, 10_000));
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allows_request());
        match breaker.check(0.0) {
            CircuitDecision::RejectOpen { retry_after } => {
                assert!(retry_after <= Duration::from_secs(10))
            }
            other => panic!("expected open rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_circuit_breaker_success_resets_consecutive_count() {
        let mut breaker = CircuitBreaker::new(fast_config(3, 10_000));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.failure_count(), 0);
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_circuit_breaker_half_open_after_timeout() {
        let mut breaker = CircuitBreaker::new(fast_config(2, 50));
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_half_open_closes_after_three_successes() {
        let mut breaker = CircuitBreaker::new(fast_config(1, 20));
        breaker.record_failure();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let mut breaker = CircuitBreaker::new(fast_config(1, 20));
        breaker.record_failure();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_half_open_admission_ratio() {
        let mut breaker = CircuitBreaker::new(fast_config(1, 10));
        breaker.record_failure();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(breaker.check(0.79), CircuitDecision::Allow);
        assert_eq!(breaker.check(0.8), CircuitDecision::RejectHalfOpen);

        let admitted = (0..1000)
            .filter(|_| breaker.check(rand::thread_rng().gen()).is_allowed())
            .count();
        assert!((700..=900).contains(&admitted), "admitted {}", admitted);
    }

    #[test]
    fn test_circuit_breaker_reset() {
        let mut breaker = CircuitBreaker::new(fast_config(1, 10_000));
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allows_request());
    }

    #[test]
    fn test_circuit_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half-open");
    }

    // ==========================================================================
    // Table Tests
    // ==========================================================================

    #[tokio::test]
    async fn test_table_isolates_pairs() {
        let table = CircuitBreakerTable::new(fast_config(2, 10_000));
        table.record_failure("a", "b").await;
        table.record_failure("a", "b").await;

        assert_eq!(table.state_of("a", "b").await, CircuitState::Open);
        assert_eq!(table.state_of("b", "a").await, CircuitState::Closed);
        assert_eq!(table.state_of("a", "c").await, CircuitState::Closed);
        assert!(!table.check("a", "b").await.is_allowed());
        assert!(table.check("a", "c").await.is_allowed());
    }

    #[tokio::test]
    async fn test_table_success_without_breaker_is_noop() {
        let table = CircuitBreakerTable::default();
        table.record_success("a", "b").await;
        assert!(table.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_table_reset_and_snapshot() {
        let table = CircuitBreakerTable::new(fast_config(1, 10_000));
        table.record_failure("x", "y").await;
        let snapshot = table.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].state, CircuitState::Open);

        assert!(table.reset("x", "y").await);
        assert!(!table.reset("y", "x").await);
        assert_eq!(table.state_of("x", "y").await, CircuitState::Closed);
    }

    // ==========================================================================
    // Retry Tests
    // ==========================================================================

    #[test]
    fn test_retry_config_delay_calculation() {
        let config = RetryConfig {
            max_retries: 5,
            base_delay_ms: 200,
            max_delay_ms: 1_000,
            jitter: 0.0,
        };
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(400));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(800));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(1_000));
        assert_eq!(config.delay_for_attempt(40), Duration::from_millis(1_000));
    }

    #[test]
    fn test_retry_jitter_bounds() {
        let config = RetryConfig::default();
        for _ in 0..200 {
            let delay = config.delay_for_attempt(1).as_secs_f64();
            assert!((0.36 - 1e-9..=0.44 + 1e-9).contains(&delay), "delay {}", delay);
        }
    }
}
