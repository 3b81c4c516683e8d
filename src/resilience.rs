//! Resilience utilities: retry schedules, jitter, rate limiting, bulkheads.
//!
//! - [`RetryConfig`]: protocol-level retry schedule for proxy fetches
//! - [`jittered`]: randomized delay used by every endpoint timer
//! - [`RateLimiter`]: token bucket that throttles probe runs
//! - [`Bulkhead`]: semaphore bounding concurrent probe runs
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), mesh_replication::resilience::BulkheadFull> {
//! use mesh_replication::resilience::{Bulkhead, RateLimitConfig, RateLimiter};
//!
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! limiter.acquire().await;
//!
//! let bulkhead = Bulkhead::for_probe_runs(4);
//! let _permit = bulkhead.acquire().await?;
//! // permit dropped = slot released
//! # Ok(())
//! # }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use rand::Rng;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Retry schedule for operations that can fail at the protocol level.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts per fetch, the first one included.
    pub max_attempts: usize,

    /// Pause before the first retry.
    pub initial_delay: Duration,

    /// Upper bound on the pause between retries.
    pub max_delay: Duration,

    /// Growth of the pause per retry.
    pub backoff_factor: f64,

    /// How long one fetch attempt may wait for its response.
    pub connection_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 2,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_millis(500),
        }
    }

    /// Pause before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let multiplier = self.backoff_factor.powi((attempt - 1).min(i32::MAX as usize) as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs)
    }
}

/// Randomize `base` by `variation`: `((r - 0.5) * variation + 1) * base`.
///
/// With the default variation of 0.02 the result lies within ±1% of `base`.
/// Keeps many endpoints from firing in lockstep.
pub fn jittered(base: Duration, variation: f64) -> Duration {
    if variation <= 0.0 {
        return base;
    }
    let r: f64 = rand::thread_rng().gen();
    let factor = (r - 0.5) * variation + 1.0;
    base.mul_f64(factor.max(0.0))
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Probe-run throttle: `refill_rate` runs per second sustained, bursts of
/// up to `burst_size`.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub burst_size: u32,

    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst_size: 20,
            refill_rate: 10,
        }
    }
}

/// Token bucket rate limiter.
///
/// Prevents a thundering herd of probe runs when many shadows come due at
/// once (after startup, or when a shared external source recovers).
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        Self {
            limiter: GovLimiter::direct(quota),
            config,
        }
    }

    /// Wait for the next run slot. Cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").field("config", &self.config).finish()
    }
}

// =============================================================================
// Bulkhead (Concurrency Limiter)
// =============================================================================

/// The bulkhead was closed while waiting for a slot.
#[derive(Debug, Clone, thiserror::Error)]
#[error("bulkhead full: max {max_concurrent} concurrent operations")]
pub struct BulkheadFull {
    pub max_concurrent: usize,
}

/// Limits concurrent operations to a fixed number of slots.
///
/// The probe manager runs every scheduled probe through one of these, which
/// makes it the "small worker pool" for probe runs regardless of how many
/// shadows exist.
#[derive(Debug)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Bulkhead sized for the probe worker pool (at least one slot).
    pub fn for_probe_runs(max_concurrent_runs: usize) -> Self {
        Self::new(max_concurrent_runs.max(1))
    }

    /// Wait for a slot. Dropping the permit frees it.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadFull> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BulkheadFull {
                max_concurrent: self.max_concurrent,
            })
    }

    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Refuse all future acquisitions (used at shutdown).
    pub fn close(&self) {
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_for_attempt() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(5),
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(30));
        assert_eq!(config.delay_for_attempt(10_000), Duration::from_secs(30));
    }

    #[test]
    fn test_retry_testing_preset() {
        let config = RetryConfig::testing();
        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.connection_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_millis(1000);
        for _ in 0..1000 {
            let d = jittered(base, 0.02);
            assert!(d >= Duration::from_millis(990), "{:?}", d);
            assert!(d <= Duration::from_millis(1010), "{:?}", d);
        }
    }

    #[test]
    fn test_jitter_zero_variation_is_exact() {
        let base = Duration::from_millis(1234);
        assert_eq!(jittered(base, 0.0), base);
    }

    #[test]
    fn test_rate_limiter_try_acquire_burst() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 3,
            refill_rate: 1,
        });

        for _ in 0..3 {
            assert!(limiter.try_acquire(), "should acquire within burst");
        }
        assert!(!limiter.try_acquire(), "should fail after burst exhausted");
        assert_eq!(limiter.config().burst_size, 3);
    }

    #[test]
    fn test_bulkhead_try_acquire() {
        let bulkhead = Bulkhead::for_probe_runs(2);

        let p1 = bulkhead.try_acquire();
        assert!(p1.is_some());
        let p2 = bulkhead.try_acquire();
        assert!(p2.is_some());
        assert_eq!(bulkhead.available(), 0);
        assert!(bulkhead.try_acquire().is_none());

        drop(p1);
        assert_eq!(bulkhead.available(), 1);
        assert!(bulkhead.try_acquire().is_some());
    }

    #[test]
    fn test_bulkhead_for_probe_runs_minimum() {
        assert_eq!(Bulkhead::for_probe_runs(0).max_concurrent(), 1);
    }

    #[tokio::test]
    async fn test_bulkhead_closed_rejects() {
        let bulkhead = Bulkhead::new(1);
        bulkhead.close();
        let err = bulkhead.acquire().await.unwrap_err();
        assert_eq!(err.max_concurrent, 1);
        assert_eq!(err.to_string(), "bulkhead full: max 1 concurrent operations");
    }

    #[tokio::test]
    async fn test_bulkhead_acquire_waits() {
        let bulkhead = Arc::new(Bulkhead::new(1));
        let bulkhead2 = Arc::clone(&bulkhead);

        let permit = bulkhead.acquire().await.unwrap();
        let handle = tokio::spawn(async move {
            let start = std::time::Instant::now();
            let _p = bulkhead2.acquire().await.unwrap();
            start.elapsed()
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(permit);

        let wait_time = handle.await.unwrap();
        assert!(wait_time >= Duration::from_millis(40), "should have waited");
    }
}
