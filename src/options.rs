//! Client configuration.

use std::time::{Duration, Instant};

use crate::error::CacheError;
use crate::utils::rand_unit;

/// Backoff used while another owner holds a key's lease.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
    /// Growth factor applied after each retry. Must be at least 1.
    pub multiplier: f64,
    /// Fraction of each delay that is randomized away, in `[0, 1]`.
    pub jitter: f64,
    /// Total time to keep retrying before giving up with `CacheError::LockWait`.
    ///
    /// `None` retries until the lease is free; leases expire on their own.
    pub max_wait: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.5,
            max_wait: Some(Duration::from_secs(10)),
        }
    }
}

impl RetryPolicy {
    pub(crate) fn backoff(&self) -> Backoff<'_> {
        Backoff {
            policy: self,
            next: self.initial_delay,
            started: Instant::now(),
        }
    }

    fn validate(&self) -> Result<(), CacheError> {
        if self.initial_delay.is_zero() {
            return Err(invalid("lock_retry.initial_delay must be greater than zero"));
        }
        if self.max_delay < self.initial_delay {
            return Err(invalid("lock_retry.max_delay must be >= lock_retry.initial_delay"));
        }
        if !(self.multiplier >= 1.0 && self.multiplier.is_finite()) {
            return Err(invalid("lock_retry.multiplier must be a finite number >= 1"));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(invalid("lock_retry.jitter must be within [0, 1]"));
        }
        Ok(())
    }
}

/// Jittered exponential delays for one fetch.
pub(crate) struct Backoff<'a> {
    policy: &'a RetryPolicy,
    next: Duration,
    started: Instant,
}

impl Backoff<'_> {
    /// Time spent waiting so far.
    pub(crate) fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// The next delay, or `None` once `max_wait` is spent.
    pub(crate) fn next_delay(&mut self) -> Option<Duration> {
        let mut delay = self
            .next
            .saturating_sub(self.next.mul_f64(self.policy.jitter * rand_unit()));
        if let Some(max_wait) = self.policy.max_wait {
            let remaining = max_wait.checked_sub(self.elapsed())?;
            if remaining.is_zero() {
                return None;
            }
            delay = delay.min(remaining);
        }
        self.next = self
            .next
            .mul_f64(self.policy.multiplier)
            .min(self.policy.max_delay);
        Some(delay.max(Duration::from_millis(1)))
    }
}

/// Options for [`crate::CacheClient`].
///
/// `ClientOptions::default()` is a sensible production configuration; adjust fields
/// with struct update syntax:
///
/// ```ignore
/// let options = ClientOptions {
///     strong_consistency: true,
///     empty_expire: Duration::ZERO,
///     ..ClientOptions::default()
/// };
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ClientOptions {
    /// How long an invalidated entry keeps its stale payload before it expires.
    pub delay: Duration,
    /// TTL for cached empty results. Zero disables negative caching.
    pub empty_expire: Duration,
    /// Lease duration for a recomputation.
    ///
    /// Should exceed the slowest expected recomputation; a write-back from an
    /// expired lease that was taken over is discarded.
    pub lock_expire: Duration,
    /// Backoff while another owner holds the lease.
    pub lock_retry: RetryPolicy,
    /// Replicas that must acknowledge an invalidation. Zero disables the wait.
    pub wait_replicas: u32,
    /// Upper bound for the replica wait.
    pub wait_replicas_timeout: Duration,
    /// Timeout of each individual replica probe within the wait.
    pub replica_poll_interval: Duration,
    /// Each write-back TTL is shortened by a random fraction in
    /// `[0, random_expire_adjustment)` to spread expirations. Must be in `[0, 1)`.
    pub random_expire_adjustment: f64,
    /// Bypass the cache entirely: every fetch runs the recomputation uncached.
    pub disable_cache_read: bool,
    /// Make invalidation a no-op.
    pub disable_cache_delete: bool,
    /// Never serve stale data while another owner refreshes; wait instead.
    pub strong_consistency: bool,
    /// Run the recomputation uncached when the lease cannot be taken because the
    /// store failed, instead of returning the store error.
    pub fallback_on_store_error: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            delay: Duration::from_secs(10),
            empty_expire: Duration::from_secs(60),
            lock_expire: Duration::from_secs(3),
            lock_retry: RetryPolicy::default(),
            wait_replicas: 0,
            wait_replicas_timeout: Duration::from_secs(3),
            replica_poll_interval: Duration::from_millis(10),
            random_expire_adjustment: 0.1,
            disable_cache_read: false,
            disable_cache_delete: false,
            strong_consistency: false,
            fallback_on_store_error: false,
        }
    }
}

impl ClientOptions {
    /// Check option combinations. Called by `CacheClient::new`.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.delay.is_zero() {
            return Err(invalid("delay must be greater than zero"));
        }
        if self.lock_expire < Duration::from_millis(1) {
            return Err(invalid("lock_expire must be at least 1ms"));
        }
        if !(0.0..1.0).contains(&self.random_expire_adjustment) {
            return Err(invalid("random_expire_adjustment must be within [0, 1)"));
        }
        if self.wait_replicas > 0 {
            if self.wait_replicas_timeout.is_zero() {
                return Err(invalid(
                    "wait_replicas_timeout must be greater than zero when wait_replicas is set",
                ));
            }
            if self.replica_poll_interval.is_zero() {
                return Err(invalid(
                    "replica_poll_interval must be greater than zero when wait_replicas is set",
                ));
            }
        }
        self.lock_retry.validate()
    }
}

fn invalid(message: &str) -> CacheError {
    CacheError::Configuration(message.to_string())
}
