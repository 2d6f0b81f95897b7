use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use crate::client::CacheClient;
use crate::error::{BoxError, CacheError};
use crate::lock::{Acquire, Lease, LeaseGuard, Release};
use crate::utils::{jittered_expire, new_owner_token, panic_message};

/// Where the lease loop ended up.
enum Step {
    /// A payload that can be served without recomputing.
    Cached(String),
    /// The caller holds the lease and must recompute.
    Leased(Lease),
}

impl CacheClient {
    /// Return the cached value for `key`, recomputing it under a distributed lease
    /// on a miss.
    ///
    /// At most one caller across all processes runs `recompute` for a key at a time.
    /// An empty string is a legitimate (negative) result and is cached for
    /// `empty_expire`. An `expire` of zero disables caching for this call.
    ///
    /// # Example
    /// ```ignore
    /// let user = client.fetch("user:123", Duration::from_secs(60), |key| async move {
    ///     db.load_user_json(&key).await
    /// }).await?;
    /// ```
    pub async fn fetch<F, Fut, E>(
        &self,
        key: &str,
        expire: Duration,
        recompute: F,
    ) -> Result<String, CacheError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<String, E>>,
        E: Into<BoxError>,
    {
        self.fetch_when(key, expire, recompute, |_| true).await
    }

    /// Like [`CacheClient::fetch`], but only caches recomputed values accepted by
    /// `should_cache`. Rejected values are returned uncached and the entry keeps
    /// its previous payload, marked for refresh.
    pub async fn fetch_when<F, Fut, E, P>(
        &self,
        key: &str,
        expire: Duration,
        recompute: F,
        should_cache: P,
    ) -> Result<String, CacheError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<String, E>>,
        E: Into<BoxError>,
        P: FnOnce(&str) -> bool,
    {
        if self.options.disable_cache_read {
            tracing::debug!(key, "cache read disabled, recomputing uncached");
            return run_recompute(key, recompute).await;
        }

        let owner = new_owner_token();
        let lease = match self.lease_or_payload(key, &owner).await {
            Ok(Step::Cached(payload)) => return Ok(payload),
            Ok(Step::Leased(lease)) => lease,
            Err(e @ CacheError::Operation { .. }) if self.options.fallback_on_store_error => {
                tracing::warn!(key, error = %e, "store unavailable, recomputing uncached");
                return run_recompute(key, recompute).await;
            }
            Err(e) => return Err(e),
        };

        let mut guard = self.lock.guard(&lease);
        let value = match run_recompute(key, recompute).await {
            Ok(value) if should_cache(&value) => value,
            Ok(value) => {
                tracing::debug!(key, "recomputed value rejected, not caching");
                self.abandon(&lease, &mut guard).await;
                return Ok(value);
            }
            Err(e) => {
                self.abandon(&lease, &mut guard).await;
                return Err(e);
            }
        };

        // a failed release leaves the guard armed so the lease is still dropped
        self.lock
            .release(&lease, self.write_back(&value, expire))
            .await?;
        guard.disarm();
        Ok(value)
    }

    /// Read the entry, taking the lease when nobody else holds it. Waits with
    /// backoff while another owner holds it and there is nothing to serve.
    async fn lease_or_payload(&self, key: &str, owner: &str) -> Result<Step, CacheError> {
        let mut backoff = self.options.lock_retry.backoff();
        loop {
            let entry = match self.lock.acquire_or_read(key, owner).await? {
                Acquire::Hit(entry) => return Ok(Step::Cached(entry.payload.unwrap_or_default())),
                Acquire::Acquired(lease) => return Ok(Step::Leased(lease)),
                Acquire::LockedByOther(entry) => entry,
            };

            if !self.options.strong_consistency
                && let Some(payload) = entry.payload
            {
                tracing::debug!(key, "lease held elsewhere, serving stale payload");
                return Ok(Step::Cached(payload));
            }

            let Some(delay) = backoff.next_delay() else {
                return Err(CacheError::LockWait {
                    key: key.to_string(),
                    waited_ms: u64::try_from(backoff.elapsed().as_millis()).unwrap_or(u64::MAX),
                });
            };
            tokio::time::sleep(delay).await;
        }
    }

    /// How to store a freshly recomputed value.
    fn write_back(&self, value: &str, expire: Duration) -> Release {
        if expire.is_zero() {
            return Release::Clear;
        }
        if value.is_empty() {
            if self.options.empty_expire.is_zero() {
                return Release::Clear;
            }
            return Release::Write {
                payload: String::new(),
                expire: self.options.empty_expire,
            };
        }
        Release::Write {
            payload: value.to_string(),
            expire: jittered_expire(expire, self.options.random_expire_adjustment),
        }
    }

    /// Drop the lease without writing, keeping the previous payload.
    async fn abandon(&self, lease: &Lease, guard: &mut LeaseGuard) {
        match self.lock.unlock(&lease.key, &lease.owner, None).await {
            Ok(_) => guard.disarm(),
            Err(e) => tracing::warn!(key = %lease.key, error = %e, "failed to release lease"),
        }
    }
}

/// Run the caller's function, turning its error or panic into a [`CacheError`].
pub(crate) async fn run_recompute<F, Fut, E>(key: &str, recompute: F) -> Result<String, CacheError>
where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = Result<String, E>>,
    E: Into<BoxError>,
{
    let owned = key.to_string();
    match AssertUnwindSafe(async move { recompute(owned).await })
        .catch_unwind()
        .await
    {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(CacheError::recompute(e)),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::warn!(key, panic = %message, "recompute panicked");
            Err(CacheError::RecomputePanic {
                key: key.to_string(),
                message,
            })
        }
    }
}
