//! Distributed single-flight leases on cache entries.
//!
//! A lease is an owner token plus a deadline written into the entry by
//! [`Script::AcquireOrRead`]. It is proven by token match on release, never by
//! process identity, and it expires on its own if the holder disappears.

use std::sync::Arc;
use std::time::Duration;

use crate::entry::Entry;
use crate::error::CacheError;
use crate::script::{Script, mode, status};
use crate::store::Store;
use crate::utils::{duration_ms, now_ms};

/// Outcome of [`LockCoordinator::acquire_or_read`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquire {
    /// A clean entry with a payload. No lease was taken.
    Hit(Entry),
    /// The caller now holds the lease.
    Acquired(Lease),
    /// Another owner holds a live lease. Carries the entry as it was, so the
    /// caller can serve its payload.
    LockedByOther(Entry),
}

/// A held lease on one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    pub owner: String,
    /// Entry version when the lease was taken; write-backs are fenced on it.
    pub version: u64,
    /// Payload present before the lease was taken.
    pub previous: Option<String>,
}

/// What to do with the entry when releasing a lease after a recomputation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Release {
    /// Store `payload` as a clean entry expiring after `expire`.
    Write { payload: String, expire: Duration },
    /// Remove the key so nothing is cached.
    Clear,
}

/// Outcome of [`LockCoordinator::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Written,
    Cleared,
    /// The lease was lost (taken over or invalidated); nothing was written.
    Discarded,
}

/// Runs lease transitions against a store.
#[derive(Clone)]
pub struct LockCoordinator {
    store: Arc<dyn Store>,
    lock_expire: Duration,
}

impl LockCoordinator {
    /// Create a coordinator handing out leases of `lock_expire`.
    pub fn new(store: Arc<dyn Store>, lock_expire: Duration) -> Self {
        LockCoordinator { store, lock_expire }
    }

    /// Read the entry at `key`, taking the lease for `owner` unless it is a clean
    /// hit or someone else's live lease. One atomic script round-trip.
    pub async fn acquire_or_read(&self, key: &str, owner: &str) -> Result<Acquire, CacheError> {
        self.acquire(key, owner, mode::READ).await
    }

    /// Take the lease for `owner` even over a clean entry, so that readers serve
    /// stale data or wait while the caller updates the source of truth.
    ///
    /// Re-entrant for the same owner. Returns `false` if another owner holds it.
    pub async fn lock_for_update(&self, key: &str, owner: &str) -> Result<bool, CacheError> {
        match self.acquire(key, owner, mode::UPDATE).await? {
            Acquire::Acquired(_) => Ok(true),
            _ => Ok(false),
        }
    }

    async fn acquire(&self, key: &str, owner: &str, mode: &str) -> Result<Acquire, CacheError> {
        let now = now_ms();
        let lock_ms = duration_ms(self.lock_expire).max(1);
        let args = [
            now.to_string(),
            now.saturating_add(lock_ms).to_string(),
            owner.to_string(),
            lock_ms.to_string(),
            mode.to_string(),
        ];
        let reply = self
            .store
            .run_script(Script::AcquireOrRead, &[key], &args)
            .await?;

        let (word, raw) = match reply.as_slice() {
            [word, raw] => (word.as_str(), raw.as_str()),
            _ => return Err(unexpected(key, Script::AcquireOrRead, &reply)),
        };
        let previous = if raw.is_empty() {
            None
        } else {
            Some(Entry::decode(key, raw)?)
        };

        match (word, previous) {
            (status::HIT, Some(entry)) => Ok(Acquire::Hit(entry)),
            (status::LOCKED, Some(entry)) => Ok(Acquire::LockedByOther(entry)),
            (status::ACQUIRED, previous) => {
                tracing::debug!(key, owner, "lease acquired");
                let (version, previous) = previous
                    .map(|e| (e.version, e.payload))
                    .unwrap_or((0, None));
                Ok(Acquire::Acquired(Lease {
                    key: key.to_string(),
                    owner: owner.to_string(),
                    version,
                    previous,
                }))
            }
            _ => Err(unexpected(key, Script::AcquireOrRead, &reply)),
        }
    }

    /// Finish a recomputation: write or clear the entry and drop the lease, only if
    /// `lease` is still held and the entry was not invalidated in the meantime.
    pub async fn release(
        &self,
        lease: &Lease,
        release: Release,
    ) -> Result<ReleaseOutcome, CacheError> {
        let (mode, payload, expire_ms) = match release {
            Release::Write { payload, expire } => (mode::SET, payload, duration_ms(expire).max(1)),
            Release::Clear => (mode::DELETE, String::new(), 0),
        };
        let args = [
            lease.owner.clone(),
            lease.version.to_string(),
            mode.to_string(),
            payload,
            expire_ms.to_string(),
        ];
        let reply = self
            .store
            .run_script(Script::Release, &[&lease.key], &args)
            .await?;

        match reply.first().map(String::as_str) {
            Some(status::WRITTEN) => Ok(ReleaseOutcome::Written),
            Some(status::DELETED) => Ok(ReleaseOutcome::Cleared),
            Some(status::DISCARDED) => {
                tracing::debug!(
                    key = %lease.key,
                    version = lease.version,
                    "write-back discarded: lease lost to a newer invalidation or owner"
                );
                Ok(ReleaseOutcome::Discarded)
            }
            _ => Err(corrupt_or_unexpected(&lease.key, Script::Release, &reply)),
        }
    }

    /// Drop `owner`'s lease without writing a payload. The entry keeps its previous
    /// payload and is marked for refresh. `ttl = None` keeps the current TTL.
    ///
    /// Returns `false` if `owner` no longer held the lease.
    pub async fn unlock(
        &self,
        key: &str,
        owner: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        let args = [
            owner.to_string(),
            ttl.map(|t| duration_ms(t).max(1)).unwrap_or(0).to_string(),
        ];
        let reply = self.store.run_script(Script::Unlock, &[key], &args).await?;

        match reply.first().map(String::as_str) {
            Some(status::UNLOCKED) => Ok(true),
            Some(status::DISCARDED) => Ok(false),
            _ => Err(corrupt_or_unexpected(key, Script::Unlock, &reply)),
        }
    }

    pub(crate) fn guard(&self, lease: &Lease) -> LeaseGuard {
        LeaseGuard {
            armed: Some((self.clone(), lease.key.clone(), lease.owner.clone())),
        }
    }
}

/// Releases a lease if the future holding it is dropped before the lease was
/// released explicitly (cancellation).
pub(crate) struct LeaseGuard {
    armed: Option<(LockCoordinator, String, String)>,
}

impl LeaseGuard {
    pub(crate) fn disarm(&mut self) {
        self.armed = None;
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let Some((coordinator, key, owner)) = self.armed.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(key, "lease dropped outside a runtime; it will expire on its own");
            return;
        };
        tracing::warn!(key, "fetch cancelled while holding a lease; releasing it");
        handle.spawn(async move {
            if let Err(e) = coordinator.unlock(&key, &owner, None).await {
                tracing::warn!(key, error = %e, "failed to release dropped lease");
            }
        });
    }
}

pub(crate) fn unexpected(key: &str, script: Script, reply: &[String]) -> CacheError {
    CacheError::operation(
        "script",
        key,
        format!("unexpected {} reply: {:?}", script.name(), reply),
    )
}

pub(crate) fn corrupt_or_unexpected(key: &str, script: Script, reply: &[String]) -> CacheError {
    match reply {
        [word, raw] if word == status::CORRUPT => match Entry::decode(key, raw) {
            Err(e) => e,
            Ok(_) => CacheError::decode(key, "entry rejected by the store script"),
        },
        _ => unexpected(key, script, reply),
    }
}
