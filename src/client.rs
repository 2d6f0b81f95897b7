use std::sync::Arc;
use std::time::Duration;

use crate::entry::Entry;
use crate::error::CacheError;
use crate::lock::LockCoordinator;
use crate::options::ClientOptions;
use crate::store::Store;

/// Cache-aside client with distributed single-flight recomputation.
///
/// Cheap to clone; clones share the store connection and options. Fetching lives
/// in `fetch.rs`, invalidation in `invalidate.rs`, fan-out in `batch.rs`.
#[derive(Clone)]
pub struct CacheClient {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) lock: LockCoordinator,
    pub(crate) options: Arc<ClientOptions>,
}

impl CacheClient {
    /// Create a client over `store`.
    ///
    /// Fails with [`CacheError::Configuration`] if `options` do not validate.
    ///
    /// # Example
    /// ```ignore
    /// let store = Arc::new(RedisStore::new(RedisStoreConfig::default()).await?);
    /// let client = CacheClient::new(store, ClientOptions::default())?;
    /// ```
    pub fn new(store: Arc<dyn Store>, options: ClientOptions) -> Result<Self, CacheError> {
        options.validate()?;
        let lock = LockCoordinator::new(store.clone(), options.lock_expire);
        Ok(CacheClient {
            store,
            lock,
            options: Arc::new(options),
        })
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// The lease coordinator this client runs on.
    pub fn lock(&self) -> &LockCoordinator {
        &self.lock
    }

    /// The decoded entry at `key`, including lease state. `None` when absent.
    pub async fn entry(&self, key: &str) -> Result<Option<Entry>, CacheError> {
        match self.store.get(key).await? {
            Some(raw) => Entry::decode(key, &raw).map(Some),
            None => Ok(None),
        }
    }

    /// The cached payload at `key`, ignoring lease state.
    ///
    /// Returns `None` when the key is absent or holds only a lease placeholder.
    pub async fn raw_get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.entry(key).await?.and_then(|e| e.payload))
    }

    /// Overwrite `key` with a clean entry holding `payload`, bypassing leases.
    ///
    /// The entry keeps the stored version so later invalidations still count up;
    /// a value that does not decode is replaced as version 0. Any lease on the key
    /// is dropped, so its holder's write-back is discarded. `expire` zero removes
    /// the key. Not atomic with concurrent scripts on the same key.
    pub async fn raw_set(&self, key: &str, payload: &str, expire: Duration) -> Result<(), CacheError> {
        if expire.is_zero() {
            return self.store.remove(&[key]).await;
        }
        let version = match self.entry(key).await {
            Ok(current) => current.map_or(0, |e| e.version),
            Err(CacheError::Decode { message, .. }) => {
                tracing::warn!(key, error = %message, "overwriting undecodable entry");
                0
            }
            Err(e) => return Err(e),
        };
        let encoded = Entry::new(payload, version).encode()?;
        self.store.set(key, &encoded, Some(expire)).await
    }

    /// Take the lease on `key` for `owner` before updating the source of truth.
    ///
    /// While held, readers serve the stale payload (or wait, in strong mode) and
    /// never recompute. Re-entrant for the same owner. Returns `false` if another
    /// owner holds the lease.
    pub async fn lock_for_update(&self, key: &str, owner: &str) -> Result<bool, CacheError> {
        self.lock.lock_for_update(key, owner).await
    }

    /// Release a lease taken with [`CacheClient::lock_for_update`].
    ///
    /// The entry keeps its payload, is marked for refresh and expires after
    /// `lock_expire`. Returns `false` if `owner` no longer held the lease.
    pub async fn unlock_for_update(&self, key: &str, owner: &str) -> Result<bool, CacheError> {
        self.lock
            .unlock(key, owner, Some(self.options.lock_expire))
            .await
    }
}
