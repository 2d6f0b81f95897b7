use async_trait::async_trait;
use std::time::Duration;

use crate::error::CacheError;
use crate::script::Script;

/// The capabilities the cache client needs from a key-value store.
///
/// Values are opaque strings; the client owns their encoding. All mutual exclusion
/// happens inside [`Store::run_script`], which must execute atomically with respect
/// to every other operation on the same key, across all processes sharing the store.
///
/// The store implementation is responsible for expiring keys on its own.
#[async_trait]
pub trait Store: Send + Sync {
    /// A name for metrics/tracing.
    ///
    /// # Example
    /// - "hashmap"
    /// - "redis"
    fn name(&self) -> &'static str;

    /// Return the raw value stored at `key`.
    ///
    /// The response must be `None` for missing or expired keys.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store `value` at `key`, expiring after `ttl` (`None` = no expiry).
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Removes the key(s) from the store.
    async fn remove(&self, keys: &[&str]) -> Result<(), CacheError>;

    /// Run `script` atomically against `keys` with `args` and return its reply.
    ///
    /// Stores without a Lua engine can delegate to [`crate::script::emulate`].
    async fn run_script(
        &self,
        script: Script,
        keys: &[&str],
        args: &[String],
    ) -> Result<Vec<String>, CacheError>;

    /// Best-effort count of replicas that have acknowledged this client's writes so
    /// far, waiting at most `timeout` for `replicas` of them.
    ///
    /// Single-node stores return 0.
    async fn replica_ack_count(&self, replicas: u32, timeout: Duration) -> Result<u32, CacheError>;
}
