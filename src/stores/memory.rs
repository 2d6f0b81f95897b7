use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::error::CacheError;
use crate::script::{self, Current, Mutation, Script};
use crate::store::Store;

use crate::utils::{duration_ms, now_ms};

/// Configuration for HashMapStore.
#[derive(Debug, Clone, Default)]
pub struct HashMapStoreConfig {
    /// Number of replicas reported as acknowledging every write.
    ///
    /// `0` behaves like a single-node deployment.
    pub replicas: u32,
}

/// Internal stored value with expiration time.
#[derive(Clone)]
struct StoredValue {
    /// Unix milli timestamp, `None` for no expiry.
    expires: Option<i64>,
    value: String,
}

impl StoredValue {
    fn is_live(&self, now: i64) -> bool {
        self.expires.is_none_or(|e| e > now)
    }
}

/// Thread-safe in-memory store using HashMap with RwLock.
///
/// Scripts run through [`script::emulate`] while holding the write lock, which makes
/// them atomic within one process. Suitable for tests and single-process use.
pub struct HashMapStore {
    state: RwLock<HashMap<String, StoredValue>>,
    replicas: u32,
}

impl HashMapStore {
    /// Create a new HashMapStore with the given configuration.
    pub fn new(config: HashMapStoreConfig) -> Self {
        HashMapStore {
            state: RwLock::new(HashMap::new()),
            replicas: config.replicas,
        }
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        let now = now_ms();
        let state = self.state.read().await;
        state.values().filter(|v| v.is_live(now)).count()
    }

    /// True when no live keys are stored.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for HashMapStore {
    fn default() -> Self {
        Self::new(HashMapStoreConfig::default())
    }
}

#[async_trait]
impl Store for HashMapStore {
    fn name(&self) -> &'static str {
        "hashmap"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let state = self.state.read().await;

        let Some(stored) = state.get(key) else {
            return Ok(None);
        };

        if !stored.is_live(now_ms()) {
            // Entry is expired, remove it
            drop(state);
            let mut state = self.state.write().await;
            if state.get(key).is_some_and(|s| !s.is_live(now_ms())) {
                state.remove(key);
            }
            return Ok(None);
        }

        Ok(Some(stored.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let expires = ttl.map(|t| now_ms().saturating_add(duration_ms(t)));
        let mut state = self.state.write().await;
        state.insert(
            key.to_string(),
            StoredValue {
                expires,
                value: value.to_string(),
            },
        );
        Ok(())
    }

    async fn remove(&self, keys: &[&str]) -> Result<(), CacheError> {
        let mut state = self.state.write().await;

        for key in keys {
            state.remove(*key);
        }

        Ok(())
    }

    async fn run_script(
        &self,
        script: Script,
        keys: &[&str],
        args: &[String],
    ) -> Result<Vec<String>, CacheError> {
        let [key] = keys else {
            return Err(CacheError::operation(
                "hashmap",
                keys.join(","),
                format!("{} expects exactly one key", script.name()),
            ));
        };

        let mut state = self.state.write().await;
        let now = now_ms();

        let current = state
            .get(*key)
            .filter(|s| s.is_live(now))
            .map(|s| Current {
                raw: s.value.as_str(),
                ttl_ms: s.expires.map(|e| e - now),
            });

        let outcome = script::emulate(script, current, args).map_err(|e| match e {
            CacheError::Operation { message, .. } => {
                CacheError::operation("hashmap", *key, message)
            }
            other => other,
        })?;

        match outcome.mutation {
            Mutation::Keep => {}
            Mutation::Put { value, ttl_ms } => {
                state.insert(
                    key.to_string(),
                    StoredValue {
                        expires: ttl_ms.map(|t| now + t),
                        value,
                    },
                );
            }
            Mutation::Delete => {
                state.remove(*key);
            }
        }

        Ok(outcome.reply)
    }

    async fn replica_ack_count(
        &self,
        _replicas: u32,
        _timeout: Duration,
    ) -> Result<u32, CacheError> {
        Ok(self.replicas)
    }
}
