use serde::{Serialize, de::DeserializeOwned};
use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

use crate::client::CacheClient;
use crate::error::{BoxError, CacheError};
use crate::utils::build_cache_key;

/// Typed cache-aside API over a [`CacheClient`].
///
/// Values are stored as JSON. Each cache is isolated by a namespace string, so
/// several `TypedCache<V>` with different value types can share one client.
pub struct TypedCache<V> {
    namespace: String,
    client: CacheClient,
    _value: PhantomData<fn() -> V>,
}

impl<V> Clone for TypedCache<V> {
    fn clone(&self) -> Self {
        TypedCache {
            namespace: self.namespace.clone(),
            client: self.client.clone(),
            _value: PhantomData,
        }
    }
}

impl<V> TypedCache<V>
where
    V: Serialize + DeserializeOwned,
{
    /// Create a typed cache storing its keys under `namespace`.
    ///
    /// # Example
    /// ```ignore
    /// let users: TypedCache<User> = TypedCache::new("users", client.clone());
    /// let sessions: TypedCache<Session> = TypedCache::new("sessions", client);
    /// ```
    pub fn new(namespace: &str, client: CacheClient) -> Self {
        TypedCache {
            namespace: namespace.to_string(),
            client,
            _value: PhantomData,
        }
    }

    pub fn client(&self) -> &CacheClient {
        &self.client
    }

    /// Get the cached value or load it, under the client's single-flight lease.
    ///
    /// `load` receives the key without the namespace prefix.
    pub async fn fetch<F, Fut, E>(&self, key: &str, expire: Duration, load: F) -> Result<V, CacheError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: Into<BoxError>,
    {
        self.fetch_when(key, expire, load, |_| true).await
    }

    /// Like [`TypedCache::fetch`], caching only values accepted by `when`.
    pub async fn fetch_when<F, Fut, E, W>(
        &self,
        key: &str,
        expire: Duration,
        load: F,
        when: W,
    ) -> Result<V, CacheError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: Into<BoxError>,
        W: FnOnce(&V) -> bool,
    {
        let user_key = key.to_string();
        let recompute = move |_: String| async move {
            let value = load(user_key).await.map_err(Into::<BoxError>::into)?;
            serde_json::to_string(&value).map_err(|e| -> BoxError {
                Box::new(CacheError::Serialization(format!("Serialization failed: {}", e)))
            })
        };
        // undecodable payloads are never cached
        let should_cache =
            |raw: &str| serde_json::from_str::<V>(raw).is_ok_and(|value| when(&value));

        let raw = self
            .client
            .fetch_when(&self.cache_key(key), expire, recompute, should_cache)
            .await
            .map_err(unwrap_serialization)?;
        decode(&raw)
    }

    /// Return the cached value, ignoring lease state. `None` for misses.
    pub async fn get(&self, key: &str) -> Result<Option<V>, CacheError> {
        match self.client.raw_get(&self.cache_key(key)).await? {
            Some(raw) if !raw.is_empty() => decode(&raw).map(Some),
            _ => Ok(None),
        }
    }

    /// Mark the value as deleted; see [`CacheClient::tag_as_deleted`].
    pub async fn tag_as_deleted(&self, key: &str) -> Result<(), CacheError> {
        self.client.tag_as_deleted(&self.cache_key(key)).await
    }

    fn cache_key(&self, key: &str) -> String {
        build_cache_key(&self.namespace, key)
    }
}

fn decode<V: DeserializeOwned>(raw: &str) -> Result<V, CacheError> {
    serde_json::from_str(raw)
        .map_err(|e| CacheError::Serialization(format!("Deserialization failed: {}", e)))
}

/// Our own serialization failure inside the recomputation is not a caller error.
fn unwrap_serialization(err: CacheError) -> CacheError {
    match err.downcast_recompute::<CacheError>() {
        Some(inner @ CacheError::Serialization(_)) => inner.clone(),
        _ => err,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ClientOptions;
    use crate::stores::memory::HashMapStore;
    use serde::Deserialize;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct User {
        id: u64,
        name: String,
    }

    const MINUTE: Duration = Duration::from_secs(60);

    fn client() -> CacheClient {
        CacheClient::new(Arc::new(HashMapStore::default()), ClientOptions::default()).unwrap()
    }

    #[tokio::test]
    async fn test_typed_fetch_and_get() {
        let users: TypedCache<User> = TypedCache::new("users", client());
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            let user = users
                .fetch("1", MINUTE, move |key| async move {
                    // Verify we receive the key without the namespace
                    assert_eq!(key, "1");
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, std::io::Error>(User {
                        id: 1,
                        name: "Alice".into(),
                    })
                })
                .await
                .unwrap();
            assert_eq!(user.name, "Alice");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let cached = users.get("1").await.unwrap();
        assert_eq!(cached.map(|u| u.id), Some(1));
        assert_eq!(users.get("2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let client = client();
        let users: TypedCache<String> = TypedCache::new("users", client.clone());
        let sessions: TypedCache<String> = TypedCache::new("sessions", client.clone());

        users
            .fetch("1", MINUTE, |_| async { Ok::<_, std::io::Error>("Bob".to_string()) })
            .await
            .unwrap();

        assert_eq!(users.get("1").await.unwrap().as_deref(), Some("Bob"));
        assert_eq!(sessions.get("1").await.unwrap(), None);
        assert_eq!(
            client.raw_get("users::1").await.unwrap().as_deref(),
            Some("\"Bob\"")
        );
    }

    #[tokio::test]
    async fn test_when_sees_typed_value() {
        let users: TypedCache<Option<User>> = TypedCache::new("users", client());

        let missing = users
            .fetch_when(
                "404",
                MINUTE,
                |_| async { Ok::<_, std::io::Error>(None) },
                |user| user.is_some(),
            )
            .await
            .unwrap();
        assert_eq!(missing, None);
        assert_eq!(users.get("404").await.unwrap(), None);

        users.tag_as_deleted("404").await.unwrap();
        let found = users
            .fetch_when(
                "404",
                MINUTE,
                |_| async {
                    Ok::<_, std::io::Error>(Some(User {
                        id: 404,
                        name: "Late".into(),
                    }))
                },
                |user| user.is_some(),
            )
            .await
            .unwrap();
        assert_eq!(found.map(|u| u.id), Some(404));
    }

    #[tokio::test]
    async fn test_serialization_failure_is_not_a_recompute_error() {
        // JSON object keys must be strings
        let cache: TypedCache<BTreeMap<Vec<u8>, u8>> = TypedCache::new("bytes", client());

        let err = cache
            .fetch("k", MINUTE, |_| async {
                Ok::<_, std::io::Error>(BTreeMap::from([(vec![1u8], 1u8)]))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Serialization(_)));
        assert!(!err.is_recompute());
    }

    #[tokio::test]
    async fn test_load_error_passes_through() {
        let users: TypedCache<User> = TypedCache::new("users", client());

        let err = users
            .fetch("1", MINUTE, |_| async {
                Err::<User, _>(std::io::Error::new(std::io::ErrorKind::NotFound, "no such user"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no such user");
        assert!(err.downcast_recompute::<std::io::Error>().is_some());
    }
}
