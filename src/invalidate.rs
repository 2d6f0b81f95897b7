use futures::future::join_all;
use tokio::time::Instant;

use crate::client::CacheClient;
use crate::error::CacheError;
use crate::lock::{corrupt_or_unexpected, unexpected};
use crate::script::{Script, status};
use crate::utils::duration_ms;

impl CacheClient {
    /// Mark `key` as deleted so the next fetch recomputes it.
    ///
    /// The entry is not removed: its version is bumped, any lease is cleared and it
    /// expires after `delay`, so concurrent readers keep serving the stale payload
    /// while one of them refreshes. A write-back from a lease taken before this call
    /// is discarded.
    ///
    /// With `wait_replicas > 0` this then waits for replica acknowledgement and fails
    /// with [`CacheError::ReplicationTimeout`] if too few replicas confirm in time.
    /// The invalidation itself has been applied on the primary either way.
    pub async fn tag_as_deleted(&self, key: &str) -> Result<(), CacheError> {
        if self.options.disable_cache_delete {
            tracing::debug!(key, "cache delete disabled, skipping invalidation");
            return Ok(());
        }
        self.tag(key).await?;
        self.wait_replicas(key).await
    }

    /// [`CacheClient::tag_as_deleted`] for several keys, with a single replica wait
    /// after all of them were tagged.
    ///
    /// Every key is tagged even when others fail. The replica wait covers the keys
    /// that were tagged; the first tag failure in `keys` order is returned ahead of
    /// a replication timeout.
    pub async fn tag_as_deleted_batch(&self, keys: &[&str]) -> Result<(), CacheError> {
        if self.options.disable_cache_delete || keys.is_empty() {
            return Ok(());
        }
        let results = join_all(keys.iter().map(|key| self.tag(key))).await;

        let mut tagged = Vec::with_capacity(keys.len());
        let mut first_failure = None;
        for (key, result) in keys.iter().zip(results) {
            match result {
                Ok(()) => tagged.push(*key),
                Err(err) => {
                    tracing::warn!(key, error = %err, "batch invalidation failed for key");
                    first_failure.get_or_insert(err);
                }
            }
        }

        let replicated = if tagged.is_empty() {
            Ok(())
        } else {
            self.wait_replicas(&tagged.join(",")).await
        };
        match first_failure {
            Some(err) => Err(err),
            None => replicated,
        }
    }

    async fn tag(&self, key: &str) -> Result<(), CacheError> {
        let delay_ms = duration_ms(self.options.delay).max(1);
        let reply = self
            .store
            .run_script(Script::TagAsDeleted, &[key], &[delay_ms.to_string()])
            .await?;

        match reply.as_slice() {
            [word, version] if word == status::TAGGED => {
                tracing::debug!(key, version = %version, "tagged as deleted");
                Ok(())
            }
            [word] if word == status::ABSENT => Ok(()),
            [word, _] if word == status::CORRUPT => {
                Err(corrupt_or_unexpected(key, Script::TagAsDeleted, &reply))
            }
            _ => Err(unexpected(key, Script::TagAsDeleted, &reply)),
        }
    }

    /// Poll replica acknowledgements until `wait_replicas` confirm or
    /// `wait_replicas_timeout` runs out. Each poll takes at least
    /// `replica_poll_interval`.
    async fn wait_replicas(&self, key: &str) -> Result<(), CacheError> {
        let requested = self.options.wait_replicas;
        if requested == 0 {
            return Ok(());
        }

        let deadline = Instant::now() + self.options.wait_replicas_timeout;
        let mut achieved = 0;
        loop {
            let now = Instant::now();
            let remaining = deadline.saturating_duration_since(now);
            if remaining.is_zero() {
                break;
            }
            let probe = self.options.replica_poll_interval.min(remaining);

            achieved = self.store.replica_ack_count(requested, probe).await?;
            if achieved >= requested {
                return Ok(());
            }
            tokio::time::sleep_until(now + probe).await;
        }

        tracing::warn!(key, requested, achieved, "replica wait timed out");
        Err(CacheError::ReplicationTimeout {
            key: key.to_string(),
            requested,
            achieved,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ClientOptions;
    use crate::store::Store;
    use crate::stores::memory::{HashMapStore, HashMapStoreConfig};
    use crate::stores::metrics::{CacheMetric, MetricsSink, MetricsStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const MINUTE: Duration = Duration::from_secs(60);

    #[derive(Default)]
    struct RecordingSink {
        metrics: Mutex<Vec<CacheMetric>>,
    }

    #[async_trait]
    impl MetricsSink for RecordingSink {
        fn emit(&self, metric: CacheMetric) {
            self.metrics.lock().unwrap().push(metric);
        }

        async fn flush(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Ok(())
        }
    }

    fn client_on(store: HashMapStore, options: ClientOptions) -> CacheClient {
        CacheClient::new(Arc::new(store), options).unwrap()
    }

    async fn counted_fetch(client: &CacheClient, calls: &Arc<AtomicUsize>) -> String {
        let calls = calls.clone();
        client
            .fetch("key1", MINUTE, move |_| async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok::<_, std::io::Error>(format!("v{n}"))
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_tag_then_fetch_recomputes_once() {
        for strong_consistency in [false, true] {
            let client = client_on(
                HashMapStore::default(),
                ClientOptions {
                    strong_consistency,
                    ..ClientOptions::default()
                },
            );
            let calls = Arc::new(AtomicUsize::new(0));

            assert_eq!(counted_fetch(&client, &calls).await, "v1");
            client.tag_as_deleted("key1").await.unwrap();
            assert_eq!(counted_fetch(&client, &calls).await, "v2");
            assert_eq!(counted_fetch(&client, &calls).await, "v2");
            assert_eq!(calls.load(Ordering::SeqCst), 2);

            // rewrites keep the version the invalidation gave the entry
            let entry = client.entry("key1").await.unwrap().unwrap();
            assert_eq!(entry.version, 1);
        }
    }

    #[tokio::test]
    async fn test_tag_absent_key_is_ok() {
        let client = client_on(HashMapStore::default(), ClientOptions::default());
        client.tag_as_deleted("missing").await.unwrap();
        assert_eq!(client.entry("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_tagged_entry_ages_out_after_delay() {
        let client = client_on(
            HashMapStore::default(),
            ClientOptions {
                delay: Duration::from_millis(30),
                ..ClientOptions::default()
            },
        );
        let calls = Arc::new(AtomicUsize::new(0));
        counted_fetch(&client, &calls).await;

        client.tag_as_deleted("key1").await.unwrap();
        assert_eq!(client.raw_get("key1").await.unwrap().as_deref(), Some("v1"));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(client.entry("key1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_tag_during_recompute_discards_write_back() {
        let client = client_on(HashMapStore::default(), ClientOptions::default());

        let slow = client.clone();
        let task = tokio::spawn(async move {
            slow.fetch("k", MINUTE, |_| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, std::io::Error>("before-update".to_string())
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        client.tag_as_deleted("k").await.unwrap();

        // the caller still gets its value, it is just never cached
        assert_eq!(task.await.unwrap().unwrap(), "before-update");
        assert_eq!(client.raw_get("k").await.unwrap(), None);

        let value = client
            .fetch("k", MINUTE, |_| async {
                Ok::<_, std::io::Error>("after-update".to_string())
            })
            .await
            .unwrap();
        assert_eq!(value, "after-update");
    }

    #[tokio::test]
    async fn test_wait_replicas_single_node_times_out() {
        let client = client_on(
            HashMapStore::default(),
            ClientOptions {
                wait_replicas: 1,
                wait_replicas_timeout: Duration::from_millis(20),
                ..ClientOptions::default()
            },
        );

        let err = client.tag_as_deleted("key1").await.unwrap_err();
        match err {
            CacheError::ReplicationTimeout {
                key,
                requested,
                achieved,
            } => {
                assert_eq!(key, "key1");
                assert_eq!(requested, 1);
                assert_eq!(achieved, 0);
            }
            other => panic!("expected replication timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wait_replicas_acknowledged() {
        let client = client_on(
            HashMapStore::new(HashMapStoreConfig { replicas: 1 }),
            ClientOptions {
                wait_replicas: 1,
                wait_replicas_timeout: Duration::from_millis(20),
                ..ClientOptions::default()
            },
        );
        client.tag_as_deleted("key1").await.unwrap();
    }

    #[tokio::test]
    async fn test_batch_tags_all_keys_with_one_replica_wait() {
        let sink = Arc::new(RecordingSink::default());
        let inner: Arc<dyn Store> = Arc::new(HashMapStore::new(HashMapStoreConfig { replicas: 2 }));
        let store = Arc::new(MetricsStore::new(inner, sink.clone()));
        let client = CacheClient::new(
            store,
            ClientOptions {
                wait_replicas: 2,
                ..ClientOptions::default()
            },
        )
        .unwrap();

        for key in ["a", "b"] {
            client
                .fetch(key, MINUTE, |k| async move { Ok::<_, std::io::Error>(k) })
                .await
                .unwrap();
        }
        sink.metrics.lock().unwrap().clear();

        client.tag_as_deleted_batch(&["a", "b"]).await.unwrap();

        let metrics = sink.metrics.lock().unwrap();
        let tags = metrics
            .iter()
            .filter(|m| matches!(m, CacheMetric::Script { script: "tag_as_deleted", .. }))
            .count();
        let probes = metrics
            .iter()
            .filter(|m| matches!(m, CacheMetric::ReplicaProbe { .. }))
            .count();
        assert_eq!(tags, 2);
        assert_eq!(probes, 1);
        drop(metrics);

        for key in ["a", "b"] {
            let entry = client.entry(key).await.unwrap().unwrap();
            assert_eq!(entry.version, 1);
            assert_eq!(entry.lock_until, Some(0));
        }
    }

    #[tokio::test]
    async fn test_disabled_delete_never_touches_store() {
        let sink = Arc::new(RecordingSink::default());
        let inner: Arc<dyn Store> = Arc::new(HashMapStore::default());
        let store = Arc::new(MetricsStore::new(inner, sink.clone()));
        let client = CacheClient::new(
            store,
            ClientOptions {
                disable_cache_delete: true,
                strong_consistency: true,
                wait_replicas: 3,
                ..ClientOptions::default()
            },
        )
        .unwrap();

        client.tag_as_deleted("key").await.unwrap();
        client.tag_as_deleted_batch(&["a", "b"]).await.unwrap();
        assert!(sink.metrics.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_tags_healthy_keys_past_a_corrupt_one() {
        let store = HashMapStore::new(HashMapStoreConfig { replicas: 1 });
        store.set("bad", "garbage", None).await.unwrap();
        let client = client_on(
            store,
            ClientOptions {
                wait_replicas: 1,
                ..ClientOptions::default()
            },
        );
        client
            .fetch("good", MINUTE, |_| async { Ok::<_, std::io::Error>("v1".to_string()) })
            .await
            .unwrap();

        let err = client
            .tag_as_deleted_batch(&["bad", "good"])
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Decode { ref key, .. } if key == "bad"));

        let good = client.entry("good").await.unwrap().unwrap();
        assert_eq!(good.version, 1);
        assert_eq!(good.lock_until, Some(0));
        assert_eq!(good.payload.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn test_tag_corrupt_entry_is_decode_error() {
        let store = HashMapStore::default();
        store.set("k", "[1,2]", None).await.unwrap();
        let client = client_on(store, ClientOptions::default());

        let err = client.tag_as_deleted("k").await.unwrap_err();
        assert!(matches!(err, CacheError::Decode { .. }));
    }
}
