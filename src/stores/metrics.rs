//! Metrics middleware for stores.
//!
//! This module provides a `MetricsStore` wrapper that emits metrics for all
//! store operations (reads, writes, removes, scripts, replica probes) to a
//! user-provided sink.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use lease_cache::{CacheClient, ClientOptions, RedisStore, RedisStoreConfig, Store};
//! use lease_cache::{CacheMetric, MetricsSink, MetricsStore};
//!
//! // Create metrics sink
//! let sink = Arc::new(MyMetricsSink::new());
//!
//! // Wrap store with metrics
//! let redis = Arc::new(RedisStore::new(RedisStoreConfig::default()).await?);
//! let store: Arc<dyn Store> = Arc::new(MetricsStore::new(redis, sink.clone()));
//!
//! // Use in a client - metrics emitted automatically
//! let client = CacheClient::new(store, ClientOptions::default())?;
//! ```

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::CacheError;
use crate::script::Script;
use crate::store::Store;

/// Metrics emitted by the MetricsStore wrapper.
#[derive(Debug, Clone)]
pub enum CacheMetric {
    /// Emitted on every plain read (get) operation.
    Read {
        /// The key that was read.
        key: String,
        /// Whether the key was found.
        hit: bool,
        /// Latency of the operation in milliseconds.
        latency_ms: f64,
        /// Name of the wrapped store (from Store::name()).
        store: String,
    },
    /// Emitted on every plain write (set) operation.
    Write {
        key: String,
        latency_ms: f64,
        store: String,
    },
    /// Emitted on every remove operation.
    Remove {
        /// Number of keys in the remove batch.
        key_count: usize,
        /// First key in the batch (for debugging/identification).
        first_key: Option<String>,
        latency_ms: f64,
        store: String,
    },
    /// Emitted on every atomic script run.
    Script {
        /// Script name (from Script::name()).
        script: &'static str,
        /// First key the script ran against.
        key: Option<String>,
        /// First element of the reply, `None` when the script failed.
        status: Option<String>,
        latency_ms: f64,
        store: String,
    },
    /// Emitted on every replica acknowledgement probe.
    ReplicaProbe {
        requested: u32,
        /// Acknowledged replicas, `None` when the probe failed.
        achieved: Option<u32>,
        latency_ms: f64,
        store: String,
    },
}

/// Trait for receiving cache metrics.
///
/// Implement this trait to collect metrics from `MetricsStore`.
///
/// # Example
///
/// ```ignore
/// use std::sync::Mutex;
/// use async_trait::async_trait;
/// use lease_cache::{CacheMetric, MetricsSink};
///
/// struct BufferedSink {
///     buffer: Mutex<Vec<CacheMetric>>,
/// }
///
/// #[async_trait]
/// impl MetricsSink for BufferedSink {
///     fn emit(&self, metric: CacheMetric) {
///         self.buffer.lock().unwrap().push(metric);
///     }
///
///     async fn flush(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
///         // Send buffered metrics to your backend
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Emit a single metric.
    ///
    /// This is called synchronously in the hot path of store operations.
    /// Implementations should be fast (e.g., buffer metrics in memory).
    fn emit(&self, metric: CacheMetric);

    /// Flush any buffered metrics.
    async fn flush(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// A [`Store`] decorator reporting every call to a [`MetricsSink`].
///
/// Errors from the wrapped store are passed through untouched; the metric is
/// emitted either way.
pub struct MetricsStore {
    inner: Arc<dyn Store>,
    sink: Arc<dyn MetricsSink>,
    store_name: String,
}

impl MetricsStore {
    pub fn new(inner: Arc<dyn Store>, sink: Arc<dyn MetricsSink>) -> Self {
        let store_name = inner.name().to_string();
        MetricsStore {
            inner,
            sink,
            store_name,
        }
    }

    pub fn sink(&self) -> &Arc<dyn MetricsSink> {
        &self.sink
    }
}

/// Await `op`, returning its output with the elapsed wall time in milliseconds.
async fn timed<T>(op: impl Future<Output = T>) -> (T, f64) {
    let start = Instant::now();
    let output = op.await;
    (output, start.elapsed().as_secs_f64() * 1000.0)
}

#[async_trait]
impl Store for MetricsStore {
    fn name(&self) -> &'static str {
        "metrics"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let (result, latency_ms) = timed(self.inner.get(key)).await;
        self.sink.emit(CacheMetric::Read {
            key: key.to_string(),
            hit: matches!(result, Ok(Some(_))),
            latency_ms,
            store: self.store_name.clone(),
        });
        result
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let (result, latency_ms) = timed(self.inner.set(key, value, ttl)).await;
        self.sink.emit(CacheMetric::Write {
            key: key.to_string(),
            latency_ms,
            store: self.store_name.clone(),
        });
        result
    }

    async fn remove(&self, keys: &[&str]) -> Result<(), CacheError> {
        let (result, latency_ms) = timed(self.inner.remove(keys)).await;
        self.sink.emit(CacheMetric::Remove {
            key_count: keys.len(),
            first_key: keys.first().map(|k| k.to_string()),
            latency_ms,
            store: self.store_name.clone(),
        });
        result
    }

    async fn run_script(
        &self,
        script: Script,
        keys: &[&str],
        args: &[String],
    ) -> Result<Vec<String>, CacheError> {
        let (result, latency_ms) = timed(self.inner.run_script(script, keys, args)).await;
        self.sink.emit(CacheMetric::Script {
            script: script.name(),
            key: keys.first().map(|k| k.to_string()),
            status: result.as_ref().ok().and_then(|reply| reply.first().cloned()),
            latency_ms,
            store: self.store_name.clone(),
        });
        result
    }

    async fn replica_ack_count(&self, replicas: u32, timeout: Duration) -> Result<u32, CacheError> {
        let (result, latency_ms) = timed(self.inner.replica_ack_count(replicas, timeout)).await;
        self.sink.emit(CacheMetric::ReplicaProbe {
            requested: replicas,
            achieved: result.as_ref().ok().copied(),
            latency_ms,
            store: self.store_name.clone(),
        });
        result
    }
}
