//! Store implementations for the cache library.

pub mod memory;
pub mod metrics;
pub mod redis;

pub use self::memory::{HashMapStore, HashMapStoreConfig};
pub use self::metrics::{CacheMetric, MetricsSink, MetricsStore};
pub use self::redis::{RedisStore, RedisStoreConfig};
