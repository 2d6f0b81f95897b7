//! lease-cache - A cache-aside client with distributed single-flight recomputation
//!
//! This library provides strongly consistent caching over a shared key-value store:
//! - One recomputation per key at a time, across every process sharing the store
//! - Versioned invalidation that keeps stale data available while one reader refreshes
//! - Negative-result caching with its own expiry
//! - Optional replica acknowledgement for invalidations
//!
//! Mutual exclusion lives entirely in the store (atomic Lua scripts on Redis), never in
//! process-local locks.
//!
//! # Example
//!
//! ```ignore
//! use lease_cache::{CacheClient, ClientOptions, RedisStore, RedisStoreConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), lease_cache::CacheError> {
//!     let store = Arc::new(RedisStore::new(RedisStoreConfig::default()).await?);
//!     let client = CacheClient::new(store, ClientOptions::default())?;
//!
//!     // Recomputed at most once across all processes, then served from Redis
//!     let user = client
//!         .fetch("user:123", Duration::from_secs(60), |key| async move {
//!             db::load_user_json(&key).await
//!         })
//!         .await?;
//!
//!     // After updating the database
//!     client.tag_as_deleted("user:123").await?;
//!     Ok(())
//! }
//! ```

mod batch;
mod client;
mod entry;
mod error;
mod fetch;
mod invalidate;
mod lock;
mod options;
pub mod script;
mod store;
pub mod stores;
mod typed;
mod utils;

// Re-export public API
pub use client::CacheClient;
pub use entry::Entry;
pub use error::{BoxError, CacheError};
pub use lock::{Acquire, Lease, LockCoordinator, Release, ReleaseOutcome};
pub use options::{ClientOptions, RetryPolicy};
pub use script::Script;
pub use store::Store;
pub use stores::memory::{HashMapStore, HashMapStoreConfig};
pub use stores::metrics::{CacheMetric, MetricsSink, MetricsStore};
pub use stores::redis::{RedisStore, RedisStoreConfig};
pub use typed::TypedCache;
pub use utils::new_owner_token;
