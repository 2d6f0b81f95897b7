use futures::future::join_all;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use crate::client::CacheClient;
use crate::error::{BoxError, CacheError};

impl CacheClient {
    /// Fetch several keys concurrently, each with its own recomputation.
    ///
    /// Every key runs its own independent [`CacheClient::fetch_when`]; one key's
    /// error, panic or lease wait never affects the others. Results are keyed the
    /// same way as `recomputes`.
    ///
    /// # Example
    /// ```ignore
    /// let results = client
    ///     .fetch_batch(loaders, Duration::from_secs(60), |v| !v.is_empty())
    ///     .await;
    /// for (key, result) in results { ... }
    /// ```
    pub async fn fetch_batch<F, Fut, E, P>(
        &self,
        recomputes: HashMap<String, F>,
        expire: Duration,
        should_cache: P,
    ) -> HashMap<String, Result<String, CacheError>>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<String, E>>,
        E: Into<BoxError>,
        P: Fn(&str) -> bool,
    {
        let should_cache = &should_cache;
        let fetches = recomputes.into_iter().map(|(key, recompute)| async move {
            let result = self
                .fetch_when(&key, expire, recompute, |v| should_cache(v))
                .await;
            (key, result)
        });
        join_all(fetches).await.into_iter().collect()
    }
}
