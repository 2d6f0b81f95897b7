use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BenchUser {
    pub id: u64,
    pub name: String,
    pub email: String,
    pub score: u32,
}

#[derive(Debug, thiserror::Error)]
#[error("user {0} not found")]
pub struct NotFound(pub String);

/// Origin standing in for the database behind the cache. Users `0..num_users`
/// exist, and every lookup costs `latency`.
#[derive(Clone)]
pub struct FakeDatabase {
    num_users: u64,
    latency: Duration,
    queries: Arc<AtomicUsize>,
}

impl FakeDatabase {
    pub fn new(num_users: u64, latency_ms: u64) -> Self {
        Self {
            num_users,
            latency: Duration::from_millis(latency_ms),
            queries: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn get(&self, key: &str) -> Result<BenchUser, NotFound> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(self.latency).await;

        let id = key
            .strip_prefix("user:")
            .and_then(|id| id.parse::<u64>().ok())
            .filter(|id| *id < self.num_users)
            .ok_or_else(|| NotFound(key.to_string()))?;
        Ok(BenchUser {
            id,
            name: format!("User {id}"),
            email: format!("user{id}@example.com"),
            score: (id % 1000) as u32,
        })
    }

    #[allow(dead_code)]
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::Relaxed)
    }
}

/// Key space of `user:<n>` keys.
pub struct Keyspace {
    size: usize,
}

impl Keyspace {
    pub fn new(size: usize) -> Self {
        Self { size }
    }

    pub fn all(&self) -> Vec<String> {
        (0..self.size).map(user_key).collect()
    }

    /// Skewed sample: 80% of picks land on the first fifth of the key space.
    pub fn skewed(&self, count: usize) -> Vec<String> {
        let mut rng = rand::thread_rng();
        let hot = (self.size / 5).max(1);
        (0..count)
            .map(|_| {
                let id = if rng.gen_bool(0.8) {
                    rng.gen_range(0..hot)
                } else {
                    rng.gen_range(hot.min(self.size - 1)..self.size)
                };
                user_key(id)
            })
            .collect()
    }
}

fn user_key(id: usize) -> String {
    format!("user:{id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_database() {
        let db = FakeDatabase::new(100, 1);

        assert_eq!(db.get("user:0").await.unwrap().id, 0);
        assert!(db.get("user:100").await.is_err());
        assert!(db.get("order:1").await.is_err());
        assert_eq!(db.query_count(), 3);
    }

    #[test]
    fn test_keyspace() {
        let keys = Keyspace::new(100);

        let all = keys.all();
        assert_eq!(all.len(), 100);
        assert_eq!(all[0], "user:0");

        let sample = keys.skewed(100);
        assert_eq!(sample.len(), 100);
        assert!(sample.iter().all(|k| all.contains(k)));
    }
}
