use std::env;
use std::str::FromStr;

/// Benchmark knobs, read from the environment.
///
/// | Variable            | Default                  |
/// |---------------------|--------------------------|
/// | `REDIS_URL`         | `redis://localhost:6379` |
/// | `BENCH_REDIS`       | unset (in-memory only)   |
/// | `DB_LATENCY_MS`     | `5`                      |
/// | `BENCH_SAMPLE_SIZE` | `100`                    |
#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub redis_url: String,
    pub with_redis: bool,
    pub db_latency_ms: u64,
    pub sample_size: usize,
}

fn parsed<T: FromStr>(var: &str, default: T) -> T {
    env::var(var)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

impl BenchConfig {
    pub fn from_env() -> Self {
        let config = Self {
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            with_redis: env::var("BENCH_REDIS").is_ok_and(|v| v == "1"),
            db_latency_ms: parsed("DB_LATENCY_MS", 5),
            sample_size: parsed("BENCH_SAMPLE_SIZE", 100),
        };
        eprintln!(
            "bench config: redis={} db_latency={}ms samples={}",
            if config.with_redis { config.redis_url.as_str() } else { "off" },
            config.db_latency_ms,
            config.sample_size,
        );
        config
    }
}
