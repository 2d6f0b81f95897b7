//! Shared utilities for the cache library.

use rand::Rng;
use std::any::Any;
use std::fmt::Display;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Build the store key for `key` within `namespace`.
pub fn build_cache_key<N: Display>(namespace: &N, key: &str) -> String {
    format!("{}::{}", namespace, key)
}

/// Get the current time in milliseconds since UNIX epoch.
///
/// Leases are compared against this clock on every client, so hosts sharing a
/// store are expected to run NTP.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A fresh, unguessable lease owner token.
pub fn new_owner_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Duration in whole milliseconds, saturating.
pub fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Random factor in `[0, 1)`.
pub fn rand_unit() -> f64 {
    rand::thread_rng().gen_range(0.0..1.0)
}

/// Shorten `expire` by a random fraction below `adjustment`.
pub fn jittered_expire(expire: Duration, adjustment: f64) -> Duration {
    if adjustment <= 0.0 {
        return expire;
    }
    let cut = expire.mul_f64(rand_unit() * adjustment);
    expire.saturating_sub(cut).max(Duration::from_millis(1))
}

/// Best-effort message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
