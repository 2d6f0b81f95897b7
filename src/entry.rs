use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// A cache entry: the single value stored per key in the underlying store.
///
/// Encoded as a compact JSON object so that stores with a Lua engine can read and
/// rewrite it server-side:
///
/// ```text
/// {"v":"payload","lu":1700000003000,"lo":"owner-token","ver":2}
/// ```
///
/// Absent optional fields are omitted rather than written as `null`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Entry {
    /// The cached payload.
    ///
    /// `None` for a placeholder created by a lease on a cold key. `Some("")` is a
    /// cached negative result and is a hit.
    #[serde(rename = "v", default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,

    /// Unix timestamp in milliseconds until which the lease is held.
    ///
    /// `None` means the entry is clean. Any value, including a past one, marks the
    /// entry as needing a refresh.
    #[serde(rename = "lu", default, skip_serializing_if = "Option::is_none")]
    pub lock_until: Option<i64>,

    /// Token of the lease holder.
    #[serde(rename = "lo", default, skip_serializing_if = "Option::is_none")]
    pub lock_owner: Option<String>,

    /// Invalidation counter. Only ever incremented, by `tag_as_deleted`.
    #[serde(rename = "ver")]
    pub version: u64,
}

impl Entry {
    /// Create a clean entry holding `payload`.
    pub fn new(payload: impl Into<String>, version: u64) -> Self {
        Entry {
            payload: Some(payload.into()),
            lock_until: None,
            lock_owner: None,
            version,
        }
    }

    /// Create a placeholder leased to `owner` until `lock_until`.
    pub fn placeholder(owner: impl Into<String>, lock_until: i64) -> Self {
        Entry {
            payload: None,
            lock_until: Some(lock_until),
            lock_owner: Some(owner.into()),
            version: 0,
        }
    }

    /// Encode into the on-store string.
    pub fn encode(&self) -> Result<String, CacheError> {
        serde_json::to_string(self)
            .map_err(|e| CacheError::Serialization(format!("Serialization failed: {}", e)))
    }

    /// Decode the on-store string stored at `key`.
    ///
    /// Anything that is not an entry is an error, never a miss.
    pub fn decode(key: &str, raw: &str) -> Result<Self, CacheError> {
        serde_json::from_str(raw).map_err(|e| CacheError::decode(key, e.to_string()))
    }

    /// Clean entry with a payload: served without taking a lease.
    pub fn is_hit(&self) -> bool {
        self.lock_until.is_none() && self.payload.is_some()
    }

    /// Leased by an owner other than `owner` and the lease has not run out.
    pub fn is_locked_by_other(&self, owner: &str, now_ms: i64) -> bool {
        match (&self.lock_owner, self.lock_until) {
            (Some(holder), Some(until)) => holder != owner && until > now_ms,
            _ => false,
        }
    }

    /// Holds `owner`'s lease.
    pub fn is_owned_by(&self, owner: &str) -> bool {
        self.lock_owner.as_deref() == Some(owner)
    }
}
