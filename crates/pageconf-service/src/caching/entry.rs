use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ResourceId;

/// A cached page configuration together with its validator.
///
/// The payload and the ETag always come from the same upstream response. Entries are
/// immutable; a revalidation creates a new entry with a new `fetched_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub resource_id: ResourceId,
    pub payload: Arc<Value>,
    pub etag: Option<String>,
    /// When this payload was last fetched or confirmed by the upstream.
    pub fetched_at: SystemTime,
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl CacheEntry {
    /// Creates an entry for a payload that has just been fetched.
    pub fn new(
        resource_id: ResourceId,
        payload: impl Into<Arc<Value>>,
        etag: Option<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            resource_id,
            payload: payload.into(),
            etag,
            fetched_at: SystemTime::now(),
            ttl,
        }
    }

    /// The point in time after which this entry needs revalidation.
    pub fn expires_at(&self) -> SystemTime {
        self.fetched_at
            .checked_add(self.ttl)
            .unwrap_or(self.fetched_at)
    }

    /// Whether the entry may still be served without asking the upstream.
    pub fn is_fresh(&self, now: SystemTime) -> bool {
        now < self.expires_at()
    }

    /// Returns a copy of this entry confirmed by the upstream at `now`.
    ///
    /// Payload and ETag are retained.
    pub fn refreshed(&self, now: SystemTime, ttl: Duration) -> Self {
        Self {
            fetched_at: now,
            ttl,
            ..self.clone()
        }
    }

    /// Approximate number of bytes this entry occupies.
    pub fn approximate_size(&self) -> usize {
        // `Value` does not know its own size, its serialized length is a good proxy.
        let payload = serde_json::to_vec(&*self.payload).map_or(0, |v| v.len());
        std::mem::size_of::<Self>()
            + self.resource_id.as_str().len()
            + self.etag.as_ref().map_or(0, String::len)
            + payload
    }
}
