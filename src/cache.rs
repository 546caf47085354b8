use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};

use crate::enhancer::EnhancedAlert;
use crate::error::{ApiError, Result};

const ENHANCED_ALERT_PREFIX: &str = "enhanced_alert:";

/// One cached value with its freshness metadata. The payload is kept in its
/// serialized form so the store itself stays type-agnostic.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    value: String,
    pub created_at: DateTime<Utc>,
    pub fresh_for: Duration,
    pub stale_for: Duration,
    pub tag: String,
}

impl CacheEntry {
    fn age(&self) -> Duration {
        Utc::now() - self.created_at
    }

    pub fn is_fresh(&self) -> bool {
        self.age() <= self.fresh_for
    }

    pub fn is_stale(&self) -> bool {
        let age = self.age();
        age > self.fresh_for && age <= self.stale_for
    }

    pub fn is_very_stale(&self) -> bool {
        self.age() > self.stale_for
    }
}

/// In-memory stale-while-revalidate store. Entries live until overwritten or
/// until a read finds them past their stale bound; there is no other
/// eviction. Reads and writes are linearizable per key.
pub struct Cache {
    entries: DashMap<String, CacheEntry>,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    pub fn new() -> Self {
        Cache {
            entries: DashMap::new(),
        }
    }

    /// Stores a value, replacing any prior entry under the key. The stale
    /// bound defaults to twice the fresh bound.
    pub fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        fresh_for: Duration,
        tag: &str,
    ) -> Result<()> {
        self.set_with_staleness(key, value, fresh_for, fresh_for * 2, tag)
    }

    pub fn set_with_staleness<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        fresh_for: Duration,
        stale_for: Duration,
        tag: &str,
    ) -> Result<()> {
        let serialized = serde_json::to_string(value)
            .map_err(|e| ApiError::Parse(format!("cache serialization for {key}: {e}")))?;
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value: serialized,
                created_at: Utc::now(),
                fresh_for,
                stale_for,
                tag: tag.to_string(),
            },
        );
        Ok(())
    }

    /// Typed read. Absent keys and entries past their stale bound read as
    /// not found; a very stale entry is dropped on the way out.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        Ok(self.get_with_metadata(key)?.map(|(value, _)| value))
    }

    /// Typed read that also exposes the entry creation time, for
    /// last-updated reporting.
    pub fn get_with_metadata<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<(T, DateTime<Utc>)>> {
        let entry = match self.entries.get(key) {
            Some(entry) => entry.clone(),
            None => return Ok(None),
        };

        if entry.is_very_stale() {
            drop(self.entries.remove(key));
            return Ok(None);
        }

        let value = serde_json::from_str(&entry.value)
            .map_err(|e| ApiError::Parse(format!("cache deserialization for {key}: {e}")))?;
        Ok(Some((value, entry.created_at)))
    }

    /// True when the key is absent or its entry has left the fresh window.
    pub fn is_stale(&self, key: &str) -> bool {
        match self.entries.get(key) {
            Some(entry) => !entry.is_fresh(),
            None => true,
        }
    }

    /// True when the key is absent or its entry has left the stale window.
    pub fn is_very_stale(&self, key: &str) -> bool {
        match self.entries.get(key) {
            Some(entry) => entry.is_very_stale(),
            None => true,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Enhanced alerts form a logically distinct sub-store: fixed TTL with
    /// no staleness gradient, keyed by content hash.
    pub fn set_enhanced_alert(
        &self,
        hash: &str,
        enhanced: &EnhancedAlert,
        ttl: Duration,
    ) -> Result<()> {
        self.set_with_staleness(
            &format!("{ENHANCED_ALERT_PREFIX}{hash}"),
            enhanced,
            ttl,
            ttl,
            "enhanced_alert",
        )
    }

    pub fn get_enhanced_alert(&self, hash: &str) -> Option<EnhancedAlert> {
        self.get(&format!("{ENHANCED_ALERT_PREFIX}{hash}"))
            .unwrap_or_else(|e| {
                tracing::warn!("dropping unreadable enhanced alert {hash}: {e}");
                None
            })
    }

    pub fn is_enhanced_alert_cached(&self, hash: &str) -> bool {
        let key = format!("{ENHANCED_ALERT_PREFIX}{hash}");
        match self.entries.get(&key) {
            Some(entry) => !entry.is_very_stale(),
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, key: &str, age: Duration) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.created_at = Utc::now() - age;
        }
    }
}
