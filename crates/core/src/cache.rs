//! Shared TTL cache for metadata and search lookups.
//!
//! Validity is decided on read against the injected [`Clock`]: an entry is
//! live iff `now - inserted_at < ttl`. moka bounds the entry count and drops
//! expired entries in the background, but a stale entry is never returned even
//! if moka has not reclaimed it yet.

use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use moka::sync::Cache;
use moka::Expiry;
use tracing::trace;

use crate::clock::{Clock, SystemClock};

#[derive(Clone, Debug)]
pub struct CacheEntry<V> {
    pub value: V,
    pub inserted_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl<V> CacheEntry<V> {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        match (now - self.inserted_at).to_std() {
            Ok(elapsed) => elapsed < self.ttl,
            // Clock went backwards; treat the entry as freshly inserted.
            Err(_) => !self.ttl.is_zero(),
        }
    }
}

struct EntryTtl;

impl<K, V> Expiry<K, CacheEntry<V>> for EntryTtl {
    fn expire_after_create(
        &self,
        _key: &K,
        value: &CacheEntry<V>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &K,
        value: &CacheEntry<V>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

pub struct TtlCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    entries: Cache<K, CacheEntry<V>>,
    default_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl<K, V> TtlCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(max_entries: u64, default_ttl: Duration) -> Self {
        Self::with_clock(max_entries, default_ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(max_entries: u64, default_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let entries = Cache::builder().max_capacity(max_entries).expire_after(EntryTtl).build();
        Self { entries, default_ttl, clock }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Absent and expired are reported the same way.
    pub fn get(&self, key: &K) -> Option<V> {
        let entry = self.entries.get(key)?;
        if entry.is_live(self.clock.now()) {
            return Some(entry.value);
        }
        trace!(event_name = "cache.entry.expired", "dropping expired cache entry on read");
        self.entries.invalidate(key);
        None
    }

    /// Replaces any previous entry for `key` wholesale.
    pub fn put(&self, key: K, value: V, ttl: Duration) {
        let entry = CacheEntry { value, inserted_at: self.clock.now(), ttl };
        self.entries.insert(key, entry);
    }

    pub fn insert(&self, key: K, value: V) {
        self.put(key, value, self.default_ttl);
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.invalidate(key);
    }

    pub fn clear(&self) {
        self.entries.invalidate_all();
    }
}
