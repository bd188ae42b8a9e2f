//! Process-wide key/value cache with per-entry time-to-live.
//!
//! One instance is created at startup and shared by reference with every
//! broker (and every fan-out unit spawned by them). Entries are never evicted:
//! an expired entry simply reads as a miss until it is overwritten.

use std::{borrow::Borrow, hash::Hash, time::Duration};

use hashbrown::HashMap;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::trace;

/// Lifetime of a cached ListResources answer or GetVersion lookup when the
/// configuration does not say otherwise.
pub const DEFAULT_TTL_SECS: u64 = 60 * 60;

/// TTLs the slice broker applies to what it caches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheSettings {
    pub resources_ttl: Duration,
    pub version_ttl: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            resources_ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            version_ttl: Duration::from_secs(DEFAULT_TTL_SECS),
        }
    }
}

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_live(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) <= self.ttl
    }
}

pub struct TtlCache<K, V> {
    entries: RwLock<HashMap<K, CacheEntry<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Inserts or unconditionally replaces `key`.
    pub fn add(&self, key: K, value: V, ttl: Duration) {
        let entry = CacheEntry {
            value,
            inserted_at: Instant::now(),
            ttl,
        };
        self.entries.write().insert(key, entry);
    }

    /// Returns a clone of the value if present and not yet expired.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq + Hash,
    {
        let now = Instant::now();
        let entries = self.entries.read();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                trace!("cache entry expired");
                None
            }
            None => None,
        }
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Default for TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
