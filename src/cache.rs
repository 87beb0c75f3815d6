//! # Refcount + TTL Cache
//!
//! Keyed cache of closeable resources (mapped pages) with acquire/release
//! reference counting and lazy TTL eviction. This is deliberately *not* an
//! LRU: nothing is ever evicted by capacity pressure. An entry leaves the
//! cache only when both conditions hold at sweep time:
//!
//! - its refcount is `<= 0` (no caller holds it), and
//! - `now - last_access > ttl`.
//!
//! The refcount half is load-bearing — a page handed to a caller must not
//! have its mapping pulled out from under it, so a capacity-bounded policy
//! would be unsound here. The TTL half bounds memory once nobody holds the
//! page.
//!
//! ## Sweeping
//!
//! Eviction is a lazy mark-and-sweep run at the start of every `put`: all
//! evictable entries are collected at once and handed to the shared
//! [`sweeper`](crate::sweeper) pool, which closes them off the lock. Close
//! failures during a sweep are logged and swallowed — the cache has already
//! forgotten the entry.
//!
//! ## Locking
//!
//! One `RwLock` protects the map. `get` and `release` take the read lock and
//! touch only atomics inside entries; `put`, `remove`, and `remove_all` take
//! the write lock.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use eyre::Result;
use parking_lot::RwLock;
use tracing::debug;

use crate::sweeper;

/// Default entry TTL when the owner has no opinion.
pub const DEFAULT_TTL: Duration = Duration::from_millis(10 * 1000);

/// A resource the cache may close on eviction.
pub trait Closeable {
    fn close(&self) -> Result<()>;
}

/// Milliseconds since the unix epoch. Also used for metadata timestamps and
/// modtime comparisons, so every stored time shares one clock.
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

struct CacheEntry<V> {
    value: Arc<V>,
    ref_count: AtomicI64,
    last_access_ms: AtomicU64,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn new(value: Arc<V>, ttl: Duration) -> Self {
        Self {
            value,
            ref_count: AtomicI64::new(1),
            last_access_ms: AtomicU64::new(unix_millis()),
            ttl,
        }
    }

    fn evictable(&self, now_ms: u64) -> bool {
        self.ref_count.load(Ordering::Acquire) <= 0
            && now_ms.saturating_sub(self.last_access_ms.load(Ordering::Acquire))
                > self.ttl.as_millis() as u64
    }
}

pub struct RefTtlCache<K, V> {
    entries: RwLock<HashMap<K, CacheEntry<V>>>,
}

impl<K, V> RefTtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Closeable + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Inserts `value` with refcount 1. Runs a mark-and-sweep first; swept
    /// values (never `value` itself) are closed asynchronously.
    pub fn put(&self, key: K, value: Arc<V>, ttl: Duration) {
        let mut swept = {
            let mut entries = self.entries.write();
            let mut swept = Self::mark_and_sweep(&mut entries);
            // A live entry displaced by re-insert must still be closed.
            if let Some(old) = entries.remove(&key) {
                swept.push(old.value);
            }
            entries.insert(key, CacheEntry::new(Arc::clone(&value), ttl));
            swept
        };

        swept.retain(|v| !Arc::ptr_eq(v, &value));
        if !swept.is_empty() {
            debug!(count = swept.len(), "mark-and-sweep evicted resources");
            sweeper::close_async(
                swept
                    .into_iter()
                    .map(|v| v as Arc<dyn Closeable + Send + Sync>)
                    .collect(),
            );
        }
    }

    fn mark_and_sweep(entries: &mut HashMap<K, CacheEntry<V>>) -> Vec<Arc<V>> {
        let now = unix_millis();
        let expired: Vec<K> = entries
            .iter()
            .filter(|(_, e)| e.evictable(now))
            .map(|(k, _)| k.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|k| entries.remove(&k))
            .map(|e| e.value)
            .collect()
    }

    /// On hit, bumps the refcount and last-access time. Never reinserts.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let entries = self.entries.read();
        entries.get(key).map(|e| {
            e.last_access_ms.store(unix_millis(), Ordering::Release);
            e.ref_count.fetch_add(1, Ordering::AcqRel);
            Arc::clone(&e.value)
        })
    }

    /// Drops one reference. Eviction stays lazy — it happens during the next
    /// `put`, not here.
    pub fn release(&self, key: &K) {
        let entries = self.entries.read();
        if let Some(e) = entries.get(key) {
            e.ref_count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Removes and synchronously closes the entry, returning its value.
    pub fn remove(&self, key: &K) -> Result<Option<Arc<V>>> {
        let removed = self.entries.write().remove(key);
        match removed {
            Some(e) => {
                e.value.close()?;
                Ok(Some(e.value))
            }
            None => Ok(None),
        }
    }

    /// Synchronously closes every live value and empties the cache.
    pub fn remove_all(&self) -> Result<()> {
        let drained: Vec<CacheEntry<V>> = {
            let mut entries = self.entries.write();
            entries.drain().map(|(_, e)| e).collect()
        };

        for e in drained {
            e.value.close()?;
        }
        Ok(())
    }

    /// Snapshot of live values; refcounts are untouched.
    pub fn values(&self) -> Vec<Arc<V>> {
        self.entries
            .read()
            .values()
            .map(|e| Arc::clone(&e.value))
            .collect()
    }

    pub fn size(&self) -> usize {
        self.entries.read().len()
    }
}

impl<K, V> Default for RefTtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Closeable + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
