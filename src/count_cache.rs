//! Count memoisation.
//!
//! `COUNT(*)` over a partition is the expensive statement in the pipeline;
//! its result is immutable for a fixed release timestamp, so it is memoised
//! in a process-local LRU. Entries keyed to an old release become
//! unreachable once the release advances and age out naturally.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

use crate::models::request::RawFilter;

pub const DEFAULT_CAPACITY: usize = 2048;

pub struct CountCache {
    inner: Mutex<LruCache<u64, i64>>,
}

impl CountCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, key: u64) -> Option<i64> {
        // A poisoned lock degrades to a miss; the count re-materialises.
        self.inner.lock().ok()?.get(&key).copied()
    }

    pub fn put(&self, key: u64, count: i64) {
        if let Ok(mut cache) = self.inner.lock() {
            cache.put(key, count);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|cache| cache.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CountCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Cache key over the statement, partition and arguments. Filter triples
/// are sorted by identifier first so that equivalent queries written in a
/// different order share an entry.
pub fn cache_key(
    template: &str,
    partition: &str,
    metrics: &[String],
    filters: &[RawFilter],
) -> u64 {
    let mut sorted_metrics: Vec<&str> = metrics.iter().map(String::as_str).collect();
    sorted_metrics.sort_unstable();

    let mut sorted_filters: Vec<(&str, &str, &str)> = filters
        .iter()
        .map(|f| (f.identifier.as_str(), f.operator.as_str(), f.value.as_str()))
        .collect();
    sorted_filters.sort_unstable();

    let mut hasher = DefaultHasher::new();
    template.hash(&mut hasher);
    partition.hash(&mut hasher);
    sorted_metrics.hash(&mut hasher);
    sorted_filters.hash(&mut hasher);
    hasher.finish()
}
