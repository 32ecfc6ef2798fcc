//! Per-worker slice cache.
//!
//! A small flat array of `[start, end) → value` entries consulted before the
//! slice store. Consecutive records usually fall into the same slice, so a
//! linear scan over a handful of entries avoids the store's lock entirely.
//! The cache is only an accelerator: a miss always falls back to the store.

use serde::{Deserialize, Serialize};

/// Eviction policy of a [`SliceCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicy {
    /// Evict the least recently used entry.
    #[default]
    Lru,
    /// Evict the least frequently used entry.
    Lfu,
}

/// Hit and miss counters of a cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups served from the cache
    pub hits: u64,
    /// Lookups that called the replacement function
    pub misses: u64,
}

impl CacheStats {
    /// Fraction of lookups served from the cache.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry<V> {
    start: i64,
    end: i64,
    value: Option<V>,
    /// Age for LRU, use count for LFU.
    counter: u64,
}

/// Fixed-capacity cache from timestamp ranges to slice handles.
///
/// # Example
///
/// ```
/// use laminar_window::slice::{CachePolicy, SliceCache};
///
/// let mut cache: SliceCache<u32> = SliceCache::new(2, CachePolicy::Lru);
/// let v = cache.get_or_replace(5, |_| Ok::<_, ()>((0, 10, 1))).unwrap();
/// assert_eq!(v, 1);
/// // served from the cache
/// let v = cache.get_or_replace(7, |_| Ok::<_, ()>((0, 10, 2))).unwrap();
/// assert_eq!(v, 1);
/// assert_eq!(cache.stats().hits, 1);
/// ```
#[derive(Debug, Clone)]
pub struct SliceCache<V: Copy> {
    policy: CachePolicy,
    entries: Vec<CacheEntry<V>>,
    stats: CacheStats,
}

impl<V: Copy> SliceCache<V> {
    /// Creates a cache with `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize, policy: CachePolicy) -> Self {
        Self {
            policy,
            entries: vec![
                CacheEntry {
                    start: 0,
                    end: 0,
                    value: None,
                    counter: 0,
                };
                capacity
            ],
            stats: CacheStats::default(),
        }
    }

    /// Number of entries.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Eviction policy.
    #[must_use]
    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    /// Hit and miss counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Returns the value cached for `ts`, or fetches it with `replace`.
    ///
    /// `replace` returns `(start, end, value)` of the entry covering `ts`.
    /// On a miss the victim slot is chosen before `replace` runs; if
    /// `replace` fails the cache is left unchanged.
    ///
    /// # Errors
    ///
    /// Propagates the error of `replace`.
    pub fn get_or_replace<E>(
        &mut self,
        ts: i64,
        replace: impl FnOnce(i64) -> Result<(i64, i64, V), E>,
    ) -> Result<V, E> {
        if let Some(slot) = self.find(ts) {
            self.stats.hits += 1;
            self.touch(slot);
            if let Some(value) = self.entries[slot].value {
                return Ok(value);
            }
        }

        self.stats.misses += 1;
        let (start, end, value) = replace(ts)?;
        if let Some(slot) = self.victim() {
            self.entries[slot] = CacheEntry {
                start,
                end,
                value: Some(value),
                counter: 0,
            };
            self.touch(slot);
        }
        Ok(value)
    }

    /// Drops the entry covering `ts`, if any.
    pub fn invalidate(&mut self, ts: i64) {
        if let Some(slot) = self.find(ts) {
            self.entries[slot].value = None;
            self.entries[slot].counter = 0;
        }
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        for entry in &mut self.entries {
            entry.value = None;
            entry.counter = 0;
        }
    }

    fn find(&self, ts: i64) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.value.is_some() && e.start <= ts && ts < e.end)
    }

    fn touch(&mut self, slot: usize) {
        match self.policy {
            CachePolicy::Lru => {
                for (i, entry) in self.entries.iter_mut().enumerate() {
                    if i == slot {
                        entry.counter = 0;
                    } else {
                        entry.counter = entry.counter.saturating_add(1);
                    }
                }
            }
            CachePolicy::Lfu => {
                let entry = &mut self.entries[slot];
                entry.counter = entry.counter.saturating_add(1);
            }
        }
    }

    /// Empty slots first, then the highest age (LRU) or lowest count (LFU);
    /// ties go to the lowest index.
    fn victim(&self) -> Option<usize> {
        if let Some(empty) = self.entries.iter().position(|e| e.value.is_none()) {
            return Some(empty);
        }
        let mut best: Option<(usize, u64)> = None;
        for (i, entry) in self.entries.iter().enumerate() {
            let better = match (best, self.policy) {
                (None, _) => true,
                (Some((_, c)), CachePolicy::Lru) => entry.counter > c,
                (Some((_, c)), CachePolicy::Lfu) => entry.counter < c,
            };
            if better {
                best = Some((i, entry.counter));
            }
        }
        best.map(|(i, _)| i)
    }

    #[cfg(test)]
    fn cached_starts(&self) -> Vec<Option<i64>> {
        self.entries
            .iter()
            .map(|e| e.value.map(|_| e.start))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Slice k covers [k*10, k*10+10) and caches the value k.
    fn lookup(cache: &mut SliceCache<i64>, k: i64, fetched: &mut Vec<i64>) -> i64 {
        cache
            .get_or_replace(k * 10, |ts| {
                fetched.push(k);
                Ok::<_, ()>((ts, ts + 10, k))
            })
            .unwrap()
    }

    #[test]
    fn test_lru_eviction_sequence() {
        let (a, b, c, d) = (0, 1, 2, 3);
        let mut cache = SliceCache::new(2, CachePolicy::Lru);
        let mut fetched = Vec::new();

        lookup(&mut cache, a, &mut fetched);
        lookup(&mut cache, b, &mut fetched);
        // C replaces the least recently used entry, A
        lookup(&mut cache, c, &mut fetched);
        assert_eq!(cache.cached_starts(), vec![Some(20), Some(10)]);
        // A comes back in place of B
        lookup(&mut cache, a, &mut fetched);
        assert_eq!(cache.cached_starts(), vec![Some(20), Some(0)]);
        // D evicts C, not the recently used A
        lookup(&mut cache, d, &mut fetched);
        assert_eq!(cache.cached_starts(), vec![Some(30), Some(0)]);

        assert_eq!(fetched, vec![a, b, c, a, d]);
        assert_eq!(cache.stats(), CacheStats { hits: 0, misses: 5 });
    }

    #[test]
    fn test_lru_hit_refreshes_recency() {
        let mut cache = SliceCache::new(2, CachePolicy::Lru);
        let mut fetched = Vec::new();
        lookup(&mut cache, 0, &mut fetched);
        lookup(&mut cache, 1, &mut fetched);
        lookup(&mut cache, 0, &mut fetched);
        lookup(&mut cache, 2, &mut fetched);
        // 1 was least recently used
        assert_eq!(cache.cached_starts(), vec![Some(0), Some(20)]);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_lfu_evicts_least_frequent() {
        let mut cache = SliceCache::new(2, CachePolicy::Lfu);
        let mut fetched = Vec::new();
        for k in [0, 0, 0, 1, 1] {
            lookup(&mut cache, k, &mut fetched);
        }
        lookup(&mut cache, 2, &mut fetched);
        assert_eq!(cache.cached_starts(), vec![Some(0), Some(20)]);
    }

    #[test]
    fn test_lfu_ties_break_to_lowest_index() {
        let mut cache = SliceCache::new(2, CachePolicy::Lfu);
        let mut fetched = Vec::new();
        lookup(&mut cache, 0, &mut fetched);
        lookup(&mut cache, 1, &mut fetched);
        lookup(&mut cache, 2, &mut fetched);
        assert_eq!(cache.cached_starts(), vec![Some(20), Some(10)]);
    }

    #[test]
    fn test_failed_replacement_leaves_cache_unchanged() {
        let mut cache: SliceCache<i64> = SliceCache::new(1, CachePolicy::Lru);
        cache.get_or_replace(5, |_| Ok::<_, ()>((0, 10, 1))).unwrap();
        assert!(cache.get_or_replace(15, |_| Err(())).is_err());
        assert_eq!(cache.get_or_replace(5, |_| Err(())), Ok(1));
    }

    #[test]
    fn test_invalidate_forces_refetch() {
        let mut cache = SliceCache::new(2, CachePolicy::Lru);
        let mut fetched = Vec::new();
        lookup(&mut cache, 0, &mut fetched);
        cache.invalidate(3);
        lookup(&mut cache, 0, &mut fetched);
        assert_eq!(fetched, vec![0, 0]);
    }

    #[test]
    fn test_zero_capacity_always_misses() {
        let mut cache = SliceCache::new(0, CachePolicy::Lru);
        let mut fetched = Vec::new();
        lookup(&mut cache, 0, &mut fetched);
        lookup(&mut cache, 0, &mut fetched);
        assert_eq!(fetched.len(), 2);
        assert!((cache.stats().hit_rate() - 0.0).abs() < f64::EPSILON);
    }
}
