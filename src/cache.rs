//! Bounded txid cache used for duplicate detection and prevout resolution.

use bitcoin::Txid;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// Counter snapshot, reported once the pipeline drains.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub dupes: u64,
    pub evictions: u64,
}

struct Entry {
    id: i64,
    /// Outputs of this tx not yet seen spent; at zero the entry can only
    /// serve duplicate detection and stops being freshened by spends.
    remaining: u32,
}

/// Maps a txid to its assigned surrogate id, bounded by LRU eviction.
///
/// The loading coordinator is the only caller of `add`; the txin writer
/// issues `check` concurrently from its own thread, so the table sits behind
/// a mutex.
pub struct TxIdCache {
    inner: Mutex<Inner>,
}

struct Inner {
    map: LruCache<Txid, Entry>,
    stats: CacheStats,
}

impl TxIdCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).expect("cache capacity must be positive");
        TxIdCache {
            inner: Mutex::new(Inner {
                map: LruCache::new(capacity),
                stats: CacheStats::default(),
            }),
        }
    }

    /// Record `txid` as `id` unless it was seen before, in which case the
    /// previously assigned id is returned and the old entry only gets
    /// freshened. Inserting into a full cache evicts the stalest entry.
    pub fn add(&self, txid: Txid, id: i64, outputs: u32) -> i64 {
        let mut guard = self.inner.lock().expect("cache lock");
        let Inner {
            ref mut map,
            ref mut stats,
        } = *guard;
        if let Some(entry) = map.get(&txid) {
            stats.dupes += 1;
            return entry.id;
        }
        if map
            .push(
                txid,
                Entry {
                    id,
                    remaining: outputs,
                },
            )
            .is_some()
        {
            stats.evictions += 1;
        }
        id
    }

    /// Resolve a prevout txid to its assigned id, if still cached.
    pub fn check(&self, txid: &Txid) -> Option<i64> {
        let mut guard = self.inner.lock().expect("cache lock");
        let Inner {
            ref mut map,
            ref mut stats,
        } = *guard;
        match map.get_mut(txid) {
            Some(entry) => {
                entry.remaining = entry.remaining.saturating_sub(1);
                stats.hits += 1;
                Some(entry.id)
            }
            None => {
                stats.misses += 1;
                None
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().expect("cache lock").stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    fn txid(n: u8) -> Txid {
        Txid::from_slice(&[n; 32]).unwrap()
    }

    #[test]
    fn add_assigns_and_dedupes() {
        let cache = TxIdCache::new(16);
        assert_eq!(cache.add(txid(1), 100, 2), 100);
        // a second sighting keeps the first id
        assert_eq!(cache.add(txid(1), 101, 2), 100);
        let stats = cache.stats();
        assert_eq!(stats.dupes, 1);
        assert_eq!(stats.evictions, 0);
    }

    #[test]
    fn check_hits_and_misses() {
        let cache = TxIdCache::new(16);
        cache.add(txid(1), 7, 1);
        assert_eq!(cache.check(&txid(1)), Some(7));
        assert_eq!(cache.check(&txid(2)), None);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn capacity_one_evicts_before_spend() {
        // block A's tx gets pushed out by block B's before B spends it
        let cache = TxIdCache::new(1);
        cache.add(txid(0xAA), 1, 1);
        cache.add(txid(0xBB), 2, 1);
        assert_eq!(cache.check(&txid(0xAA)), None);
        let stats = cache.stats();
        assert_eq!(stats.evictions, 1);
        assert!(stats.misses >= 1);
    }

    #[test]
    fn eviction_follows_recency() {
        let cache = TxIdCache::new(2);
        cache.add(txid(1), 1, 1);
        cache.add(txid(2), 2, 1);
        assert_eq!(cache.check(&txid(1)), Some(1));
        cache.add(txid(3), 3, 1); // txid(2) is now the stalest
        assert_eq!(cache.check(&txid(1)), Some(1));
        assert_eq!(cache.check(&txid(2)), None);
        assert_eq!(cache.check(&txid(3)), Some(3));
    }

    #[test]
    fn duplicate_add_freshens_the_entry() {
        let cache = TxIdCache::new(2);
        cache.add(txid(1), 1, 1);
        cache.add(txid(2), 2, 1);
        assert_eq!(cache.add(txid(1), 3, 1), 1); // freshens txid(1)
        cache.add(txid(4), 4, 1); // evicts txid(2)
        assert_eq!(cache.check(&txid(1)), Some(1));
        assert_eq!(cache.check(&txid(2)), None);
    }
}
