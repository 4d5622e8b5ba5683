//! Bounded caches for open table files and decoded blocks.
//!
//! The table cache keeps at most `max_open_files` tables open, keyed by
//! file number; every read that reaches a table file goes through it. The
//! block cache is shared across all tables and keyed by `(file number,
//! block offset)`. Both are internally synchronized and shared freely.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::hash::Hash;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::{Options, ReadOptions};
use crate::db::filename;
use crate::error::Result;
use crate::sstable::block::Block;
use crate::sstable::table::{Table, TableIterator};

/// A least-recently-used cache. Recency is tracked with a monotonically
/// increasing stamp per entry and an ordered index over stamps, so eviction
/// always removes the coldest entry.
pub struct LruCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    capacity: usize,
    entries: HashMap<K, (V, u64)>,
    recency: BTreeMap<u64, K>,
    next_stamp: u64,
    stats: Stats,
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            next_stamp: 0,
            stats: Stats::new(),
        }
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        let stamp = self.next_stamp;
        match self.entries.get_mut(key) {
            Some((value, entry_stamp)) => {
                self.recency.remove(entry_stamp);
                *entry_stamp = stamp;
                self.recency.insert(stamp, key.clone());
                self.next_stamp += 1;
                self.stats.hit();
                Some(value.clone())
            }
            None => {
                self.stats.miss();
                None
            }
        }
    }

    pub fn insert(&mut self, key: K, value: V) {
        if let Some((_, old_stamp)) = self.entries.remove(&key) {
            self.recency.remove(&old_stamp);
        }
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        self.entries.insert(key.clone(), (value, stamp));
        self.recency.insert(stamp, key);

        while self.entries.len() > self.capacity {
            let coldest = *self.recency.keys().next().expect("recency tracks entries");
            if let Some(key) = self.recency.remove(&coldest) {
                self.entries.remove(&key);
            }
        }
    }

    pub fn remove(&mut self, key: &K) {
        if let Some((_, stamp)) = self.entries.remove(key) {
            self.recency.remove(&stamp);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> (usize, usize) {
        self.stats.get()
    }
}

struct Stats {
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl Stats {
    fn new() -> Self {
        Stats {
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

/// Shared cache of decoded blocks, keyed by `(file number, block offset)`.
pub struct BlockCache {
    cache: Mutex<LruCache<(u64, u64), Arc<Block>>>,
}

impl BlockCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, cache_id: u64, offset: u64) -> Option<Arc<Block>> {
        self.cache.lock().unwrap().get(&(cache_id, offset))
    }

    pub fn insert(&self, cache_id: u64, offset: u64, block: Arc<Block>) {
        self.cache.lock().unwrap().insert((cache_id, offset), block);
    }
}

/// Cache of open table files, keyed by file number. Produces point lookups
/// and iterators over table files without reopening them each time.
pub struct TableCache {
    dir: PathBuf,
    options: Options,
    cache: Mutex<LruCache<u64, Arc<Table>>>,
    block_cache: Option<Arc<BlockCache>>,
}

impl TableCache {
    pub fn new(dir: PathBuf, options: Options, capacity: usize) -> Self {
        let block_cache = options
            .block_cache_entries
            .map(|entries| Arc::new(BlockCache::new(entries)));
        Self {
            dir,
            options,
            cache: Mutex::new(LruCache::new(capacity)),
            block_cache,
        }
    }

    /// Returns the open table for `file_number`, opening and caching it on
    /// miss.
    pub fn get_table(&self, file_number: u64, file_size: u64) -> Result<Arc<Table>> {
        if let Some(table) = self.cache.lock().unwrap().get(&file_number) {
            return Ok(table);
        }

        let path = filename::table_file(&self.dir, file_number);
        let file = File::open(&path)?;
        let table = Table::open(
            &self.options,
            file,
            file_size,
            file_number,
            self.block_cache.clone(),
        )?;
        self.cache
            .lock()
            .unwrap()
            .insert(file_number, Arc::clone(&table));
        Ok(table)
    }

    /// Point lookup: first entry in the file with key >= target.
    pub fn get(
        &self,
        options: &ReadOptions,
        file_number: u64,
        file_size: u64,
        target: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let table = self.get_table(file_number, file_size)?;
        table.internal_get(options, target)
    }

    /// Iterator over the file, optionally seeked to `start`.
    pub fn iter(
        &self,
        options: ReadOptions,
        file_number: u64,
        file_size: u64,
        start: Option<&[u8]>,
    ) -> Result<TableIterator> {
        let table = self.get_table(file_number, file_size)?;
        Ok(table.iter(options, start))
    }

    /// Drops the cached handle for a deleted file.
    pub fn evict(&self, file_number: u64) {
        self.cache.lock().unwrap().remove(&file_number);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lru_get_and_insert() {
        let mut cache = LruCache::new(2);
        cache.insert("apple", "red");
        cache.insert("banana", "yellow");

        assert_eq!(cache.get(&"apple"), Some("red"));
        assert_eq!(cache.get(&"banana"), Some("yellow"));
        assert_eq!(cache.get(&"cherry"), None);
    }

    #[test]
    fn lru_evicts_coldest() {
        let mut cache = LruCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        // Touch "a" so "b" is the eviction candidate.
        assert_eq!(cache.get(&"a"), Some(1));
        cache.insert("c", 3);

        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"c"), Some(3));
    }

    #[test]
    fn lru_reinsert_updates_value() {
        let mut cache = LruCache::new(2);
        cache.insert("a", 1);
        cache.insert("a", 2);
        assert_eq!(cache.get(&"a"), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn lru_remove() {
        let mut cache = LruCache::new(2);
        cache.insert("a", 1);
        cache.remove(&"a");
        assert_eq!(cache.get(&"a"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn lru_tracks_stats() {
        let mut cache = LruCache::new(4);
        cache.insert("a", 1);
        cache.get(&"a");
        cache.get(&"missing");

        let (hits, misses) = cache.stats();
        assert_eq!(hits, 1);
        assert_eq!(misses, 1);
    }

    #[test]
    fn block_cache_shared_by_id() {
        use crate::sstable::block::BlockBuilder;

        let cache = BlockCache::new(4);
        let image = BlockBuilder::new(16).finish();
        let block = Arc::new(Block::new(image).unwrap());

        cache.insert(7, 0, Arc::clone(&block));
        assert!(cache.get(7, 0).is_some());
        assert!(cache.get(7, 100).is_none());
        assert!(cache.get(8, 0).is_none());
    }
}
