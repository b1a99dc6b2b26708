//! Bounded read-through caches.
//!
//! Two caches sit above the container: a block cache (raw block images keyed
//! by block number) and a metadata cache (parsed records keyed by logical
//! id). Both are lock-striped, bounded by a byte budget with LRU eviction,
//! and tag every entry with a generation number; entries from an older
//! generation are treated as misses. Dirty state never lives here: all
//! mutations go through transaction shadows and the journal, and the
//! journal's committed overlay is the write-back set that checkpoints flush.

use hashbrown::HashMap;
use spin::Mutex;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::fs::inode::InodeRecord;
use crate::vector::hnsw::node::NodeRecord;
use crate::vector::VectorIndexEntry;

/// Number of independently locked shards per cache.
const SHARDS: usize = 16;

struct Entry<K, V> {
    value: V,
    bytes: u64,
    generation: u64,
    prev: Option<K>,
    next: Option<K>,
}

/// One LRU shard: a map plus an intrusive recency list threaded through the
/// entries by key.
struct LruShard<K: Copy + Eq + Hash, V: Clone> {
    map: HashMap<K, Entry<K, V>>,
    head: Option<K>,
    tail: Option<K>,
    total_bytes: u64,
}

impl<K: Copy + Eq + Hash, V: Clone> LruShard<K, V> {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            head: None,
            tail: None,
            total_bytes: 0,
        }
    }

    fn detach(&mut self, key: K) {
        let (prev, next) = {
            let entry = &self.map[&key];
            (entry.prev, entry.next)
        };
        match prev {
            Some(prev_key) => self.map.get_mut(&prev_key).unwrap().next = next,
            None => self.head = next,
        }
        match next {
            Some(next_key) => self.map.get_mut(&next_key).unwrap().prev = prev,
            None => self.tail = prev,
        }
        let entry = self.map.get_mut(&key).unwrap();
        entry.prev = None;
        entry.next = None;
    }

    fn push_front(&mut self, key: K) {
        let old_head = self.head;
        {
            let entry = self.map.get_mut(&key).unwrap();
            entry.prev = None;
            entry.next = old_head;
        }
        if let Some(old) = old_head {
            self.map.get_mut(&old).unwrap().prev = Some(key);
        }
        self.head = Some(key);
        if self.tail.is_none() {
            self.tail = Some(key);
        }
    }

    fn get(&mut self, key: K, generation: u64) -> Option<V> {
        match self.map.get(&key) {
            Some(entry) if entry.generation == generation => {
                let value = entry.value.clone();
                self.detach(key);
                self.push_front(key);
                Some(value)
            }
            Some(_) => {
                // Stale generation: drop the entry.
                self.remove(key);
                None
            }
            None => None,
        }
    }

    fn remove(&mut self, key: K) {
        if self.map.contains_key(&key) {
            self.detach(key);
            if let Some(entry) = self.map.remove(&key) {
                self.total_bytes -= entry.bytes;
            }
        }
    }

    fn insert(&mut self, key: K, value: V, bytes: u64, generation: u64, budget: u64) {
        self.remove(key);
        self.map.insert(
            key,
            Entry {
                value,
                bytes,
                generation,
                prev: None,
                next: None,
            },
        );
        self.total_bytes += bytes;
        self.push_front(key);
        while self.total_bytes > budget {
            let Some(victim) = self.tail else { break };
            if self.map.len() == 1 {
                // Never evict the entry just inserted.
                break;
            }
            self.remove(victim);
        }
    }

    fn clear(&mut self) {
        self.map.clear();
        self.head = None;
        self.tail = None;
        self.total_bytes = 0;
    }
}

fn shard_of<K: Hash>(key: &K) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish() as usize % SHARDS
}

/// Raw block cache.
pub(crate) struct BlockCache {
    shards: Vec<Mutex<LruShard<u64, Arc<Vec<u8>>>>>,
    shard_budget: u64,
    generation: AtomicU64,
}

impl BlockCache {
    pub(crate) fn new(capacity_mib: u64, generation: u64) -> Self {
        let budget = (capacity_mib * 1024 * 1024 / SHARDS as u64).max(crate::io::BLOCK_SIZE as u64);
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(LruShard::new())).collect(),
            shard_budget: budget,
            generation: AtomicU64::new(generation),
        }
    }

    pub(crate) fn get(&self, block: u64) -> Option<Arc<Vec<u8>>> {
        let generation = self.generation.load(Ordering::Acquire);
        self.shards[shard_of(&block)].lock().get(block, generation)
    }

    pub(crate) fn insert(&self, block: u64, image: Arc<Vec<u8>>) {
        let generation = self.generation.load(Ordering::Acquire);
        self.shards[shard_of(&block)].lock().insert(
            block,
            image,
            crate::io::BLOCK_SIZE as u64,
            generation,
            self.shard_budget,
        );
    }

    pub(crate) fn invalidate(&self, block: u64) {
        self.shards[shard_of(&block)].lock().remove(block);
    }

    /// Invalidates everything by advancing the generation, e.g. after an
    /// index rebuild or an in-process recovery event.
    pub(crate) fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        for shard in &self.shards {
            shard.lock().clear();
        }
    }
}

/// Logical-id key of a metadata cache entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum MetaKey {
    Inode(u64),
    Vector(u64),
    Node(u64),
}

/// Parsed metadata value.
#[derive(Clone)]
pub(crate) enum MetaVal {
    Inode(Arc<InodeRecord>),
    Vector(Arc<VectorIndexEntry>),
    Node(Arc<NodeRecord>),
}

impl MetaVal {
    fn weight(&self) -> u64 {
        match self {
            Self::Inode(_) => 256,
            Self::Vector(_) => 64,
            Self::Node(record) => record.approx_bytes() as u64,
        }
    }
}

/// Typed metadata cache.
pub(crate) struct MetaCache {
    shards: Vec<Mutex<LruShard<MetaKey, MetaVal>>>,
    shard_budget: u64,
    generation: AtomicU64,
}

impl MetaCache {
    pub(crate) fn new(capacity_mib: u64, generation: u64) -> Self {
        let budget = (capacity_mib * 1024 * 1024 / SHARDS as u64).max(4096);
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(LruShard::new())).collect(),
            shard_budget: budget,
            generation: AtomicU64::new(generation),
        }
    }

    pub(crate) fn get(&self, key: MetaKey) -> Option<MetaVal> {
        let generation = self.generation.load(Ordering::Acquire);
        self.shards[shard_of(&key)].lock().get(key, generation)
    }

    pub(crate) fn insert(&self, key: MetaKey, value: MetaVal) {
        let generation = self.generation.load(Ordering::Acquire);
        let weight = value.weight();
        self.shards[shard_of(&key)]
            .lock()
            .insert(key, value, weight, generation, self.shard_budget);
    }

    pub(crate) fn invalidate(&self, key: MetaKey) {
        self.shards[shard_of(&key)].lock().remove(key);
    }

    pub(crate) fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        for shard in &self.shards {
            shard.lock().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lru_evicts_least_recent() {
        let mut shard: LruShard<u64, u64> = LruShard::new();
        // Budget of 3 unit-weight entries.
        shard.insert(1, 10, 1, 0, 3);
        shard.insert(2, 20, 1, 0, 3);
        shard.insert(3, 30, 1, 0, 3);
        // Touch 1 so 2 becomes the LRU victim.
        assert_eq!(shard.get(1, 0), Some(10));
        shard.insert(4, 40, 1, 0, 3);
        assert_eq!(shard.get(2, 0), None);
        assert_eq!(shard.get(1, 0), Some(10));
        assert_eq!(shard.get(3, 0), Some(30));
        assert_eq!(shard.get(4, 0), Some(40));
    }

    #[test]
    fn stale_generation_misses() {
        let cache = BlockCache::new(1, 7);
        cache.insert(5, Arc::new(vec![1u8; 4096]));
        assert!(cache.get(5).is_some());
        cache.bump_generation();
        assert!(cache.get(5).is_none());
    }

    #[test]
    fn reinsert_updates_size_accounting() {
        let mut shard: LruShard<u64, Vec<u8>> = LruShard::new();
        shard.insert(1, vec![0; 8], 8, 0, 100);
        shard.insert(1, vec![0; 16], 16, 0, 100);
        assert_eq!(shard.total_bytes, 16);
        shard.remove(1);
        assert_eq!(shard.total_bytes, 0);
        assert!(shard.head.is_none() && shard.tail.is_none());
    }

    #[test]
    fn oversized_entry_survives_alone() {
        let mut shard: LruShard<u64, u64> = LruShard::new();
        shard.insert(1, 1, 1000, 0, 10);
        // The sole entry exceeds the budget but is not self-evicted.
        assert_eq!(shard.get(1, 0), Some(1));
    }
}
