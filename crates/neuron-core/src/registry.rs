//! Sharded concurrent map
//!
//! The commander keeps its connected workers in a string-keyed map split into
//! 32 shards, each behind its own read/write lock. A key always lands on the
//! same shard, selected by a 32-bit FNV-style hash. Whole-map snapshots walk the
//! shards one after another and are consistent per shard only.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Number of independently locked shards
pub const SHARD_COUNT: usize = 32;

const FNV_OFFSET: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// 32-bit FNV hash, multiply then xor per byte
pub fn fnv32(key: &str) -> u32 {
    key.bytes().fold(FNV_OFFSET, |hash, byte| {
        hash.wrapping_mul(FNV_PRIME) ^ u32::from(byte)
    })
}

/// Index of the shard that owns `key`
pub fn shard_index(key: &str) -> usize {
    (fnv32(key) % SHARD_COUNT as u32) as usize
}

type Shard<V> = RwLock<HashMap<String, V>>;

/// String-keyed map split over [`SHARD_COUNT`] locked shards
#[derive(Debug)]
pub struct ShardedMap<V> {
    shards: Vec<Shard<V>>,
}

impl<V> Default for ShardedMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> ShardedMap<V> {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &str) -> &Shard<V> {
        &self.shards[shard_index(key)]
    }

    fn read(shard: &Shard<V>) -> RwLockReadGuard<'_, HashMap<String, V>> {
        shard.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(shard: &Shard<V>) -> RwLockWriteGuard<'_, HashMap<String, V>> {
        shard.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace, returning the previous value
    pub fn set(&self, key: impl Into<String>, value: V) -> Option<V> {
        let key = key.into();
        Self::write(self.shard(&key)).insert(key, value)
    }

    /// Insert many entries, locking each touched shard once per entry
    pub fn set_bulk(&self, entries: impl IntoIterator<Item = (String, V)>) {
        for (key, value) in entries {
            Self::write(self.shard(&key)).insert(key, value);
        }
    }

    /// Remove and return the value under `key`
    pub fn pop(&self, key: &str) -> Option<V> {
        Self::write(self.shard(key)).remove(key)
    }

    /// Remove `key`, reporting whether it was present
    pub fn delete(&self, key: &str) -> bool {
        self.pop(key).is_some()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        Self::read(self.shard(key)).contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| Self::read(shard).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| Self::read(shard).is_empty())
    }

    /// All keys, sorted ascending
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .shards
            .iter()
            .flat_map(|shard| Self::read(shard).keys().cloned().collect::<Vec<_>>())
            .collect();
        keys.sort();
        keys
    }

    /// Visit entries until `f` returns false
    ///
    /// `f` receives a running index, the key and the value. Each shard's read
    /// lock is held while its entries are visited.
    pub fn iterate(&self, mut f: impl FnMut(usize, &str, &V) -> bool) {
        let mut index = 0;
        for shard in &self.shards {
            let guard = Self::read(shard);
            for (key, value) in guard.iter() {
                if !f(index, key, value) {
                    return;
                }
                index += 1;
            }
        }
    }

    /// Run `f` under the write lock of the shard owning `key`
    ///
    /// `f` sees the entry mutably, or `None` when the key is absent.
    pub fn atomic_section<R>(&self, key: &str, f: impl FnOnce(Option<&mut V>) -> R) -> R {
        let mut guard = Self::write(self.shard(key));
        f(guard.get_mut(key))
    }

    /// Remove every entry and return them
    pub fn drain(&self) -> Vec<(String, V)> {
        self.shards
            .iter()
            .flat_map(|shard| Self::write(shard).drain().collect::<Vec<_>>())
            .collect()
    }
}

impl<V: Clone> ShardedMap<V> {
    pub fn get(&self, key: &str) -> Option<V> {
        Self::read(self.shard(key)).get(key).cloned()
    }

    /// All values, in shard order
    pub fn values(&self) -> Vec<V> {
        self.shards
            .iter()
            .flat_map(|shard| Self::read(shard).values().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Snapshot of the whole map
    pub fn to_map(&self) -> HashMap<String, V> {
        let mut map = HashMap::new();
        for shard in &self.shards {
            map.extend(
                Self::read(shard)
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone())),
            );
        }
        map
    }
}
