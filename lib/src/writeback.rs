// Copyright 2023 The Mtn Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! An LRU cache with dirty tracking and write-out on eviction.
//!
//! The database keeps reconstructed rosters here; writing a roster first
//! lands in this cache as a dirty entry, and only reaches the store when
//! the entry is evicted for space or the transaction commits. Eviction of
//! a dirty entry must hand the entry to a write-out function, which is
//! why this is a dedicated structure rather than a plain LRU: a clean
//! cache may drop entries silently, a write-back cache may not.

use std::collections::BTreeMap;

#[derive(Debug)]
struct Entry<V> {
    value: V,
    weight: usize,
    dirty: bool,
    stamp: u64,
}

#[derive(Debug)]
pub struct LruWritebackCache<K, V> {
    entries: BTreeMap<K, Entry<V>>,
    recency: BTreeMap<u64, K>,
    next_stamp: u64,
    total_weight: usize,
    max_weight: usize,
    /// Entries kept even when over budget; a cache too small for its
    /// working set must not thrash every insert into a write.
    min_count: usize,
}

impl<K: Ord + Clone, V: Clone> LruWritebackCache<K, V> {
    pub fn new(max_weight: usize, min_count: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            recency: BTreeMap::new(),
            next_stamp: 0,
            total_weight: 0,
            max_weight,
            min_count,
        }
    }

    pub fn exists(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn is_dirty(&self, key: &K) -> bool {
        self.entries.get(key).is_some_and(|entry| entry.dirty)
    }

    pub fn all_clean(&self) -> bool {
        self.entries.values().all(|entry| !entry.dirty)
    }

    fn touch(&mut self, key: &K) {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        let entry = self.entries.get_mut(key).unwrap();
        self.recency.remove(&entry.stamp);
        entry.stamp = stamp;
        self.recency.insert(stamp, key.clone());
    }

    /// Fetches and refreshes recency.
    pub fn fetch(&mut self, key: &K) -> Option<V> {
        if !self.entries.contains_key(key) {
            return None;
        }
        self.touch(key);
        Some(self.entries[key].value.clone())
    }

    pub fn insert_clean<E>(
        &mut self,
        key: K,
        value: V,
        weight: usize,
        writeout: impl FnMut(&K, &V) -> Result<(), E>,
    ) -> Result<(), E> {
        self.insert(key, value, weight, false, writeout)
    }

    pub fn insert_dirty<E>(
        &mut self,
        key: K,
        value: V,
        weight: usize,
        writeout: impl FnMut(&K, &V) -> Result<(), E>,
    ) -> Result<(), E> {
        self.insert(key, value, weight, true, writeout)
    }

    fn insert<E>(
        &mut self,
        key: K,
        value: V,
        weight: usize,
        dirty: bool,
        mut writeout: impl FnMut(&K, &V) -> Result<(), E>,
    ) -> Result<(), E> {
        if let Some(old) = self.entries.remove(&key) {
            assert!(!old.dirty || dirty, "dirty entry overwritten with clean data");
            self.recency.remove(&old.stamp);
            self.total_weight -= old.weight;
        }
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        self.recency.insert(stamp, key.clone());
        self.entries.insert(
            key,
            Entry {
                value,
                weight,
                dirty,
                stamp,
            },
        );
        self.total_weight += weight;
        self.evict_over_budget(&mut writeout)
    }

    fn evict_over_budget<E>(
        &mut self,
        writeout: &mut impl FnMut(&K, &V) -> Result<(), E>,
    ) -> Result<(), E> {
        while self.total_weight > self.max_weight && self.entries.len() > self.min_count {
            let (&stamp, _) = self.recency.iter().next().unwrap();
            let key = self.recency.remove(&stamp).unwrap();
            let entry = self.entries.remove(&key).unwrap();
            self.total_weight -= entry.weight;
            if entry.dirty {
                writeout(&key, &entry.value)?;
            }
        }
        Ok(())
    }

    /// Marks one entry clean without writing it (its data reached the
    /// store through some other path).
    pub fn mark_clean(&mut self, key: &K) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.dirty = false;
        }
    }

    /// Writes out every dirty entry and marks it clean. Runs at
    /// transaction commit.
    pub fn clean_all<E>(
        &mut self,
        mut writeout: impl FnMut(&K, &V) -> Result<(), E>,
    ) -> Result<(), E> {
        for (key, entry) in &mut self.entries {
            if entry.dirty {
                writeout(key, &entry.value)?;
                entry.dirty = false;
            }
        }
        Ok(())
    }

    /// Discards everything, dirty entries included. Runs at rollback.
    pub fn clear_and_drop_writes(&mut self) {
        self.entries.clear();
        self.recency.clear();
        self.total_weight = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Cache = LruWritebackCache<u32, String>;

    fn no_writes(key: &u32, _value: &String) -> Result<(), String> {
        Err(format!("unexpected writeout of {key}"))
    }

    #[test]
    fn eviction_writes_dirty_entries_lru_first() {
        let mut cache = Cache::new(10, 0);
        let written = std::cell::RefCell::new(Vec::new());
        let mut writeout = |key: &u32, value: &String| {
            written.borrow_mut().push((*key, value.clone()));
            Ok::<(), String>(())
        };
        cache.insert_dirty(1, "one".into(), 5, &mut writeout).unwrap();
        cache.insert_dirty(2, "two".into(), 5, &mut writeout).unwrap();
        assert!(written.borrow().is_empty());
        // touching 1 makes 2 the eviction candidate
        assert_eq!(cache.fetch(&1), Some("one".into()));
        cache.insert_dirty(3, "three".into(), 5, &mut writeout).unwrap();
        assert_eq!(*written.borrow(), vec![(2, "two".into())]);
        assert!(!cache.exists(&2));
        assert!(cache.exists(&1) && cache.exists(&3));
    }

    #[test]
    fn min_count_keeps_oversized_entries() {
        let mut cache = Cache::new(1, 1);
        cache.insert_dirty(1, "big".into(), 100, no_writes).unwrap();
        assert!(cache.exists(&1));
    }

    #[test]
    fn clean_all_writes_each_dirty_entry_once() {
        let mut cache = Cache::new(100, 0);
        cache.insert_dirty(1, "one".into(), 1, no_writes).unwrap();
        cache.insert_clean(2, "two".into(), 1, no_writes).unwrap();
        assert!(!cache.all_clean());
        let mut written = Vec::new();
        cache
            .clean_all(|key: &u32, _: &String| {
                written.push(*key);
                Ok::<(), String>(())
            })
            .unwrap();
        assert_eq!(written, vec![1]);
        assert!(cache.all_clean());
        cache.clean_all(no_writes).unwrap();
    }

    #[test]
    fn rollback_discards_dirty_entries() {
        let mut cache = Cache::new(100, 0);
        cache.insert_dirty(1, "one".into(), 1, no_writes).unwrap();
        cache.clear_and_drop_writes();
        assert!(!cache.exists(&1));
        assert!(cache.all_clean());
    }
}
