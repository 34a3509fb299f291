//! The memory store maps hashed keys to decoded images, shared as
//! `Arc`s.  It has no capacity of its own by default: entries stay
//! until the host signals memory pressure, at which point every entry
//! that no caller still holds is released.  Entries that callers hold
//! survive, since dropping them would not free anything anyway.
//!
//! Hosts without a pressure signal can set a cost budget instead;
//! inserts then evict the least recently used entries until the total
//! cost fits.
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::key::HashedKey;

struct MemoryEntry<I> {
    image: Arc<I>,
    cost: usize,
    // Logical clock value of the last `get` or `put`.
    last_access: u64,
}

struct Entries<I> {
    map: HashMap<HashedKey, MemoryEntry<I>>,
    total_cost: usize,
    clock: u64,
}

impl<I> Entries<I> {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn remove(&mut self, key: &HashedKey) -> Option<MemoryEntry<I>> {
        let entry = self.map.remove(key)?;
        self.total_cost -= entry.cost;
        Some(entry)
    }

    /// Evicts least recently used entries, never `keep`, until the
    /// total cost fits in `budget`.
    fn evict_to(&mut self, budget: usize, keep: &HashedKey) {
        while self.total_cost > budget {
            let oldest = self
                .map
                .iter()
                .filter(|(k, _)| *k != keep)
                .min_by_key(|(_, v)| v.last_access)
                .map(|(k, _)| k.clone());

            match oldest {
                Some(key) => {
                    self.remove(&key);
                }
                None => break,
            }
        }
    }
}

/// Thread-safe map from [`HashedKey`] to decoded images.
pub struct MemoryStore<I> {
    entries: Mutex<Entries<I>>,
    budget: Option<usize>,
}

impl<I> std::fmt::Debug for MemoryStore<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.lock();

        f.debug_struct("MemoryStore")
            .field("len", &entries.map.len())
            .field("total_cost", &entries.total_cost)
            .field("budget", &self.budget)
            .finish()
    }
}

impl<I> Default for MemoryStore<I> {
    fn default() -> Self {
        MemoryStore::new(None)
    }
}

impl<I> MemoryStore<I> {
    /// Returns an empty store.  With a `budget`, inserts evict least
    /// recently used entries to keep the total cost within it.
    pub fn new(budget: Option<usize>) -> Self {
        MemoryStore {
            entries: Mutex::new(Entries {
                map: HashMap::new(),
                total_cost: 0,
                clock: 0,
            }),
            budget,
        }
    }

    /// Returns the image for `key`, if resident.
    pub fn get(&self, key: &HashedKey) -> Option<Arc<I>> {
        let mut entries = self.entries.lock();
        let now = entries.tick();
        let entry = entries.map.get_mut(key)?;

        entry.last_access = now;
        Some(Arc::clone(&entry.image))
    }

    /// Returns whether `key` is resident, without counting as an
    /// access.
    pub fn contains(&self, key: &HashedKey) -> bool {
        self.entries.lock().map.contains_key(key)
    }

    /// Inserts or replaces the image for `key`, with the given cost
    /// against the budget.
    pub fn put(&self, key: HashedKey, image: Arc<I>, cost: usize) {
        let mut entries = self.entries.lock();
        let now = entries.tick();

        entries.remove(&key);
        entries.total_cost += cost;
        entries.map.insert(
            key.clone(),
            MemoryEntry {
                image,
                cost,
                last_access: now,
            },
        );

        if let Some(budget) = self.budget {
            entries.evict_to(budget, &key);
        }
    }

    /// Drops the image for `key`, if any.
    pub fn remove(&self, key: &HashedKey) {
        self.entries.lock().remove(key);
    }

    /// Drops every image.
    pub fn clear(&self) {
        let mut entries = self.entries.lock();

        entries.map.clear();
        entries.total_cost = 0;
    }

    /// Releases every image that no caller currently holds.  Returns
    /// the number of entries released.
    pub fn release_unused(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.map.len();

        entries.map.retain(|_, v| Arc::strong_count(&v.image) > 1);
        entries.total_cost = entries.map.values().map(|v| v.cost).sum();
        before - entries.map.len()
    }

    /// Returns the number of resident images.
    pub fn len(&self) -> usize {
        self.entries.lock().map.len()
    }

    /// Returns whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the total cost of resident images.
    pub fn total_cost(&self) -> usize {
        self.entries.lock().total_cost
    }
}
