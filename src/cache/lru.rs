//! LRU (Least Recently Used) tracking

use std::collections::{HashMap, VecDeque};

/// Recency tracker for cache keys
///
/// Touching a key pushes a fresh `(key, generation)` record instead of
/// moving the old one; stale records are skipped when popping.
pub struct LruCache<K: Clone + Eq + std::hash::Hash> {
    /// Access records (front = oldest)
    order: VecDeque<(K, u64)>,
    /// Latest generation per live key
    latest: HashMap<K, u64>,
    generation: u64,
}

impl<K: Clone + Eq + std::hash::Hash> LruCache<K> {
    pub fn new() -> Self {
        LruCache {
            order: VecDeque::new(),
            latest: HashMap::new(),
            generation: 0,
        }
    }

    /// Insert a key as most recently used
    pub fn insert(&mut self, key: K) {
        self.generation += 1;
        self.latest.insert(key.clone(), self.generation);
        self.order.push_back((key, self.generation));
        self.maybe_compact();
    }

    /// Mark a tracked key as recently used
    pub fn touch(&mut self, key: &K) {
        if self.latest.contains_key(key) {
            self.insert(key.clone());
        }
    }

    pub fn remove(&mut self, key: &K) {
        self.latest.remove(key);
    }

    /// Pop the least recently used key
    pub fn pop_oldest(&mut self) -> Option<K> {
        while let Some((key, gen)) = self.order.pop_front() {
            if self.latest.get(&key) == Some(&gen) {
                self.latest.remove(&key);
                return Some(key);
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.latest.clear();
        self.generation = 0;
    }

    /// Drop stale records once they dominate the queue
    fn maybe_compact(&mut self) {
        if self.order.len() > 64 && self.order.len() > 4 * self.latest.len() {
            let latest = &self.latest;
            self.order.retain(|(k, g)| latest.get(k) == Some(g));
        }
    }
}

impl<K: Clone + Eq + std::hash::Hash> Default for LruCache<K> {
    fn default() -> Self {
        Self::new()
    }
}
