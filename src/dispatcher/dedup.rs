use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

/// Remembers the most recent `capacity` keys.
/// Oldest keys are evicted first once the window is full.
#[derive(Debug)]
pub struct DedupWindow<K> {
    capacity: usize,
    seen: HashSet<K>,
    order: VecDeque<K>,
}

impl<K: Eq + Hash + Clone> DedupWindow<K> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Record `key`. Returns false if it is already in the window.
    pub fn insert(&mut self, key: K) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    #[cfg(test)]
    pub fn contains(&self, key: &K) -> bool {
        self.seen.contains(key)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.order.len()
    }
}
