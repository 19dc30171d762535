//! Bounded Message-Id Set
//!
//! Remembers the most recent `capacity` ids; the oldest is evicted first.

use std::collections::{HashSet, VecDeque};

#[derive(Debug, Clone)]
pub struct DedupSet {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl DedupSet {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Record an id; returns false if it was already present
    pub fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicates_detected() {
        let mut set = DedupSet::new(4);
        assert!(set.insert("a"));
        assert!(!set.insert("a"));
        assert!(set.contains("a"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_oldest_evicted_first() {
        let mut set = DedupSet::new(2);
        set.insert("a");
        set.insert("b");
        set.insert("c");

        assert!(!set.contains("a"));
        assert!(set.contains("b"));
        assert!(set.contains("c"));
        assert_eq!(set.len(), 2);

        // Evicted ids are new again
        assert!(set.insert("a"));
    }

    #[test]
    fn test_zero_capacity_still_dedups_latest() {
        let mut set = DedupSet::new(0);
        assert!(set.insert("a"));
        assert!(!set.insert("a"));
    }
}
