use std::collections::{HashMap, VecDeque};

use buildmgr_common::BuildRecord;

/// Bounded build-record cache with insertion-ordered (FIFO) eviction.
///
/// Reads never refresh an entry's position: the oldest-inserted key is always
/// the next one evicted, however recently it was read.
pub struct BuildCache {
    capacity: usize,
    order: VecDeque<String>,
    entries: HashMap<String, BuildRecord>,
}

impl BuildCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::with_capacity(capacity),
            entries: HashMap::with_capacity(capacity),
        }
    }

    pub fn get(&self, id: &str) -> Option<&BuildRecord> {
        self.entries.get(id)
    }

    /// Insert or replace. Replacing keeps the key's original position.
    pub fn insert(&mut self, record: BuildRecord) {
        if let Some(existing) = self.entries.get_mut(&record.id) {
            *existing = record;
            return;
        }

        if self.entries.len() >= self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.entries.remove(&oldest);
        }
        self.order.push_back(record.id.clone());
        self.entries.insert(record.id.clone(), record);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}
