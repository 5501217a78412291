use std::collections::{HashSet, VecDeque};

/// Default number of message ids remembered.
pub const DEFAULT_DEDUP_CAPACITY: usize = 500;

/// Bounded set of recently seen message ids with strict FIFO eviction.
///
/// Lookups never refresh an entry's position; the oldest insertion is
/// always the next to go.
#[derive(Debug, Clone)]
pub struct DedupWindow {
    capacity: usize,
    order: VecDeque<String>,
    lookup: HashSet<String>,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            lookup: HashSet::with_capacity(capacity),
        }
    }

    /// Record `id`. Returns `false` when it was already present.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.lookup.contains(id) {
            return false;
        }

        let owned = id.to_string();
        self.lookup.insert(owned.clone());
        self.order.push_back(owned);

        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.lookup.remove(&evicted);
            }
        }

        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lookup.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}
