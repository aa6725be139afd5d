//! Bounded, priority-ordered queue of discovered-but-unfetched items.

use std::collections::{BTreeMap, HashMap, VecDeque};

use tracing::debug;

use samplegraph_shared::{ItemId, PendingItem};

/// What [`PendingQueue::push`] did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Inserted,
    /// Already queued; moved up to the higher incoming priority.
    Promoted,
    /// Already queued at an equal or higher priority.
    Duplicate,
    /// Queue was full; the named lower-priority record made room.
    Evicted(ItemId),
    /// Queue was full and the incoming record ranked below everything queued.
    Dropped,
}

impl EnqueueOutcome {
    /// Whether capacity pressure cost a record.
    pub fn is_queue_full(self) -> bool {
        matches!(self, Self::Evicted(_) | Self::Dropped)
    }
}

/// Fixed-capacity queue; pops highest priority first, FIFO within a priority.
///
/// When full, the oldest record of the lowest priority is evicted.
#[derive(Debug, Clone)]
pub struct PendingQueue {
    capacity: usize,
    buckets: BTreeMap<u8, VecDeque<PendingItem>>,
    members: HashMap<ItemId, u8>,
}

impl PendingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buckets: BTreeMap::new(),
            members: HashMap::new(),
        }
    }

    /// Rebuild a queue from records in pop order.
    pub fn from_items(capacity: usize, items: impl IntoIterator<Item = PendingItem>) -> Self {
        let mut queue = Self::new(capacity);
        for item in items {
            queue.push(item);
        }
        queue
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: ItemId) -> bool {
        self.members.contains_key(&id)
    }

    pub fn push(&mut self, item: PendingItem) -> EnqueueOutcome {
        if let Some(&queued) = self.members.get(&item.id) {
            if item.priority <= queued {
                return EnqueueOutcome::Duplicate;
            }
            self.remove_from_bucket(item.id, queued);
            self.insert(item);
            return EnqueueOutcome::Promoted;
        }

        if self.len() < self.capacity {
            self.insert(item);
            return EnqueueOutcome::Inserted;
        }

        let lowest = self.buckets.keys().next().copied();
        match lowest {
            Some(lowest) if item.priority >= lowest => {
                let evicted = self.pop_from(lowest);
                self.insert(item);
                match evicted {
                    Some(evicted) => {
                        debug!(evicted = %evicted.id, capacity = self.capacity, "pending queue full, evicted oldest low-priority item");
                        EnqueueOutcome::Evicted(evicted.id)
                    }
                    None => EnqueueOutcome::Inserted,
                }
            }
            _ => {
                debug!(dropped = %item.id, capacity = self.capacity, "pending queue full, dropped item");
                EnqueueOutcome::Dropped
            }
        }
    }

    /// Remove and return the highest-priority, oldest record.
    pub fn pop(&mut self) -> Option<PendingItem> {
        let highest = *self.buckets.keys().next_back()?;
        self.pop_from(highest)
    }

    /// Pop up to `limit` records, discarding any for which `skip` returns true.
    pub fn pop_batch(&mut self, limit: usize, skip: impl Fn(ItemId) -> bool) -> Vec<PendingItem> {
        let mut batch = Vec::with_capacity(limit.min(self.len()));
        while batch.len() < limit {
            let Some(item) = self.pop() else { break };
            if skip(item.id) {
                continue;
            }
            batch.push(item);
        }
        batch
    }

    pub fn remove(&mut self, id: ItemId) -> bool {
        match self.members.get(&id).copied() {
            Some(priority) => {
                self.remove_from_bucket(id, priority);
                true
            }
            None => false,
        }
    }

    /// Records in pop order.
    pub fn to_vec(&self) -> Vec<PendingItem> {
        self.buckets
            .values()
            .rev()
            .flat_map(|bucket| bucket.iter().cloned())
            .collect()
    }

    fn insert(&mut self, item: PendingItem) {
        self.members.insert(item.id, item.priority);
        self.buckets.entry(item.priority).or_default().push_back(item);
    }

    fn pop_from(&mut self, priority: u8) -> Option<PendingItem> {
        let bucket = self.buckets.get_mut(&priority)?;
        let item = bucket.pop_front();
        if bucket.is_empty() {
            self.buckets.remove(&priority);
        }
        if let Some(item) = &item {
            self.members.remove(&item.id);
        }
        item
    }

    fn remove_from_bucket(&mut self, id: ItemId, priority: u8) {
        if let Some(bucket) = self.buckets.get_mut(&priority) {
            bucket.retain(|queued| queued.id != id);
            if bucket.is_empty() {
                self.buckets.remove(&priority);
            }
        }
        self.members.remove(&id);
    }
}
