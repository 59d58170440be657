use crate::core::PageRecord;
use crate::utils::Hash;
use log::debug;
use std::collections::{HashSet, VecDeque};

/// FIFO of page records waiting to be mined, deduplicated by record id.
///
/// Only the sync manager touches the pool, so it is a plain owned value with
/// no interior locking.
#[derive(Debug)]
pub struct PendingPool {
    queue: VecDeque<PageRecord>,
    ids: HashSet<Hash>,
}

impl Default for PendingPool {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingPool {
    pub fn new() -> PendingPool {
        PendingPool {
            queue: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    /// Queues a record at the back. Returns false if it was already queued.
    pub fn add(&mut self, record: PageRecord) -> bool {
        if !self.ids.insert(record.record_id()) {
            debug!("Record {} already pending", record.record_id().short());
            return false;
        }
        self.queue.push_back(record);
        true
    }

    /// Puts records back at the front, keeping their relative order. Used when
    /// a mining job is cancelled or a reorg orphans them.
    pub fn requeue_front(&mut self, records: Vec<PageRecord>) {
        for record in records.into_iter().rev() {
            if self.ids.insert(record.record_id()) {
                self.queue.push_front(record);
            }
        }
    }

    /// Takes up to `max` records from the front.
    pub fn take(&mut self, max: usize) -> Vec<PageRecord> {
        let count = max.min(self.queue.len());
        let taken: Vec<PageRecord> = self.queue.drain(..count).collect();
        for record in &taken {
            self.ids.remove(&record.record_id());
        }
        taken
    }

    /// Drops any queued record that is now part of an accepted block.
    pub fn remove_mined(&mut self, mined: &[PageRecord]) {
        let mined: HashSet<Hash> = mined.iter().map(PageRecord::record_id).collect();
        if mined.is_disjoint(&self.ids) {
            return;
        }
        self.queue.retain(|record| !mined.contains(&record.record_id()));
        self.ids.retain(|id| !mined.contains(id));
    }

    pub fn contains(&self, record_id: &Hash) -> bool {
        self.ids.contains(record_id)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn get_all(&self) -> Vec<PageRecord> {
        self.queue.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.ids.clear();
    }
}
