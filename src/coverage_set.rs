//! Deduplicated, concurrently writable set of block records
//!
//! Records are keyed by their canonical 8-byte encoding. The set is split
//! into independently locked shards so producers on different threads
//! rarely contend; a record always hashes to the same shard, which keeps
//! the dedup guarantee under arbitrary interleaving.

use crate::block::{BlockRecord, EncodedBlock, BLOCK_RECORD_SIZE};
use fnv::{FnvHashSet, FnvHasher};
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Default number of shards (power of two)
pub const DEFAULT_SHARDS: usize = 16;

/// Shared set of covered blocks for one session
#[derive(Debug)]
pub struct CoverageSet {
    shards: Box<[Mutex<FnvHashSet<EncodedBlock>>]>,
}

impl CoverageSet {
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    /// Create a set with `shards` lock domains (rounded up to a power of two)
    pub fn with_shards(shards: usize) -> Self {
        let count = shards.max(1).next_power_of_two();
        let shards = (0..count)
            .map(|_| Mutex::new(FnvHashSet::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { shards }
    }

    fn shard(&self, key: &EncodedBlock) -> MutexGuard<'_, FnvHashSet<EncodedBlock>> {
        let mut hasher = FnvHasher::default();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) & (self.shards.len() - 1);
        // A panicking producer cannot leave a half-inserted key behind
        self.shards[idx]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a record, returning `true` if it was not already present
    pub fn insert(&self, record: BlockRecord) -> bool {
        let key = record.to_bytes();
        self.shard(&key).insert(key)
    }

    pub fn contains(&self, record: &BlockRecord) -> bool {
        let key = record.to_bytes();
        self.shard(&key).contains(&key)
    }

    /// Number of unique records
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy out every record, sorted by module, offset and size
    pub fn snapshot(&self) -> CoverageSnapshot {
        let mut records: Vec<BlockRecord> = Vec::new();
        for shard in self.shards.iter() {
            let shard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            records.extend(shard.iter().map(BlockRecord::from_bytes));
        }
        records.sort_unstable_by_key(BlockRecord::sort_key);
        CoverageSnapshot { records }
    }

    /// Drop all records (only between independent sessions)
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.lock().unwrap_or_else(PoisonError::into_inner).clear();
        }
    }
}

impl Default for CoverageSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only copy of the coverage set at one point in time
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CoverageSnapshot {
    records: Vec<BlockRecord>,
}

impl CoverageSnapshot {
    pub fn records(&self) -> &[BlockRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Concatenated canonical encodings
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.records.len() * BLOCK_RECORD_SIZE);
        for record in &self.records {
            out.extend_from_slice(&record.to_bytes());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_insert_reports_novelty() {
        let set = CoverageSet::new();
        let record = BlockRecord::new(0, 0x50, 16);
        assert!(set.insert(record));
        assert!(!set.insert(record));
        assert_eq!(set.len(), 1);
        assert!(set.contains(&record));
    }

    #[test]
    fn test_same_offset_different_module_is_distinct() {
        let set = CoverageSet::new();
        assert!(set.insert(BlockRecord::new(0, 0x50, 16)));
        assert!(set.insert(BlockRecord::new(1, 0x50, 16)));
        assert!(set.insert(BlockRecord::new(0, 0x50, 17)));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_snapshot_sorted_and_encoded() {
        let set = CoverageSet::with_shards(4);
        set.insert(BlockRecord::new(1, 0x200, 4));
        set.insert(BlockRecord::new(0, 0x50, 16));

        let snapshot = set.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.records()[0], BlockRecord::new(0, 0x50, 16));
        assert_eq!(
            snapshot.to_bytes(),
            vec![0x50, 0, 0, 0, 0x10, 0, 0, 0, 0x00, 0x02, 0, 0, 0x04, 0, 0x01, 0]
        );
    }

    #[test]
    fn test_shard_count_rounds_to_power_of_two() {
        let set = CoverageSet::with_shards(5);
        assert_eq!(set.shards.len(), 8);
        let set = CoverageSet::with_shards(0);
        assert_eq!(set.shards.len(), 1);
    }

    #[test]
    fn test_concurrent_duplicates_collapse() {
        let set = Arc::new(CoverageSet::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let set = Arc::clone(&set);
                thread::spawn(move || {
                    let mut new = 0;
                    for offset in 0..1000u32 {
                        if set.insert(BlockRecord::new(0, offset, 4)) {
                            new += 1;
                        }
                    }
                    new
                })
            })
            .collect();

        let total_new: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total_new, 1000);
        assert_eq!(set.len(), 1000);
    }

    #[test]
    fn test_clear_empties_all_shards() {
        let set = CoverageSet::new();
        for offset in 0..64 {
            set.insert(BlockRecord::new(0, offset, 1));
        }
        set.clear();
        assert!(set.is_empty());
        assert!(set.snapshot().is_empty());
    }
}
