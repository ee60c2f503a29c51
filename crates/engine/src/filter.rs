//! Snapshot data filters.
//!
//! A filter sits between the streamer and a target. It may transform a block,
//! pass it through, or drop it.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tablesnap_core::PartitionId;
use tablesnap_durability::TableBlock;

/// One stage of a task's filter chain
pub trait SnapshotDataFilter: Send + Sync {
    /// Return the block to pass on, or `None` to drop it.
    fn filter(&self, block: TableBlock) -> Option<TableBlock>;

    /// Filter name for logging.
    fn name(&self) -> &str;
}

/// Run `block` through `filters` in order.
pub fn apply_filters(
    filters: &[std::sync::Arc<dyn SnapshotDataFilter>],
    block: TableBlock,
) -> Option<TableBlock> {
    filters.iter().try_fold(block, |block, f| f.filter(block))
}

/// Keeps only blocks produced by a set of partitions
#[derive(Debug, Clone)]
pub struct PartitionProjectionFilter {
    partitions: HashSet<PartitionId>,
}

impl PartitionProjectionFilter {
    /// Filter keeping `partitions`.
    pub fn new(partitions: impl IntoIterator<Item = PartitionId>) -> Self {
        PartitionProjectionFilter {
            partitions: partitions.into_iter().collect(),
        }
    }
}

impl SnapshotDataFilter for PartitionProjectionFilter {
    fn filter(&self, block: TableBlock) -> Option<TableBlock> {
        if self.partitions.contains(&block.partition_id()) {
            Some(block)
        } else {
            None
        }
    }

    fn name(&self) -> &str {
        "partition-projection"
    }
}

/// Running CRC32C over every block that passes
#[derive(Debug, Default)]
pub struct Crc32cFilter {
    crc: Mutex<u32>,
    blocks: AtomicU64,
}

impl Crc32cFilter {
    /// Filter with an empty checksum.
    pub fn new() -> Self {
        Self::default()
    }

    /// Checksum of all payloads seen so far, in order.
    pub fn value(&self) -> u32 {
        *self.crc.lock()
    }

    /// Blocks checksummed.
    pub fn blocks(&self) -> u64 {
        self.blocks.load(Ordering::Acquire)
    }
}

impl SnapshotDataFilter for Crc32cFilter {
    fn filter(&self, block: TableBlock) -> Option<TableBlock> {
        {
            let mut crc = self.crc.lock();
            *crc = crc32c::crc32c_append(*crc, block.payload());
        }
        self.blocks.fetch_add(1, Ordering::AcqRel);
        Some(block)
    }

    fn name(&self) -> &str {
        "crc32c"
    }
}
