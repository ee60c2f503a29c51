//! Snapshot data targets.
//!
//! A target is the sink for one table's snapshot file. The table streamer
//! hands it deferred blocks through [`SnapshotDataTarget::write`]; the target
//! compresses, frames and persists them in submission order and reports each
//! outcome through a [`WriteHandle`].
//!
//! Two strategies implement the contract:
//!
//! - [`DefaultSnapshotDataTarget`]: buffered writes through the page cache,
//!   bounded by the process-wide byte budget and a periodic sync task
//! - [`DirectIoSnapshotDataTarget`]: page-aligned writes from pooled buffers,
//!   opened with `O_DIRECT` where the filesystem allows it
//!
//! [`SnapshotTargetFactory`] picks the strategy for a snapshot generation.

mod buffered;
mod direct_io;
mod factory;
mod native;
mod sys;

pub use buffered::DefaultSnapshotDataTarget;
pub use direct_io::DirectIoSnapshotDataTarget;
pub use factory::{probe_direct_io, SnapshotTargetFactory};

use crate::byte_budget::ByteBudget;
use crate::codec::{BlockCodec, ZstdCodec};
use crate::completion::WriteHandle;
use crate::format::block::BLOCK_HEADER_SIZE;
use crate::format::header::SnapshotMetadata;
use crate::rate_limiter::RateLimiter;
use crate::testing::FaultInjector;
use byteorder::{BigEndian, ByteOrder};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tablesnap_core::{fatal_invariant, FormatVersion, PartitionId, Result, SnapshotConfig, SnapshotError, TableId};

/// One serialized block of tuples
///
/// `data` may carry headroom in front of the block (reserved by the streamer
/// for the block header); the block itself starts at `offset` with its 4-byte
/// partition id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableBlock {
    data: Vec<u8>,
    offset: usize,
}

impl TableBlock {
    /// Block occupying `data[offset..]`.
    pub fn new(data: Vec<u8>, offset: usize) -> Self {
        if data.len() < offset + 4 {
            fatal_invariant(format!(
                "table block of {} bytes at offset {} cannot hold a partition id",
                data.len(),
                offset
            ));
        }
        TableBlock { data, offset }
    }

    /// Block with no headroom.
    pub fn from_payload(payload: Vec<u8>) -> Self {
        Self::new(payload, 0)
    }

    /// Raw block: partition id followed by tuples.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.offset..]
    }

    /// Partition that produced the block.
    pub fn partition_id(&self) -> PartitionId {
        PartitionId(BigEndian::read_i32(&self.data[self.offset..]))
    }

    /// Length of the raw block.
    pub fn len(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Always false; a block holds at least a partition id.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Headroom in front of the block.
    pub fn headroom(&self) -> usize {
        self.offset
    }
}

/// Result of invoking a block supplier
#[derive(Debug)]
pub enum BlockPayload {
    /// A block to persist
    Pending(TableBlock),
    /// Nothing to write
    Empty,
}

/// Deferred producer of a block, invoked exactly once by the target.
pub type BlockSupplier = Box<dyn FnOnce() -> BlockPayload + Send>;

/// Callback run once at the end of [`SnapshotDataTarget::close`] with its result.
pub type OnCloseHandler = Box<dyn FnOnce(&Result<()>) + Send>;

/// I/O strategy of a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetStrategy {
    /// Page-cache writes with periodic range syncs
    Buffered,
    /// Page-aligned writes from pooled buffers
    DirectIo,
}

impl fmt::Display for TargetStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetStrategy::Buffered => write!(f, "buffered"),
            TargetStrategy::DirectIo => write!(f, "direct-io"),
        }
    }
}

/// Sink for one table's snapshot data
///
/// # Contract
///
/// - `write` never fails synchronously for I/O problems; outcomes arrive via
///   the returned handle and `last_write_error`
/// - blocks of one target reach the file in `write` order
/// - after a physical write failure the target is poisoned: later writes run
///   their supplier, discard the block and fail immediately
/// - `close` waits for every accepted write, marks the file complete only if
///   nothing failed, and may be called once
pub trait SnapshotDataTarget: Send + Sync {
    /// Accept a deferred block for `table_id`.
    fn write(&self, supplier: BlockSupplier, table_id: TableId) -> WriteHandle;

    /// Drain, finalize and release the target.
    fn close(&self) -> Result<()>;

    /// Bytes persisted so far, header included.
    fn bytes_written(&self) -> u64;

    /// The physical write failure that poisoned the target, if any.
    fn last_write_error(&self) -> Option<SnapshotError>;

    /// Record that the scan engine failed to serialize this table.
    fn report_serialization_failure(&self, err: SnapshotError);

    /// The recorded serialization failure, if any.
    fn serialization_error(&self) -> Option<SnapshotError>;

    /// Headroom the streamer reserves in front of every buffer.
    fn header_size(&self) -> usize {
        BLOCK_HEADER_SIZE
    }

    /// Whether the scheduler must call `close` after the last write.
    fn needs_final_close(&self) -> bool {
        true
    }

    /// Row count stored inside a block, for formats that keep one.
    fn in_container_row_count(&self, _block: &TableBlock) -> Option<u32> {
        None
    }

    /// Install the callback run at the end of `close`.
    fn set_on_close_handler(&self, handler: OnCloseHandler);

    /// Path of the snapshot file.
    fn path(&self) -> &Path;

    /// I/O strategy in use.
    fn strategy(&self) -> TargetStrategy;
}

/// Everything needed to open one table's snapshot file
#[derive(Debug, Clone)]
pub struct TargetSpec {
    /// File to create
    pub path: PathBuf,
    /// Header metadata
    pub metadata: SnapshotMetadata,
    /// Format version written in the header
    pub version: FormatVersion,
    /// Serialized column schema
    pub schema: Vec<u8>,
}

impl TargetSpec {
    /// Target description with the current format version.
    pub fn new(path: impl Into<PathBuf>, metadata: SnapshotMetadata, schema: Vec<u8>) -> Self {
        TargetSpec {
            path: path.into(),
            metadata,
            version: FormatVersion::CURRENT,
            schema,
        }
    }
}

/// Shared collaborators of every target
///
/// Production code uses [`TargetResources::global`]; tests build isolated
/// instances so concurrent tests do not share a budget or a rate limiter.
#[derive(Clone)]
pub struct TargetResources {
    /// Written-but-unsynced byte budget
    pub budget: Arc<ByteBudget>,
    /// Write rate limiter
    pub rate_limiter: Arc<RateLimiter>,
    /// Block codec
    pub codec: Arc<dyn BlockCodec>,
    /// Optional write fault injection
    pub faults: Option<Arc<FaultInjector>>,
}

impl TargetResources {
    /// Process-wide budget and rate limiter, zstd codec.
    pub fn global() -> Self {
        TargetResources {
            budget: ByteBudget::global(),
            rate_limiter: RateLimiter::global(),
            codec: Arc::new(ZstdCodec::default()),
            faults: None,
        }
    }

    /// Private budget and rate limiter sized from `config`.
    pub fn isolated(config: &SnapshotConfig) -> Self {
        TargetResources {
            budget: Arc::new(ByteBudget::new(config.bytes_before_sync)),
            rate_limiter: Arc::new(RateLimiter::new(config.rate_limit_bytes_per_sec())),
            codec: Arc::new(ZstdCodec::default()),
            faults: None,
        }
    }

    /// Replace the codec (builder pattern).
    pub fn with_codec(mut self, codec: Arc<dyn BlockCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Install a fault injector (builder pattern).
    pub fn with_faults(mut self, faults: Arc<FaultInjector>) -> Self {
        self.faults = Some(faults);
        self
    }

    /// Replace the byte budget (builder pattern).
    pub fn with_budget(mut self, budget: Arc<ByteBudget>) -> Self {
        self.budget = budget;
        self
    }

    /// Replace the rate limiter (builder pattern).
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = limiter;
        self
    }
}

impl fmt::Debug for TargetResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetResources")
            .field("budget_capacity", &self.budget.capacity())
            .field("rate_limit", &self.rate_limiter.bytes_per_sec())
            .field("codec", &self.codec.codec_id())
            .field("faults", &self.faults.is_some())
            .finish()
    }
}
