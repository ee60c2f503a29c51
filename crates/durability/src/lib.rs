//! Snapshot persistence for tablesnap
//!
//! This crate handles everything that touches disk while a table snapshot is
//! taken:
//!
//! - Snapshot file format: CRC-protected header, framed compressed blocks
//! - Snapshot data targets: buffered and direct-I/O strategies
//! - Backpressure: process-wide byte budget and write rate limiter
//! - Page-aligned memory pool for direct I/O
//! - Pipeline threads: per-target task queues and the shared sync scheduler
//! - Digest files and table file naming
//! - Fault injection for tests

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod byte_budget; // Written-but-unsynced byte budget
pub mod codec; // Block compression
pub mod completion; // Write handles and one-shot values
pub mod executor; // Task queues, periodic scheduler, compression pool
pub mod format; // On-disk snapshot format
pub mod memory_pool; // Page-aligned buffer pool
pub mod rate_limiter; // Token bucket write limiter
pub mod target; // SnapshotDataTarget and its strategies
pub mod testing; // Fault injection

// === Re-exports ===
pub use byte_budget::ByteBudget;
pub use codec::{get_codec, BlockCodec, CodecError, CompressedBlock, IdentityCodec, ZstdCodec};
pub use completion::{Completion, WriteHandle};
pub use format::{
    read_digest, serialize_header, table_file_name, verify_header_crc, write_digest, BlockReader,
    FramedBlock, HeaderView, SnapshotDigest, SnapshotHeader, SnapshotMetadata, BLOCK_HEADER_SIZE,
    BLOCK_TRAILER_SIZE, COMPLETION_FLAG_OFFSET,
};
pub use memory_pool::{MemoryPool, PoolRef, PoolStats, PooledPage};
pub use rate_limiter::{enforce_snapshot_rate_limit, set_rate_limit_enforcement, RateLimiter};
pub use target::{
    BlockPayload, BlockSupplier, DefaultSnapshotDataTarget, DirectIoSnapshotDataTarget,
    OnCloseHandler, SnapshotDataTarget, SnapshotTargetFactory, TableBlock, TargetResources,
    TargetSpec, TargetStrategy,
};
pub use testing::FaultInjector;
