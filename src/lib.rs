//! tablesnap - streaming table snapshot persistence
//!
//! tablesnap persists point-in-time snapshots of in-memory database tables.
//! A table streamer pulls serialized blocks from the table-scan engine and
//! hands them to one snapshot data target per output file; targets compress,
//! frame and write the blocks under a process-wide byte budget and rate limit,
//! then mark the file complete.
//!
//! # Quick Start
//!
//! ```ignore
//! use tablesnap::{SnapshotConfig, SnapshotTargetFactory, TargetResources};
//! use tablesnap::{SnapshotTableTask, TableStreamer, StreamType, TableId};
//!
//! let config = SnapshotConfig::from_env()?;
//! let factory = SnapshotTargetFactory::new(dir, nonce, config, TargetResources::global())?;
//! let target = factory.create_target(metadata, schema)?;
//!
//! let streamer = TableStreamer::new(TableId(7), StreamType::Snapshot, vec![SnapshotTableTask::new(target)]);
//! streamer.activate(&engine, HiddenColumnFilter::None, undo_token)?;
//! let summary = streamer.stream_to_end(&engine, 2 * 1024 * 1024);
//! streamer.close_all()?;
//! factory.write_digest(now)?;
//! ```
//!
//! # Architecture
//!
//! - `tablesnap-core`: identifiers, errors, configuration
//! - `tablesnap-durability`: file format, targets, backpressure, memory pool
//! - `tablesnap-engine`: scan engine trait, filters, table streamer

pub use tablesnap_core::*;
pub use tablesnap_durability::*;
pub use tablesnap_engine::{
    apply_filters, Crc32cFilter, HiddenColumnFilter, PartitionProjectionFilter, ScanOutcome,
    ScanStatus, SnapshotDataFilter, SnapshotTableTask, StreamBuffer, StreamResult, StreamSummary,
    TableScanEngine, TableStreamer,
};

/// Scripted scan engine for tests.
pub use tablesnap_engine::testing as scan_testing;
