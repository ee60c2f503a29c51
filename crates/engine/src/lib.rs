//! Table streaming for tablesnap
//!
//! This crate connects the table-scan engine to snapshot data targets:
//! - TableScanEngine: the collaborator that serializes tuples into buffers
//! - Filters: per-task block projection and checksumming
//! - TableStreamer: drives a table stream and dispatches blocks to targets
//!
//! The streamer is the only component that interprets scan return codes.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod filter;
pub mod scan;
pub mod streamer;
pub mod testing;

pub use filter::{apply_filters, Crc32cFilter, PartitionProjectionFilter, SnapshotDataFilter};
pub use scan::{HiddenColumnFilter, ScanOutcome, ScanStatus, StreamBuffer, TableScanEngine};
pub use streamer::{SnapshotTableTask, StreamResult, StreamSummary, TableStreamer};
