//! Core types for tablesnap
//!
//! This crate defines the foundational types used throughout the snapshot
//! pipeline:
//! - Identifiers: TableId, PartitionId, HostId, TxnId
//! - StreamType and FormatVersion
//! - Error: the shared error taxonomy
//! - SnapshotConfig: tunables read from TOML and process properties

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod types;

pub use config::{ConfigError, SnapshotConfig};
pub use error::{fatal_invariant, Result, SnapshotError};
pub use types::{FormatVersion, HostId, PartitionId, StreamType, TableId, TxnId};
