//! Error types for the snapshot pipeline
//!
//! This module defines the error taxonomy shared by every crate in the
//! workspace. We use `thiserror` for automatic `Display` and `Error` trait
//! implementations.
//!
//! Errors are `Clone` because a single recorded failure is observed from
//! several places: the completion handle of the write that failed, every
//! write submitted after the target was poisoned, `last_write_error()` and
//! the final `close()`.

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Result type alias for snapshot operations
pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Error types for snapshot persistence
#[derive(Debug, Clone, Error)]
pub enum SnapshotError {
    /// I/O error from a physical write, sync or open
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// The table-scan engine failed to serialize a block
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Compression or decompression of a block failed
    #[error("Compression error: {0}")]
    Compression(String),

    /// On-disk data failed validation
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation attempted on a target that has already been closed
    #[error("Snapshot target already closed")]
    TargetClosed,
}

impl SnapshotError {
    /// Create a serialization error.
    pub fn serialization(msg: impl Into<String>) -> Self {
        SnapshotError::Serialization(msg.into())
    }

    /// Create a corruption error.
    pub fn corruption(msg: impl Into<String>) -> Self {
        SnapshotError::Corruption(msg.into())
    }

    /// Returns `true` if this error came from the I/O layer.
    pub fn is_io(&self) -> bool {
        matches!(self, SnapshotError::Io(_))
    }

    /// The underlying `io::ErrorKind` for I/O errors.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            SnapshotError::Io(e) => Some(e.kind()),
            _ => None,
        }
    }
}

impl From<io::Error> for SnapshotError {
    fn from(e: io::Error) -> Self {
        SnapshotError::Io(Arc::new(e))
    }
}

/// Report a broken internal invariant.
///
/// Invariant violations indicate a bug in the pipeline rather than an
/// operational condition, so they are never recovered: the violation is
/// logged and the current thread panics.
#[track_caller]
pub fn fatal_invariant(msg: impl AsRef<str>) -> ! {
    let msg = msg.as_ref();
    tracing::error!(target: "tablesnap::invariant", violation = msg, "Snapshot invariant violated");
    panic!("snapshot invariant violated: {}", msg);
}
