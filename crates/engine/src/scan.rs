//! Table-scan engine collaborator.
//!
//! The scan engine owns table storage. It activates a copy-on-write stream
//! for a table and, on request, serializes the next chunk of tuples into
//! buffers supplied by the streamer. Each chunk written into a buffer is a
//! raw table block: a 4-byte big-endian partition id followed by tuples.

use tablesnap_core::{fatal_invariant, Result, StreamType, TableId};
use tablesnap_durability::TableBlock;

/// Scan return code: an error occurred and the stream is drained.
pub const SCAN_ERROR_DRAINED: i64 = -1;
/// Scan return code: an error occurred but tuples remain to be drained.
pub const SCAN_ERROR_MORE: i64 = -2;

/// Which hidden columns the engine includes in serialized tuples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HiddenColumnFilter {
    /// Serialize every column
    #[default]
    None,
    /// Leave out the hidden migrate column
    ExcludeMigrate,
}

/// Outcome of one `serialize_more` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Remaining-work estimate (> 0), 0 when complete, or an error code
    pub remaining: i64,
    /// Bytes written into each buffer, in buffer order
    pub bytes_written: Vec<usize>,
}

/// Decoded scan return code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    /// More tuples remain
    More(u64),
    /// The stream is complete
    Complete,
    /// Serialization failed; nothing left to drain
    ErrorDrained,
    /// Serialization failed; keep calling to drain the remaining tuples
    ErrorMore,
}

impl ScanStatus {
    /// Interpret a raw return code.
    pub fn from_code(code: i64) -> ScanStatus {
        match code {
            n if n > 0 => ScanStatus::More(n as u64),
            0 => ScanStatus::Complete,
            SCAN_ERROR_DRAINED => ScanStatus::ErrorDrained,
            SCAN_ERROR_MORE => ScanStatus::ErrorMore,
            other => fatal_invariant(format!("unknown table scan return code {}", other)),
        }
    }

    /// Returns `true` for either error code.
    pub fn is_error(&self) -> bool {
        matches!(self, ScanStatus::ErrorDrained | ScanStatus::ErrorMore)
    }

    /// Returns `true` if the streamer must call again.
    pub fn has_more(&self) -> bool {
        matches!(self, ScanStatus::More(_) | ScanStatus::ErrorMore)
    }
}

/// Interface of the table-scan engine consumed by [`TableStreamer`]
///
/// [`TableStreamer`]: crate::TableStreamer
pub trait TableScanEngine: Send + Sync {
    /// Start streaming `table_id`. Returns `false` if the engine declined.
    fn activate_table_stream(
        &self,
        table_id: TableId,
        stream_type: StreamType,
        hidden_column_filter: HiddenColumnFilter,
        undo_token: i64,
        predicates: &[Vec<u8>],
    ) -> Result<bool>;

    /// Serialize the next chunk of tuples into `buffers`.
    fn serialize_more(
        &self,
        table_id: TableId,
        stream_type: StreamType,
        buffers: &mut [StreamBuffer],
    ) -> ScanOutcome;
}

/// Buffer the engine serializes one block into
///
/// The first `headroom` bytes are reserved for the block header the target
/// adds later; the engine writes only into [`StreamBuffer::writable`].
#[derive(Debug, Clone)]
pub struct StreamBuffer {
    data: Vec<u8>,
    headroom: usize,
}

impl StreamBuffer {
    /// Buffer with `headroom` reserved bytes and `capacity` writable bytes.
    pub fn new(headroom: usize, capacity: usize) -> Self {
        StreamBuffer {
            data: vec![0u8; headroom + capacity],
            headroom,
        }
    }

    /// Writable bytes after the headroom.
    pub fn capacity(&self) -> usize {
        self.data.len() - self.headroom
    }

    /// Reserved header bytes.
    pub fn headroom(&self) -> usize {
        self.headroom
    }

    /// Region the engine serializes into.
    pub fn writable(&mut self) -> &mut [u8] {
        &mut self.data[self.headroom..]
    }

    /// Hand the first `len` written bytes off as a block and reset the buffer.
    pub fn take_block(&mut self, len: usize) -> TableBlock {
        if len > self.capacity() {
            fatal_invariant(format!(
                "scan engine reported {} bytes in a buffer of {}",
                len,
                self.capacity()
            ));
        }
        let capacity = self.capacity();
        let mut data = std::mem::replace(&mut self.data, vec![0u8; self.headroom + capacity]);
        data.truncate(self.headroom + len);
        TableBlock::new(data, self.headroom)
    }

    /// Discard whatever the engine wrote.
    pub fn discard(&mut self) {
        self.data.fill(0);
    }
}
