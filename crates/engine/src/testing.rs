//! Scripted scan engine for tests.

use crate::scan::{
    HiddenColumnFilter, ScanOutcome, StreamBuffer, TableScanEngine, SCAN_ERROR_DRAINED,
    SCAN_ERROR_MORE,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tablesnap_core::{fatal_invariant, Result, StreamType, TableId};

/// Raw block bytes: big-endian partition id followed by `body`.
pub fn raw_block(partition: i32, body: &[u8]) -> Vec<u8> {
    let mut raw = partition.to_be_bytes().to_vec();
    raw.extend_from_slice(body);
    raw
}

/// One `serialize_more` response
#[derive(Debug, Clone)]
pub enum ScanStep {
    /// Write the same raw block into every buffer
    Chunk(Vec<u8>),
    /// Write one raw block per buffer; an empty entry leaves the buffer empty
    PerBuffer(Vec<Vec<u8>>),
    /// Report a serialization error
    Fail {
        /// Whether tuples remain to be drained
        more: bool,
    },
}

/// Recorded `activate_table_stream` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    /// Table activated
    pub table_id: TableId,
    /// Stream type requested
    pub stream_type: StreamType,
    /// Hidden column filter requested
    pub hidden_column_filter: HiddenColumnFilter,
    /// Undo token supplied
    pub undo_token: i64,
    /// Predicates supplied
    pub predicates: Vec<Vec<u8>>,
}

/// Scan engine that replays a fixed script
///
/// Once the script is exhausted every call reports completion with nothing
/// written.
pub struct ScriptedScanEngine {
    script: Mutex<VecDeque<ScanStep>>,
    activations: Mutex<Vec<Activation>>,
    activate_result: AtomicBool,
}

impl ScriptedScanEngine {
    /// Engine replaying `steps`.
    pub fn new(steps: Vec<ScanStep>) -> Self {
        ScriptedScanEngine {
            script: Mutex::new(steps.into()),
            activations: Mutex::new(Vec::new()),
            activate_result: AtomicBool::new(true),
        }
    }

    /// Value later activations return.
    pub fn set_activation(&self, activated: bool) {
        self.activate_result.store(activated, Ordering::Release);
    }

    /// Activations seen so far.
    pub fn activations(&self) -> Vec<Activation> {
        self.activations.lock().clone()
    }

    /// Steps not yet replayed.
    pub fn remaining_steps(&self) -> usize {
        self.script.lock().len()
    }
}

fn fill(buffer: &mut StreamBuffer, raw: &[u8]) -> usize {
    if raw.len() > buffer.capacity() {
        fatal_invariant(format!(
            "scripted block of {} bytes exceeds buffer capacity {}",
            raw.len(),
            buffer.capacity()
        ));
    }
    buffer.writable()[..raw.len()].copy_from_slice(raw);
    raw.len()
}

impl TableScanEngine for ScriptedScanEngine {
    fn activate_table_stream(
        &self,
        table_id: TableId,
        stream_type: StreamType,
        hidden_column_filter: HiddenColumnFilter,
        undo_token: i64,
        predicates: &[Vec<u8>],
    ) -> Result<bool> {
        self.activations.lock().push(Activation {
            table_id,
            stream_type,
            hidden_column_filter,
            undo_token,
            predicates: predicates.to_vec(),
        });
        Ok(self.activate_result.load(Ordering::Acquire))
    }

    fn serialize_more(
        &self,
        _table_id: TableId,
        _stream_type: StreamType,
        buffers: &mut [StreamBuffer],
    ) -> ScanOutcome {
        let mut script = self.script.lock();
        let step = script.pop_front();
        let left = script.len() as i64;
        drop(script);

        let (remaining, bytes_written) = match step {
            None => (0, vec![0; buffers.len()]),
            Some(ScanStep::Chunk(raw)) => (left, buffers.iter_mut().map(|b| fill(b, &raw)).collect()),
            Some(ScanStep::PerBuffer(raws)) => {
                if raws.len() != buffers.len() {
                    fatal_invariant(format!(
                        "scripted step has {} blocks for {} buffers",
                        raws.len(),
                        buffers.len()
                    ));
                }
                let written = buffers.iter_mut().zip(&raws).map(|(b, raw)| fill(b, raw)).collect();
                (left, written)
            }
            Some(ScanStep::Fail { more }) => {
                let code = if more { SCAN_ERROR_MORE } else { SCAN_ERROR_DRAINED };
                (code, vec![0; buffers.len()])
            }
        };
        ScanOutcome {
            remaining,
            bytes_written,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_reports_remaining_steps() {
        let engine = ScriptedScanEngine::new(vec![
            ScanStep::Chunk(raw_block(0, b"a")),
            ScanStep::Chunk(raw_block(0, b"b")),
        ]);
        let mut buffers = vec![StreamBuffer::new(12, 32), StreamBuffer::new(12, 32)];
        let first = engine.serialize_more(TableId(1), StreamType::Snapshot, &mut buffers);
        assert_eq!(first.remaining, 1);
        assert_eq!(first.bytes_written, vec![5, 5]);
        let second = engine.serialize_more(TableId(1), StreamType::Snapshot, &mut buffers);
        assert_eq!(second.remaining, 0);
        let after = engine.serialize_more(TableId(1), StreamType::Snapshot, &mut buffers);
        assert_eq!(after.bytes_written, vec![0, 0]);
        assert_eq!(engine.remaining_steps(), 0);
    }

    #[test]
    fn test_fail_codes() {
        let engine = ScriptedScanEngine::new(vec![ScanStep::Fail { more: true }, ScanStep::Fail { more: false }]);
        let mut buffers = vec![StreamBuffer::new(0, 8)];
        assert_eq!(engine.serialize_more(TableId(1), StreamType::Snapshot, &mut buffers).remaining, -2);
        assert_eq!(engine.serialize_more(TableId(1), StreamType::Snapshot, &mut buffers).remaining, -1);
    }
}
