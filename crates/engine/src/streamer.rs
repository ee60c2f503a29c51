//! Table streamer
//!
//! Drives one table's copy-on-write stream: asks the scan engine for the next
//! chunk of tuples, routes each serialized buffer through its task's filter
//! chain and hands the result to the task's target.

use crate::filter::{apply_filters, SnapshotDataFilter};
use crate::scan::{HiddenColumnFilter, ScanStatus, StreamBuffer, TableScanEngine};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tablesnap_core::{fatal_invariant, Result, SnapshotError, StreamType, TableId};
use tablesnap_durability::{BlockPayload, SnapshotDataTarget, WriteHandle};
use tracing::{debug, warn};

/// One output of a table stream
#[derive(Clone)]
pub struct SnapshotTableTask {
    /// Where the table's blocks go
    pub target: Arc<dyn SnapshotDataTarget>,
    /// Applied in order before the block reaches the target
    pub filters: Vec<Arc<dyn SnapshotDataFilter>>,
    /// Serialized predicate handed to the engine on activation
    pub predicate: Option<Vec<u8>>,
}

impl SnapshotTableTask {
    /// Task with no filters and no predicate.
    pub fn new(target: Arc<dyn SnapshotDataTarget>) -> Self {
        SnapshotTableTask {
            target,
            filters: Vec::new(),
            predicate: None,
        }
    }

    /// Append a filter (builder pattern).
    pub fn with_filter(mut self, filter: Arc<dyn SnapshotDataFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    /// Set the predicate (builder pattern).
    pub fn with_predicate(mut self, predicate: Vec<u8>) -> Self {
        self.predicate = Some(predicate);
        self
    }
}

impl std::fmt::Debug for SnapshotTableTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotTableTask")
            .field("path", &self.target.path())
            .field(
                "filters",
                &self.filters.iter().map(|x| x.name().to_string()).collect::<Vec<_>>(),
            )
            .field("predicate", &self.predicate.as_ref().map(Vec::len))
            .finish()
    }
}

/// Outcome of one [`TableStreamer::stream_more`] call
#[derive(Debug)]
pub struct StreamResult {
    /// Completes when every block dispatched by this call is persisted
    pub write_future: WriteHandle,
    /// Whether the engine must be called again
    pub has_more: bool,
    /// Raw bytes the engine serialized in this call
    pub bytes_serialized: usize,
}

/// Totals of [`TableStreamer::stream_to_end`]
#[derive(Debug)]
pub struct StreamSummary {
    /// `stream_more` calls made
    pub chunks: u64,
    /// Raw bytes the engine serialized
    pub bytes: u64,
    /// Conjunction of every dispatched write
    ///
    /// Direct-I/O targets hold the tail of the file until `close`, so wait on
    /// this after [`TableStreamer::close_all`].
    pub write_future: WriteHandle,
    /// Whether the engine reported a serialization error
    pub serialization_failed: bool,
}

/// Streams one table to a set of targets
#[derive(Debug)]
pub struct TableStreamer {
    table_id: TableId,
    stream_type: StreamType,
    tasks: Vec<SnapshotTableTask>,
}

impl TableStreamer {
    /// Streamer for `table_id` feeding `tasks`.
    pub fn new(table_id: TableId, stream_type: StreamType, tasks: Vec<SnapshotTableTask>) -> Self {
        TableStreamer {
            table_id,
            stream_type,
            tasks,
        }
    }

    /// Table being streamed.
    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    /// Tasks in buffer order.
    pub fn tasks(&self) -> &[SnapshotTableTask] {
        &self.tasks
    }

    /// Activate the table stream with every task predicate.
    pub fn activate(
        &self,
        engine: &dyn TableScanEngine,
        hidden_column_filter: HiddenColumnFilter,
        undo_token: i64,
    ) -> Result<bool> {
        let predicates: Vec<Vec<u8>> = self
            .tasks
            .iter()
            .filter_map(|t| t.predicate.clone())
            .collect();
        let activated = engine.activate_table_stream(
            self.table_id,
            self.stream_type,
            hidden_column_filter,
            undo_token,
            &predicates,
        )?;
        debug!(
            table = %self.table_id,
            stream_type = ?self.stream_type,
            predicates = predicates.len(),
            activated,
            "Activated table stream"
        );
        Ok(activated)
    }

    /// One buffer per task, each with its target's header headroom.
    pub fn allocate_buffers(&self, capacity: usize) -> Vec<StreamBuffer> {
        self.tasks
            .iter()
            .map(|t| StreamBuffer::new(t.target.header_size(), capacity))
            .collect()
    }

    /// Serialize the next chunk and dispatch it to the targets.
    ///
    /// `buffers` must come from [`TableStreamer::allocate_buffers`]. Rows
    /// counted inside blocks are added to `row_counter` when the target
    /// format stores them.
    pub fn stream_more(
        &self,
        engine: &dyn TableScanEngine,
        buffers: &mut [StreamBuffer],
        row_counter: Option<&AtomicU64>,
    ) -> StreamResult {
        if buffers.len() != self.tasks.len() {
            fatal_invariant(format!(
                "{} buffers supplied for {} snapshot tasks",
                buffers.len(),
                self.tasks.len()
            ));
        }

        let outcome = engine.serialize_more(self.table_id, self.stream_type, buffers);
        if outcome.bytes_written.len() != buffers.len() {
            fatal_invariant(format!(
                "scan engine reported {} buffer lengths for {} buffers",
                outcome.bytes_written.len(),
                buffers.len()
            ));
        }

        let status = ScanStatus::from_code(outcome.remaining);
        if status.is_error() {
            warn!(
                table = %self.table_id,
                code = outcome.remaining,
                "Table serialization failed"
            );
            for task in &self.tasks {
                task.target.report_serialization_failure(SnapshotError::serialization(format!(
                    "table {} failed to serialize",
                    self.table_id
                )));
            }
            buffers.iter_mut().for_each(StreamBuffer::discard);
            return StreamResult {
                write_future: WriteHandle::completed(Ok(())),
                has_more: status.has_more(),
                bytes_serialized: 0,
            };
        }

        let mut handles = Vec::with_capacity(self.tasks.len());
        let mut bytes_serialized = 0;
        for ((task, buffer), &len) in self.tasks.iter().zip(buffers.iter_mut()).zip(&outcome.bytes_written) {
            if len == 0 {
                continue;
            }
            bytes_serialized += len;
            let block = buffer.take_block(len);
            if let (Some(counter), Some(rows)) = (row_counter, task.target.in_container_row_count(&block)) {
                counter.fetch_add(u64::from(rows), Ordering::AcqRel);
            }
            if let Some(block) = apply_filters(&task.filters, block) {
                handles.push(
                    task.target
                        .write(Box::new(move || BlockPayload::Pending(block)), self.table_id),
                );
            }
        }

        StreamResult {
            write_future: WriteHandle::all(handles),
            has_more: status.has_more(),
            bytes_serialized,
        }
    }

    /// Stream until the engine reports no more data.
    ///
    /// Write futures are collected rather than awaited.
    pub fn stream_to_end(&self, engine: &dyn TableScanEngine, capacity: usize) -> StreamSummary {
        let mut buffers = self.allocate_buffers(capacity);
        let mut futures = Vec::new();
        let mut chunks = 0u64;
        let mut bytes = 0u64;
        loop {
            let result = self.stream_more(engine, &mut buffers, None);
            chunks += 1;
            bytes += result.bytes_serialized as u64;
            futures.push(result.write_future);
            if !result.has_more {
                break;
            }
        }
        let serialization_failed = self
            .tasks
            .iter()
            .any(|t| t.target.serialization_error().is_some());
        debug!(
            table = %self.table_id,
            chunks,
            bytes,
            serialization_failed,
            "Table stream finished"
        );
        StreamSummary {
            chunks,
            bytes,
            write_future: WriteHandle::all(futures),
            serialization_failed,
        }
    }

    /// Close every target that needs a final close; returns the first error.
    pub fn close_all(&self) -> Result<()> {
        let mut first = Ok(());
        for task in &self.tasks {
            if !task.target.needs_final_close() {
                continue;
            }
            if let Err(e) = task.target.close() {
                if first.is_ok() {
                    first = Err(e);
                }
            }
        }
        first
    }
}
