//! Threads that run the snapshot pipeline.
//!
//! - [`TaskQueue`]: dedicated single-threaded FIFO queue (per target stage)
//! - [`PeriodicScheduler`]: shared housekeeping thread for sync/fadvise passes
//! - [`compress_async`]: hands a block to the shared compression pool

mod periodic;
mod task_queue;

pub use periodic::{PeriodicHandle, PeriodicScheduler};
pub use task_queue::{QueueClosed, TaskQueue};

use crate::codec::{BlockCodec, CompressedBlock};
use crate::completion::{deferred, Deferred};
use crate::target::TableBlock;
use std::sync::Arc;
use tablesnap_core::Result;

/// Compress `block` on the shared compression pool.
///
/// The result is awaited by the target's ordered stage, so blocks may be
/// compressed concurrently while still reaching the file in submission order.
pub fn compress_async(
    codec: Arc<dyn BlockCodec>,
    block: TableBlock,
) -> Deferred<Result<CompressedBlock>> {
    let (promise, result) = deferred();
    rayon::spawn(move || {
        let compressed = codec.compress_block(block.payload());
        // The raw buffer is released as soon as its compressed form exists
        drop(block);
        promise.fulfill(compressed);
    });
    result
}
