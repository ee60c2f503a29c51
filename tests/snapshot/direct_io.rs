//! Page alignment, exact truncation and pool accounting of direct-I/O targets.

use crate::common::*;
use std::sync::Arc;
use tablesnap::{
    DirectIoSnapshotDataTarget, MemoryPool, SnapshotConfig, SnapshotDataTarget, TableId,
    TargetSpec, TargetStrategy,
};

fn open(snap_dir: &std::path::Path, config: &SnapshotConfig, pool: &MemoryPool) -> DirectIoSnapshotDataTarget {
    let spec = TargetSpec::new(snap_dir.join("aligned.vpt"), metadata("ALIGNED"), b"schema".to_vec());
    DirectIoSnapshotDataTarget::open(&spec, config, resources(config), pool.reference()).unwrap()
}

#[test]
fn test_every_physical_write_is_page_aligned() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = SnapshotConfig::for_testing();
    let pool = MemoryPool::new(config.page_size);
    let target = open(dir.path(), &config, &pool);

    let expected: Vec<Vec<u8>> = (0..50).map(|p| raw_block(p, p as u8, 1 + (p as usize * 1777) % 20_000)).collect();
    for raw in &expected {
        let raw = raw.clone();
        target.write(
            Box::new(move || tablesnap::BlockPayload::Pending(tablesnap::TableBlock::from_payload(raw))),
            TableId(1),
        );
    }
    target.close().unwrap();

    let extents = target.written_extents();
    assert!(!extents.is_empty());
    for (offset, len) in &extents {
        assert_eq!(offset % config.page_size as u64, 0, "offset {}", offset);
        assert_eq!(len % config.page_size, 0, "len {}", len);
    }
    // The first page is rewritten last with the completion flag set
    assert_eq!(extents.last().map(|e| e.0), Some(0));

    let file = SnapshotFile::read(target.path());
    assert_eq!(file.bytes.len() as u64, target.bytes_written());
    assert!(file.header.completed);
    assert_eq!(file.raw_blocks(), expected);
    assert_eq!(
        (target.bytes_written() + target.padding_bytes()) % config.page_size as u64,
        0
    );
}

#[test]
fn test_batches_respect_write_pages() {
    let dir = tempfile::tempdir().unwrap();
    let config = SnapshotConfig::for_testing();
    let pool = MemoryPool::new(config.page_size);
    let target = open(dir.path(), &config, &pool);
    for p in 0..64 {
        target.write(supplier(p, 9, 4000), TableId(1));
    }
    target.close().unwrap();

    let max_batch = config.page_size * config.direct_io_write_pages;
    assert!(target.written_extents().iter().all(|(_, len)| *len <= max_batch));
}

#[test]
fn test_pool_pages_all_return() {
    let snap = TestSnapshot::new(TargetStrategy::DirectIo);
    let targets: Vec<Arc<dyn SnapshotDataTarget>> = (0..3)
        .map(|t| snap.factory.create_target(metadata(&format!("P{}", t)), Vec::new()).unwrap())
        .collect();
    for target in &targets {
        for p in 0..20 {
            target.write(supplier(p, 4, 3000), TableId(1));
        }
    }
    for target in &targets {
        target.close().unwrap();
    }
    let in_use = snap.factory.pool().stats();
    assert_eq!(in_use.outstanding(), 0);
    assert!(in_use.refs >= 1);

    snap.factory.release();
    let stats = snap.factory.pool().stats();
    assert_eq!(stats.refs, 0);
    assert_eq!(stats.spare, 0);
    assert_eq!(stats.allocated, stats.freed);
    assert!(stats.acquired >= stats.allocated);
}
