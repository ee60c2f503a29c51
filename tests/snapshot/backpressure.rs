//! Byte budget shared by every target of a generation.

use crate::common::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tablesnap::{ByteBudget, SnapshotConfig, SnapshotDataTarget, TableId, TargetStrategy};

fn small_budget(bytes: u64) -> (SnapshotConfig, Arc<ByteBudget>) {
    let config = SnapshotConfig::for_testing()
        .with_bytes_before_sync(bytes)
        .with_sync_threshold_bytes(bytes / 4);
    (config, Arc::new(ByteBudget::new(bytes)))
}

#[test]
fn test_threshold_above_quarter_budget_is_rejected() {
    let config = SnapshotConfig::for_testing()
        .with_bytes_before_sync(1024 * 1024)
        .with_sync_threshold_bytes(4 * 1024 * 1024);
    let dir = tempfile::tempdir().unwrap();
    let result = tablesnap::SnapshotTargetFactory::with_strategy(
        dir.path(),
        "nonce",
        config.clone(),
        resources(&config),
        TargetStrategy::Buffered,
    );
    assert!(result.is_err());
}

#[test]
fn test_blocks_wider_than_quarter_budget_complete() {
    let (config, budget) = small_budget(1024 * 1024);
    let snap = TestSnapshot::with_resources(
        TargetStrategy::Buffered,
        config.clone(),
        resources(&config).with_budget(Arc::clone(&budget)),
    );
    let targets: Vec<Arc<dyn SnapshotDataTarget>> = (0..3)
        .map(|t| snap.factory.create_target(metadata(&format!("W{}", t)), Vec::new()).unwrap())
        .collect();

    let handles: Vec<_> = (0..5)
        .flat_map(|p| targets.iter().map(move |t| t.write(supplier(p, p as u8, 400 * 1024), TableId(1))))
        .collect();
    for h in handles {
        assert!(h.wait_timeout(Duration::from_secs(20)).unwrap().is_ok());
    }

    for target in &targets {
        target.close().unwrap();
        let file = SnapshotFile::read(target.path());
        assert!(file.header.completed);
        assert_eq!(file.blocks.len(), 5);
    }
    assert_eq!(budget.available(), budget.capacity());
}

#[test]
fn test_small_budget_completes_and_is_restored() {
    let (config, budget) = small_budget(256 * 1024);
    let snap = TestSnapshot::with_resources(
        TargetStrategy::Buffered,
        config.clone(),
        resources(&config).with_budget(Arc::clone(&budget)),
    );
    let targets: Vec<Arc<dyn SnapshotDataTarget>> = (0..4)
        .map(|t| snap.factory.create_target(metadata(&format!("B{}", t)), Vec::new()).unwrap())
        .collect();

    let writers: Vec<_> = targets
        .iter()
        .map(|target| {
            let target = Arc::clone(target);
            thread::spawn(move || {
                let handles: Vec<_> = (0..30).map(|p| target.write(supplier(p, 5, 32 * 1024), TableId(1))).collect();
                for h in handles {
                    h.wait().unwrap();
                }
            })
        })
        .collect();
    for w in writers {
        w.join().unwrap();
    }

    for target in &targets {
        target.close().unwrap();
        assert_eq!(SnapshotFile::read(target.path()).blocks.len(), 30);
    }
    assert_eq!(budget.available(), budget.capacity());
}
