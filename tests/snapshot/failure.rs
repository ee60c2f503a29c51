//! Physical write failures poison a target and leave the file incomplete.

use crate::common::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tablesnap::{
    BlockPayload, FaultInjector, HeaderView, SnapshotConfig, SnapshotDataTarget, SnapshotError,
    TableId, TargetStrategy,
};

#[test]
fn test_buffered_failure_poisons_later_writes() {
    let config = SnapshotConfig::for_testing();
    let faults = FaultInjector::new();
    // Header, two blocks, then the third block fails
    faults.fail_nth_write(4);
    let snap = TestSnapshot::with_resources(
        TargetStrategy::Buffered,
        config.clone(),
        faulty_resources(&config, &faults),
    );
    let target = snap.factory.create_target(metadata("POISON"), Vec::new()).unwrap();

    let handles: Vec<_> = (0..6).map(|p| target.write(supplier(p, 1, 1000), TableId(1))).collect();
    let results: Vec<_> = handles.iter().map(|h| h.wait()).collect();
    assert!(results[0].is_ok() && results[1].is_ok());
    assert!(results[2..].iter().all(|r| r.is_err()));
    assert!(target.last_write_error().unwrap().is_io());

    let supplied = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&supplied);
    let late = target.write(
        Box::new(move || {
            flag.store(true, Ordering::Release);
            BlockPayload::Empty
        }),
        TableId(1),
    );
    assert!(late.is_done());
    assert!(late.wait().is_err());
    assert!(supplied.load(Ordering::Acquire));

    assert!(matches!(target.close(), Err(SnapshotError::Io(_))));
    let file = SnapshotFile::read(target.path());
    assert!(!file.header.completed);
    assert_eq!(file.partitions(), vec![0, 1]);
    assert_eq!(faults.failures_injected(), 1);
}

#[test]
fn test_failure_drains_and_close_returns() {
    for strategy in STRATEGIES {
        let config = SnapshotConfig::for_testing();
        let faults = FaultInjector::new();
        faults.fail_writes_from(2);
        let snap = TestSnapshot::with_resources(strategy, config.clone(), faulty_resources(&config, &faults));
        let target = snap.factory.create_target(metadata("DRAIN"), Vec::new()).unwrap();

        let handles: Vec<_> = (0..40).map(|p| target.write(supplier(p, 2, 8000), TableId(1))).collect();
        assert!(target.close().is_err(), "{}", strategy);
        for h in &handles {
            assert!(h.is_done(), "{}", strategy);
        }
        assert!(handles.iter().any(|h| h.wait().is_err()), "{}", strategy);

        let bytes = std::fs::read(target.path()).unwrap();
        let header = HeaderView::parse(&bytes).unwrap();
        assert!(!header.completed, "{}", strategy);
        assert_eq!(bytes.len(), header.total_len(), "{}", strategy);
    }
}

#[test]
fn test_first_block_write_failure_keeps_valid_header() {
    for strategy in STRATEGIES {
        let config = SnapshotConfig::for_testing();
        let faults = FaultInjector::new();
        faults.fail_nth_write(2);
        let snap = TestSnapshot::with_resources(strategy, config.clone(), faulty_resources(&config, &faults));
        let target = snap.factory.create_target(metadata("TORN"), b"schema".to_vec()).unwrap();

        let handles: Vec<_> = (0..8).map(|p| target.write(supplier(p, 7, 8000), TableId(1))).collect();
        assert!(target.close().is_err(), "{}", strategy);
        assert!(handles.iter().all(|h| h.wait().is_err()), "{}", strategy);

        let bytes = std::fs::read(target.path()).unwrap();
        assert!(bytes.iter().any(|&b| b != 0), "{}", strategy);
        let header = HeaderView::parse(&bytes).unwrap();
        assert!(!header.completed, "{}", strategy);
        assert_eq!(header.schema, b"schema", "{}", strategy);
        assert_eq!(bytes.len(), header.total_len(), "{}", strategy);
    }
}

#[test]
fn test_header_write_failure_fails_create() {
    for strategy in STRATEGIES {
        let config = SnapshotConfig::for_testing();
        let faults = FaultInjector::new();
        faults.fail_nth_write(1);
        let snap = TestSnapshot::with_resources(strategy, config.clone(), faulty_resources(&config, &faults));
        let result = snap.factory.create_target(metadata("NOHEADER"), Vec::new());
        assert!(matches!(result, Err(SnapshotError::Io(_))), "{}", strategy);

        let file = snap.factory.target_path(&metadata("NOHEADER"));
        let len = std::fs::metadata(&file).map(|m| m.len()).unwrap_or(0);
        assert_eq!(len, 0, "{}", strategy);
    }
}

#[test]
fn test_serialization_failure_keeps_writing_but_not_complete() {
    for strategy in STRATEGIES {
        let snap = TestSnapshot::new(strategy);
        let target = snap.factory.create_target(metadata("SER"), Vec::new()).unwrap();
        let first = target.write(supplier(0, 3, 100), TableId(1));
        target.report_serialization_failure(SnapshotError::serialization("tuple too wide"));
        let second = target.write(supplier(1, 3, 100), TableId(1));

        assert!(matches!(target.close(), Err(SnapshotError::Serialization(_))));
        first.wait().unwrap();
        second.wait().unwrap();
        assert!(target.last_write_error().is_none());

        let file = SnapshotFile::read(target.path());
        assert!(!file.header.completed, "{}", strategy);
        assert_eq!(file.partitions(), vec![0, 1], "{}", strategy);
    }
}

#[test]
fn test_second_close_is_rejected() {
    for strategy in STRATEGIES {
        let snap = TestSnapshot::new(strategy);
        let target = snap.factory.create_target(metadata("TWICE"), Vec::new()).unwrap();
        target.close().unwrap();
        assert!(matches!(target.close(), Err(SnapshotError::TargetClosed)));
        assert!(target.write(supplier(0, 0, 8), TableId(1)).wait().is_err());
    }
}

#[test]
fn test_close_handler_sees_result() {
    let config = SnapshotConfig::for_testing();
    let faults = FaultInjector::new();
    faults.fail_writes_from(2);
    let snap = TestSnapshot::with_resources(
        TargetStrategy::Buffered,
        config.clone(),
        faulty_resources(&config, &faults),
    );
    let target = snap.factory.create_target(metadata("HANDLER"), Vec::new()).unwrap();
    let saw_error = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&saw_error);
    target.set_on_close_handler(Box::new(move |result| {
        flag.store(result.is_err(), Ordering::Release);
    }));
    target.write(supplier(0, 0, 64), TableId(1));
    assert!(target.close().is_err());
    assert!(saw_error.load(Ordering::Acquire));
}
