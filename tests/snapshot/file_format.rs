//! Header and framing of files produced by real targets.

use crate::common::*;
use tablesnap::{
    read_digest, serialize_header, verify_header_crc, FormatVersion, SnapshotDataTarget, TableId,
    TargetStrategy,
    BLOCK_HEADER_SIZE, BLOCK_TRAILER_SIZE, COMPLETION_FLAG_OFFSET,
};

#[test]
fn test_three_blocks_account_for_every_byte() {
    let snap = TestSnapshot::new(TargetStrategy::Buffered);
    let meta = metadata("ORDERS");
    let schema = b"columns".to_vec();
    let header_len = serialize_header(&meta, FormatVersion::CURRENT, &schema).unwrap().len();
    let target = snap.factory.create_target(meta, schema).unwrap();

    let handles: Vec<_> = (0..3)
        .map(|p| target.write(supplier(p, 0xAB, 64 * 1024 - 4), TableId(1)))
        .collect();
    for h in handles {
        h.wait().unwrap();
    }
    target.close().unwrap();

    let framed = BLOCK_HEADER_SIZE + (64 * 1024 - 4) + BLOCK_TRAILER_SIZE;
    assert_eq!(target.bytes_written(), (header_len + 3 * framed) as u64);

    let file = SnapshotFile::read(target.path());
    assert_eq!(file.bytes.len() as u64, target.bytes_written());
    assert_eq!(file.header.total_len(), header_len);
    assert_eq!(file.partitions(), vec![0, 1, 2]);
    assert!(file.blocks.iter().all(|b| b.framed_len() == framed));
}

#[test]
fn test_header_round_trips_metadata_and_crc() {
    for strategy in STRATEGIES {
        let snap = TestSnapshot::new(strategy);
        let meta = metadata("CUSTOMERS");
        let target = snap.factory.create_target(meta.clone(), b"schema".to_vec()).unwrap();
        target.write(supplier(1, 7, 500), TableId(2));
        target.close().unwrap();

        let file = SnapshotFile::read(target.path());
        assert!(file.header.completed, "{}", strategy);
        assert_eq!(file.header.metadata, meta);
        assert_eq!(file.header.schema, b"schema");
        assert_eq!(file.header.version, FormatVersion::CURRENT);
        assert!(verify_header_crc(&file.bytes), "{}", strategy);
    }
}

#[test]
fn test_completion_byte_is_covered_as_complete() {
    let snap = TestSnapshot::new(TargetStrategy::Buffered);
    let target = snap.factory.create_target(metadata("FLAG"), Vec::new()).unwrap();
    target.close().unwrap();

    let mut bytes = std::fs::read(target.path()).unwrap();
    assert_eq!(bytes[COMPLETION_FLAG_OFFSET], 1);
    // An unfinished file carries the same CRC
    bytes[COMPLETION_FLAG_OFFSET] = 0;
    assert!(verify_header_crc(&bytes));
    // Any other header byte breaks it
    bytes[COMPLETION_FLAG_OFFSET + 1] ^= 0xFF;
    assert!(!verify_header_crc(&bytes));
}

#[test]
fn test_digest_lists_created_tables() {
    let snap = TestSnapshot::new(TargetStrategy::Buffered);
    for table in ["A", "B", "C"] {
        snap.factory.create_target(metadata(table), Vec::new()).unwrap().close().unwrap();
    }
    let path = snap.factory.write_digest(1234).unwrap();
    let digest = read_digest(&path).unwrap();
    assert_eq!(digest.time, 1234);
    assert_eq!(digest.tables, vec!["A", "B", "C"]);

    let file_name = snap.factory.target_path(&metadata("A"));
    assert!(file_name.exists());
    assert!(file_name.to_string_lossy().ends_with(".vpt"));
}
