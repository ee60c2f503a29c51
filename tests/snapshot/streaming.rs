//! Table streaming through compressed targets.

use crate::common::*;
use std::sync::Arc;
use tablesnap::scan_testing::{raw_block, ScanStep, ScriptedScanEngine};
use tablesnap::{
    Crc32cFilter, HiddenColumnFilter, SnapshotConfig, SnapshotDataTarget, SnapshotTableTask, StreamType, TableId,
    TableStreamer, TargetResources, ZstdCodec,
};

#[test]
fn test_stream_compressed_table() {
    for strategy in STRATEGIES {
        let config = SnapshotConfig::for_testing();
        let snap = TestSnapshot::with_resources(strategy, config.clone(), TargetResources::isolated(&config));
        let target = snap.factory.create_target(metadata("LINEITEM"), b"schema".to_vec()).unwrap();
        let crc = Arc::new(Crc32cFilter::new());
        let streamer = TableStreamer::new(
            TableId(11),
            StreamType::Snapshot,
            vec![SnapshotTableTask::new(Arc::clone(&target)).with_filter(crc.clone())],
        );

        // Repetitive tuples so zstd shrinks them
        let chunks: Vec<Vec<u8>> = (0..20)
            .map(|i| raw_block(i % 3, &b"tuple-".repeat(500 + i as usize * 10)))
            .collect();
        let engine = ScriptedScanEngine::new(chunks.iter().cloned().map(ScanStep::Chunk).collect());

        assert!(streamer.activate(&engine, HiddenColumnFilter::None, 0).unwrap());
        let summary = streamer.stream_to_end(&engine, 64 * 1024);
        streamer.close_all().unwrap();
        summary.write_future.wait().unwrap();
        assert!(!summary.serialization_failed);

        let file = SnapshotFile::read(target.path());
        assert!(file.header.completed, "{}", strategy);
        let raw: Vec<Vec<u8>> = file
            .blocks
            .iter()
            .map(|b| b.decode(&ZstdCodec::default()).unwrap())
            .collect();
        assert_eq!(raw, chunks, "{}", strategy);
        assert!((file.bytes.len() as u64) < summary.bytes, "{}", strategy);
        assert_eq!(crc.blocks(), 20);
    }
}
