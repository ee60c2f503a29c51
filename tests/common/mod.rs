//! Shared test utilities for the integration suites.
//!
//! Import via `#[path = "../common/mod.rs"] mod common;` from a suite's main.rs.

#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Once};
use tablesnap::{
    BlockPayload, BlockReader, BlockSupplier, FaultInjector, FramedBlock, HeaderView, HostId,
    IdentityCodec, PartitionId, SnapshotConfig, SnapshotMetadata, SnapshotTargetFactory,
    TableBlock, TargetResources, TargetStrategy, TxnId,
};
use tempfile::TempDir;

// ============================================================================
// Initialization
// ============================================================================

static INIT_TRACING: Once = Once::new();

/// Route `tracing` output through the test harness.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

// ============================================================================
// Builders
// ============================================================================

/// Header metadata for `table` on three partitions.
pub fn metadata(table: &str) -> SnapshotMetadata {
    SnapshotMetadata::new(
        TxnId(1001),
        HostId(3),
        "cluster",
        "database",
        table,
        false,
        vec![PartitionId(0), PartitionId(1), PartitionId(2)],
        3,
        1_700_000_000_000,
    )
}

/// Raw block bytes: partition id followed by `len` bytes of `fill`.
pub fn raw_block(partition: i32, fill: u8, len: usize) -> Vec<u8> {
    let mut raw = partition.to_be_bytes().to_vec();
    raw.resize(4 + len, fill);
    raw
}

/// Supplier yielding [`raw_block`].
pub fn supplier(partition: i32, fill: u8, len: usize) -> BlockSupplier {
    let raw = raw_block(partition, fill, len);
    Box::new(move || BlockPayload::Pending(TableBlock::from_payload(raw)))
}

/// Private resources with the identity codec so file sizes are predictable.
pub fn resources(config: &SnapshotConfig) -> TargetResources {
    TargetResources::isolated(config).with_codec(Arc::new(IdentityCodec))
}

/// Resources that fail physical writes as `faults` dictates.
pub fn faulty_resources(config: &SnapshotConfig, faults: &Arc<FaultInjector>) -> TargetResources {
    resources(config).with_faults(Arc::clone(faults))
}

// ============================================================================
// Fixtures
// ============================================================================

/// A snapshot directory and a factory with a forced strategy.
pub struct TestSnapshot {
    pub dir: TempDir,
    pub config: SnapshotConfig,
    pub factory: SnapshotTargetFactory,
}

impl TestSnapshot {
    /// Fixture using [`resources`].
    pub fn new(strategy: TargetStrategy) -> Self {
        let config = SnapshotConfig::for_testing();
        let resources = resources(&config);
        Self::with_resources(strategy, config, resources)
    }

    /// Fixture with explicit configuration and resources.
    pub fn with_resources(
        strategy: TargetStrategy,
        config: SnapshotConfig,
        resources: TargetResources,
    ) -> Self {
        init_tracing();
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let factory = SnapshotTargetFactory::with_strategy(
            dir.path().join("snapshots"),
            "nonce",
            config.clone(),
            resources,
            strategy,
        )
        .expect("Failed to create target factory");
        TestSnapshot {
            dir,
            config,
            factory,
        }
    }
}

/// Both strategies, for parameterized tests.
pub const STRATEGIES: [TargetStrategy; 2] = [TargetStrategy::Buffered, TargetStrategy::DirectIo];

// ============================================================================
// Reading files back
// ============================================================================

/// A snapshot file parsed back from disk.
pub struct SnapshotFile {
    pub bytes: Vec<u8>,
    pub header: HeaderView,
    pub blocks: Vec<FramedBlock>,
}

impl SnapshotFile {
    /// Parse `path`, panicking on any framing error.
    pub fn read(path: &Path) -> Self {
        let bytes = std::fs::read(path).expect("Failed to read snapshot file");
        let header = HeaderView::parse(&bytes).expect("Failed to parse header");
        let blocks = BlockReader::new(&bytes, header.total_len())
            .collect::<Result<Vec<_>, _>>()
            .expect("Failed to read blocks");
        SnapshotFile {
            bytes,
            header,
            blocks,
        }
    }

    /// Raw blocks decoded with the identity codec.
    pub fn raw_blocks(&self) -> Vec<Vec<u8>> {
        self.blocks
            .iter()
            .map(|b| b.decode(&IdentityCodec).expect("Failed to decode block"))
            .collect()
    }

    /// Partition of every block, in file order.
    pub fn partitions(&self) -> Vec<i32> {
        self.blocks.iter().map(|b| b.partition_id.0).collect()
    }
}
