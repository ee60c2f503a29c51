//! Identifier types shared across the snapshot pipeline
//!
//! - TableId: catalog-relative index of a table
//! - PartitionId: partition that produced a block of tuples
//! - HostId: cluster host writing the snapshot
//! - TxnId: transaction the snapshot is consistent with
//! - StreamType: why a table stream was activated
//! - FormatVersion: 4-part version tuple embedded in every snapshot file

use serde::{Deserialize, Serialize};
use std::fmt;

/// Catalog-relative table identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId(pub u32);

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table#{}", self.0)
    }
}

/// Partition identifier carried in the first 4 bytes of every table block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId(pub i32);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition#{}", self.0)
    }
}

/// Cluster host identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostId(pub i32);

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction identifier a snapshot is consistent with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId(pub i64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Purpose of a table stream
///
/// Opaque to the persistence core; forwarded to the scan engine so it can
/// pick the right dirty-tracking scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamType {
    /// Point-in-time snapshot to disk
    Snapshot,
    /// Elastic rebalance of partitions between hosts
    ElasticRebalance,
    /// Initial state transfer for DR replication
    DisasterRecovery,
}

impl StreamType {
    /// Numeric code passed to the scan engine.
    pub fn code(self) -> i32 {
        match self {
            StreamType::Snapshot => 0,
            StreamType::ElasticRebalance => 1,
            StreamType::DisasterRecovery => 2,
        }
    }
}

/// Snapshot file format version (four 32-bit components)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatVersion(pub [i32; 4]);

impl FormatVersion {
    /// Version written by this implementation.
    pub const CURRENT: FormatVersion = FormatVersion([0, 0, 0, 2]);
}

impl Default for FormatVersion {
    fn default() -> Self {
        FormatVersion::CURRENT
    }
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{}.{}.{}.{}", a, b, c, d)
    }
}
