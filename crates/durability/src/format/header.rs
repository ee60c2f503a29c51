//! Snapshot file header.
//!
//! # Binary Format (big-endian)
//!
//! ```text
//! offset 0   crc32 (4)          CRC32 of bytes [4, header_end) with the
//!                               completion flag taken as 1
//! offset 4   header_size (4)    bytes after offset 8 up to the end of schema
//! offset 8   completed (1)      0 while the snapshot is being written
//! offset 9   version (4 x i32)
//! offset 25  json_len (4)
//! offset 29  json metadata
//!            schema bytes
//! ```
//!
//! The CRC is computed as if the file were already complete, so the only
//! byte that ever changes after the header is written is the completion
//! flag. A reader therefore sees a header that is either valid-and-complete
//! or valid-and-incomplete, never one with a stale checksum.

use byteorder::{BigEndian, ByteOrder};
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tablesnap_core::{FormatVersion, HostId, PartitionId, Result, SnapshotError, TxnId};

/// Offset of the header CRC.
pub const HEADER_CRC_OFFSET: usize = 0;
/// Offset of the header size field.
pub const HEADER_SIZE_OFFSET: usize = 4;
/// Offset of the completion flag byte.
pub const COMPLETION_FLAG_OFFSET: usize = 8;
/// Offset of the 4 x i32 version tuple.
pub const VERSION_OFFSET: usize = 9;
/// Offset of the JSON length field.
pub const JSON_LENGTH_OFFSET: usize = 25;
/// Offset of the first JSON byte.
pub const JSON_OFFSET: usize = 29;
/// Bytes preceding the region counted by the header size field.
pub const HEADER_PREFIX_SIZE: usize = 8;

/// Metadata stored as JSON in every snapshot file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    /// Transaction the snapshot is consistent with
    pub txn_id: TxnId,
    /// Host that wrote the file
    pub host_id: HostId,
    /// Cluster name
    pub cluster_name: String,
    /// Database name
    pub database_name: String,
    /// Table name
    pub table_name: String,
    /// Whether the table is replicated on every partition
    pub is_replicated: bool,
    /// Partitions whose data this file contains
    pub partition_ids: Vec<PartitionId>,
    /// Total partitions in the cluster at snapshot time
    pub num_partitions: u32,
    /// Snapshot time, milliseconds since epoch
    pub timestamp: i64,
    /// Snapshot time, RFC 3339 UTC
    pub timestamp_string: String,
    /// Opaque catalog / DR bookkeeping carried for the restore path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

impl SnapshotMetadata {
    /// Metadata for one table file; `timestamp_string` is derived.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        txn_id: TxnId,
        host_id: HostId,
        cluster_name: impl Into<String>,
        database_name: impl Into<String>,
        table_name: impl Into<String>,
        is_replicated: bool,
        partition_ids: Vec<PartitionId>,
        num_partitions: u32,
        timestamp: i64,
    ) -> Self {
        SnapshotMetadata {
            txn_id,
            host_id,
            cluster_name: cluster_name.into(),
            database_name: database_name.into(),
            table_name: table_name.into(),
            is_replicated,
            partition_ids,
            num_partitions,
            timestamp,
            timestamp_string: format_timestamp(timestamp),
            extra: None,
        }
    }

    /// Attach opaque bookkeeping (builder pattern).
    pub fn with_extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = Some(extra);
        self
    }
}

fn format_timestamp(millis: i64) -> String {
    match Utc.timestamp_millis_opt(millis).single() {
        Some(ts) => ts.to_rfc3339(),
        None => millis.to_string(),
    }
}

/// Serialized header bytes, completion flag still 0
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHeader {
    bytes: Vec<u8>,
    crc: u32,
}

impl SnapshotHeader {
    /// Header bytes as they go to disk.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume into the raw buffer.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Total header length in the file.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always false; a header carries at least the fixed fields.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Embedded CRC32.
    pub fn crc(&self) -> u32 {
        self.crc
    }
}

/// Build the header for one snapshot file.
///
/// The JSON is rendered first so its length is known, then the fixed layout
/// is composed with the completion flag set to 1, checksummed, and finally
/// the flag is reset to 0 for the on-disk copy.
pub fn serialize_header(
    metadata: &SnapshotMetadata,
    version: FormatVersion,
    schema: &[u8],
) -> Result<SnapshotHeader> {
    let json = serde_json::to_vec(metadata)
        .map_err(|e| SnapshotError::serialization(format!("snapshot metadata: {}", e)))?;

    let header_size = 1 + 16 + 4 + json.len() + schema.len();
    let mut bytes = vec![0u8; HEADER_PREFIX_SIZE + header_size];

    BigEndian::write_u32(&mut bytes[HEADER_SIZE_OFFSET..], header_size as u32);
    bytes[COMPLETION_FLAG_OFFSET] = 1;
    for (i, part) in version.0.iter().enumerate() {
        BigEndian::write_i32(&mut bytes[VERSION_OFFSET + i * 4..], *part);
    }
    BigEndian::write_u32(&mut bytes[JSON_LENGTH_OFFSET..], json.len() as u32);
    bytes[JSON_OFFSET..JSON_OFFSET + json.len()].copy_from_slice(&json);
    bytes[JSON_OFFSET + json.len()..].copy_from_slice(schema);

    let crc = crc32fast::hash(&bytes[HEADER_SIZE_OFFSET..]);
    BigEndian::write_u32(&mut bytes[HEADER_CRC_OFFSET..], crc);
    bytes[COMPLETION_FLAG_OFFSET] = 0;

    Ok(SnapshotHeader { bytes, crc })
}

/// Parsed and CRC-verified header
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderView {
    /// Embedded CRC32
    pub crc: u32,
    /// Value of the header size field
    pub header_size: usize,
    /// Completion flag
    pub completed: bool,
    /// Format version
    pub version: FormatVersion,
    /// Decoded metadata
    pub metadata: SnapshotMetadata,
    /// Opaque schema bytes
    pub schema: Vec<u8>,
}

impl HeaderView {
    /// Parse the header at the start of `bytes`.
    ///
    /// Fails with `Corruption` on truncation, CRC mismatch, an unknown
    /// completion flag value, or undecodable JSON.
    pub fn parse(bytes: &[u8]) -> Result<HeaderView> {
        if bytes.len() < JSON_OFFSET {
            return Err(SnapshotError::corruption(format!(
                "header truncated: {} bytes",
                bytes.len()
            )));
        }
        let header_size = BigEndian::read_u32(&bytes[HEADER_SIZE_OFFSET..]) as usize;
        let total = HEADER_PREFIX_SIZE + header_size;
        if header_size < JSON_OFFSET - HEADER_PREFIX_SIZE || bytes.len() < total {
            return Err(SnapshotError::corruption(format!(
                "header size {} does not fit in {} bytes",
                header_size,
                bytes.len()
            )));
        }

        let stored_crc = BigEndian::read_u32(&bytes[HEADER_CRC_OFFSET..]);
        if stored_crc != header_crc(&bytes[..total]) {
            return Err(SnapshotError::corruption("header CRC mismatch"));
        }

        let completed = match bytes[COMPLETION_FLAG_OFFSET] {
            0 => false,
            1 => true,
            other => {
                return Err(SnapshotError::corruption(format!(
                    "invalid completion flag {}",
                    other
                )))
            }
        };

        let mut version = [0i32; 4];
        for (i, part) in version.iter_mut().enumerate() {
            *part = BigEndian::read_i32(&bytes[VERSION_OFFSET + i * 4..]);
        }

        let json_len = BigEndian::read_u32(&bytes[JSON_LENGTH_OFFSET..]) as usize;
        if JSON_OFFSET + json_len > total {
            return Err(SnapshotError::corruption("JSON length exceeds header"));
        }
        let metadata: SnapshotMetadata =
            serde_json::from_slice(&bytes[JSON_OFFSET..JSON_OFFSET + json_len])
                .map_err(|e| SnapshotError::corruption(format!("header JSON: {}", e)))?;

        Ok(HeaderView {
            crc: stored_crc,
            header_size,
            completed,
            version: FormatVersion(version),
            metadata,
            schema: bytes[JSON_OFFSET + json_len..total].to_vec(),
        })
    }

    /// Total header length in the file; data blocks start here.
    pub fn total_len(&self) -> usize {
        HEADER_PREFIX_SIZE + self.header_size
    }
}

/// CRC32 of a complete header region with the completion flag taken as 1.
fn header_crc(header: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header[HEADER_SIZE_OFFSET..COMPLETION_FLAG_OFFSET]);
    hasher.update(&[1u8]);
    hasher.update(&header[COMPLETION_FLAG_OFFSET + 1..]);
    hasher.finalize()
}

/// Returns `true` if the header at the start of `bytes` passes its CRC check.
pub fn verify_header_crc(bytes: &[u8]) -> bool {
    HeaderView::parse(bytes).is_ok()
}
