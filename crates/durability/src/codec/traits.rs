//! Block codec trait definitions.

use crate::format::block::{encode_block_header, BLOCK_HEADER_SIZE, BLOCK_TRAILER_SIZE};
use byteorder::{BigEndian, ByteOrder};
use tablesnap_core::{fatal_invariant, PartitionId, SnapshotError};

/// Compression seam for snapshot table blocks.
///
/// Every table block passes through the codec before it is framed and
/// written. The first four bytes of a raw block (the partition id) are never
/// compressed, so a damaged block can still be attributed to its partition.
///
/// # Thread Safety
///
/// Codecs must be `Send + Sync`: blocks of many targets are compressed
/// concurrently on the shared compression pool.
pub trait BlockCodec: Send + Sync {
    /// Compress raw bytes.
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// Reverse [`BlockCodec::compress`].
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// Unique codec identifier.
    fn codec_id(&self) -> &str;

    /// Compress a raw table block and checksum the result.
    ///
    /// `payload` is the block as produced by the scan engine: a 4-byte
    /// partition id followed by serialized tuples.
    fn compress_block(&self, payload: &[u8]) -> tablesnap_core::Result<CompressedBlock> {
        if payload.len() < 4 {
            fatal_invariant(format!(
                "table block has {} bytes, too short for a partition id",
                payload.len()
            ));
        }
        let partition_id = PartitionId(BigEndian::read_i32(&payload[..4]));
        let compressed = self
            .compress(&payload[4..])
            .map_err(|e| SnapshotError::Compression(e.to_string()))?;
        let crc = crc32c::crc32c(&compressed);
        Ok(CompressedBlock {
            partition_id,
            compressed,
            crc,
            raw_len: payload.len(),
        })
    }
}

/// A compressed table block ready for framing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedBlock {
    /// Partition that produced the block
    pub partition_id: PartitionId,
    /// Compressed tuple bytes (partition id excluded)
    pub compressed: Vec<u8>,
    /// CRC32C of `compressed`
    pub crc: u32,
    /// Size of the raw block before compression
    pub raw_len: usize,
}

impl CompressedBlock {
    /// Total on-disk size including block header and trailing CRC.
    pub fn framed_len(&self) -> usize {
        BLOCK_HEADER_SIZE + self.compressed.len() + BLOCK_TRAILER_SIZE
    }

    /// Append the framed block to `out`.
    pub fn write_framed(&self, out: &mut Vec<u8>) {
        let body_len = self.compressed.len() + BLOCK_TRAILER_SIZE;
        out.reserve(self.framed_len());
        out.extend_from_slice(&encode_block_header(body_len as u32, self.partition_id));
        out.extend_from_slice(&self.compressed);
        let mut crc = [0u8; 4];
        BigEndian::write_u32(&mut crc, self.crc);
        out.extend_from_slice(&crc);
    }

    /// The framed block as a fresh buffer.
    pub fn to_framed(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.framed_len());
        self.write_framed(&mut out);
        out
    }
}

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Compression failed
    #[error("Compress error (codec={codec_id}): {detail}")]
    CompressError {
        /// Human-readable error description
        detail: String,
        /// Codec ID that attempted the compression
        codec_id: String,
    },

    /// Decompression failed (corrupt or foreign data).
    #[error("Decompress error (codec={codec_id}, data_len={data_len}): {detail}")]
    DecompressError {
        /// Human-readable error description
        detail: String,
        /// Codec ID that attempted the decode
        codec_id: String,
        /// Length of the data that failed to decode
        data_len: usize,
    },

    /// Unknown codec identifier.
    #[error("Unknown codec: {0}")]
    UnknownCodec(String),
}
