//! Data block framing.
//!
//! # Binary Format (big-endian)
//!
//! ```text
//! body_len (4)       compressed payload + 4 byte trailer
//! partition_id (4)
//! header_crc (4)     CRC32C of the previous 8 bytes
//! payload (body_len - 4)
//! payload_crc (4)    CRC32C of payload
//! ```

use crate::codec::BlockCodec;
use byteorder::{BigEndian, ByteOrder};
use tablesnap_core::{PartitionId, Result, SnapshotError};

/// Bytes of framing in front of every block body.
pub const BLOCK_HEADER_SIZE: usize = 12;
/// Trailing CRC after every compressed payload.
pub const BLOCK_TRAILER_SIZE: usize = 4;

/// Encode the 12-byte block header.
pub fn encode_block_header(body_len: u32, partition_id: PartitionId) -> [u8; BLOCK_HEADER_SIZE] {
    let mut header = [0u8; BLOCK_HEADER_SIZE];
    BigEndian::write_u32(&mut header[0..4], body_len);
    BigEndian::write_i32(&mut header[4..8], partition_id.0);
    let crc = crc32c::crc32c(&header[0..8]);
    BigEndian::write_u32(&mut header[8..12], crc);
    header
}

/// One verified block read back from a snapshot file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedBlock {
    /// Partition that produced the block
    pub partition_id: PartitionId,
    /// Compressed tuple bytes
    pub compressed: Vec<u8>,
    /// Offset of the block header within the scanned buffer
    pub offset: usize,
}

impl FramedBlock {
    /// Decompress and restore the raw block (partition id + tuples).
    pub fn decode(&self, codec: &dyn BlockCodec) -> Result<Vec<u8>> {
        let tuples = codec
            .decompress(&self.compressed)
            .map_err(|e| SnapshotError::Compression(e.to_string()))?;
        let mut raw = Vec::with_capacity(4 + tuples.len());
        raw.extend_from_slice(&self.partition_id.0.to_be_bytes());
        raw.extend_from_slice(&tuples);
        Ok(raw)
    }

    /// On-disk size of the block including framing.
    pub fn framed_len(&self) -> usize {
        BLOCK_HEADER_SIZE + self.compressed.len() + BLOCK_TRAILER_SIZE
    }
}

/// Iterates the data blocks following a snapshot header
///
/// Yields `Err(Corruption)` once on the first damaged or truncated block and
/// then stops.
pub struct BlockReader<'a> {
    data: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> BlockReader<'a> {
    /// Read blocks from `data[start..]`.
    pub fn new(data: &'a [u8], start: usize) -> Self {
        BlockReader {
            data,
            pos: start,
            failed: false,
        }
    }

    /// Offset of the next block.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn read_block(&mut self) -> Result<FramedBlock> {
        let offset = self.pos;
        let rest = &self.data[offset..];
        if rest.len() < BLOCK_HEADER_SIZE {
            return Err(SnapshotError::corruption(format!(
                "truncated block header at offset {}",
                offset
            )));
        }
        let stored = BigEndian::read_u32(&rest[8..12]);
        if crc32c::crc32c(&rest[0..8]) != stored {
            return Err(SnapshotError::corruption(format!(
                "block header CRC mismatch at offset {}",
                offset
            )));
        }
        let body_len = BigEndian::read_u32(&rest[0..4]) as usize;
        let partition_id = PartitionId(BigEndian::read_i32(&rest[4..8]));
        if body_len < BLOCK_TRAILER_SIZE || rest.len() < BLOCK_HEADER_SIZE + body_len {
            return Err(SnapshotError::corruption(format!(
                "block at offset {} claims {} body bytes",
                offset, body_len
            )));
        }
        let body = &rest[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + body_len];
        let (payload, trailer) = body.split_at(body_len - BLOCK_TRAILER_SIZE);
        if crc32c::crc32c(payload) != BigEndian::read_u32(trailer) {
            return Err(SnapshotError::corruption(format!(
                "block payload CRC mismatch at offset {}",
                offset
            )));
        }
        self.pos += BLOCK_HEADER_SIZE + body_len;
        Ok(FramedBlock {
            partition_id,
            compressed: payload.to_vec(),
            offset,
        })
    }
}

impl Iterator for BlockReader<'_> {
    type Item = Result<FramedBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.data.len() {
            return None;
        }
        let block = self.read_block();
        if block.is_err() {
            self.failed = true;
        }
        Some(block)
    }
}
