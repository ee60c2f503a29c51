//! On-disk format of snapshot files.
//!
//! - `header`: CRC-protected file header with JSON metadata and schema
//! - `block`: framing of compressed table blocks
//! - `digest`: per-snapshot digest listing the tables
//! - `paths`: table file naming

pub mod block;
pub mod digest;
pub mod header;
pub mod paths;

pub use block::{encode_block_header, BlockReader, FramedBlock, BLOCK_HEADER_SIZE, BLOCK_TRAILER_SIZE};
pub use digest::{digest_path, read_digest, write_digest, SnapshotDigest};
pub use header::{
    serialize_header, verify_header_crc, HeaderView, SnapshotHeader, SnapshotMetadata,
    COMPLETION_FLAG_OFFSET,
};
pub use paths::table_file_name;
