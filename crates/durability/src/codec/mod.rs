//! Block compression codecs.
//!
//! Table blocks are compressed before framing. `ZstdCodec` is the default;
//! `IdentityCodec` stores blocks uncompressed and is mostly useful for
//! diagnosing corrupted files and for tests that need predictable sizes.

mod traits;

pub use traits::{BlockCodec, CodecError, CompressedBlock};

use std::sync::Arc;

/// Default zstd level: favours throughput, snapshots are write-heavy.
pub const DEFAULT_ZSTD_LEVEL: i32 = 1;

/// zstd-backed block codec
#[derive(Debug, Clone, Copy)]
pub struct ZstdCodec {
    level: i32,
}

impl ZstdCodec {
    /// Codec with an explicit compression level.
    pub fn with_level(level: i32) -> Self {
        ZstdCodec { level }
    }
}

impl Default for ZstdCodec {
    fn default() -> Self {
        ZstdCodec {
            level: DEFAULT_ZSTD_LEVEL,
        }
    }
}

impl BlockCodec for ZstdCodec {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        zstd::bulk::compress(data, self.level).map_err(|e| CodecError::CompressError {
            detail: e.to_string(),
            codec_id: self.codec_id().to_string(),
        })
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        zstd::stream::decode_all(data).map_err(|e| CodecError::DecompressError {
            detail: e.to_string(),
            codec_id: self.codec_id().to_string(),
            data_len: data.len(),
        })
    }

    fn codec_id(&self) -> &str {
        "zstd"
    }
}

/// Pass-through codec
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCodec;

impl BlockCodec for IdentityCodec {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(data.to_vec())
    }

    fn codec_id(&self) -> &str {
        "identity"
    }
}

/// Get a codec by its identifier.
///
/// # Known Codecs
///
/// - `"zstd"`: zstd at [`DEFAULT_ZSTD_LEVEL`]
/// - `"identity"`: no compression
pub fn get_codec(codec_id: &str) -> Result<Arc<dyn BlockCodec>, CodecError> {
    match codec_id {
        "zstd" => Ok(Arc::new(ZstdCodec::default())),
        "identity" => Ok(Arc::new(IdentityCodec)),
        _ => Err(CodecError::UnknownCodec(codec_id.to_string())),
    }
}
