//! Snapshot digest files.
//!
//! One `<nonce>.digest` per snapshot: a big-endian CRC32 followed by
//! `"<time>,<table>,...\n"`. The CRC covers the text including the newline.

use byteorder::{BigEndian, ByteOrder};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tablesnap_core::{Result, SnapshotError};
use tracing::debug;

/// Decoded digest contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotDigest {
    /// Snapshot time, milliseconds since epoch
    pub time: i64,
    /// Tables included in the snapshot
    pub tables: Vec<String>,
}

/// Path of the digest file for `nonce` in `dir`.
pub fn digest_path(dir: &Path, nonce: &str) -> PathBuf {
    dir.join(format!("{}.digest", nonce))
}

/// Write (or overwrite) the digest for `nonce` and fsync it.
pub fn write_digest(dir: &Path, nonce: &str, time: i64, tables: &[String]) -> Result<PathBuf> {
    if let Some(bad) = tables.iter().find(|t| t.contains(',') || t.contains('\n')) {
        return Err(SnapshotError::serialization(format!(
            "table name '{}' cannot be stored in a digest",
            bad
        )));
    }

    let mut text = time.to_string();
    for table in tables {
        text.push(',');
        text.push_str(table);
    }
    text.push('\n');

    let mut bytes = vec![0u8; 4];
    BigEndian::write_u32(&mut bytes, crc32fast::hash(text.as_bytes()));
    bytes.extend_from_slice(text.as_bytes());

    let path = digest_path(dir, nonce);
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    debug!(path = %path.display(), tables = tables.len(), "Wrote snapshot digest");
    Ok(path)
}

/// Read a digest file and verify its CRC.
pub fn read_digest(path: &Path) -> Result<SnapshotDigest> {
    let bytes = std::fs::read(path)?;
    if bytes.len() < 4 {
        return Err(SnapshotError::corruption(format!(
            "digest {} is truncated",
            path.display()
        )));
    }
    let (crc, text) = bytes.split_at(4);
    if BigEndian::read_u32(crc) != crc32fast::hash(text) {
        return Err(SnapshotError::corruption(format!(
            "digest {} failed CRC check",
            path.display()
        )));
    }
    let text = std::str::from_utf8(text)
        .map_err(|e| SnapshotError::corruption(format!("digest is not UTF-8: {}", e)))?;
    let line = text
        .strip_suffix('\n')
        .ok_or_else(|| SnapshotError::corruption("digest missing trailing newline"))?;

    let mut fields = line.split(',');
    let time = fields
        .next()
        .and_then(|t| t.parse::<i64>().ok())
        .ok_or_else(|| SnapshotError::corruption("digest time is not a number"))?;
    Ok(SnapshotDigest {
        time,
        tables: fields.map(str::to_string).collect(),
    })
}

/// Flush a directory entry after files were created in it.
pub(crate) fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}
