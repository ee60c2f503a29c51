//! Snapshot pipeline configuration
//!
//! Tunables are read from a TOML file, from process properties in the
//! environment, or both (environment wins). Property names are part of the
//! operational interface and must not change.
//!
//! # Example
//!
//! ```toml
//! sync_frequency_ms = 500
//! fadvise_bytes = 2097152
//! direct_io_enabled = false
//! # rate_limit_mb_per_sec = 100
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Period of the sync/fadvise housekeeping task, in milliseconds.
pub const SNAPSHOT_SYNC_FREQUENCY: &str = "SNAPSHOT_SYNC_FREQUENCY";
/// Durable bytes accumulated before the page cache is told to drop them.
pub const SNAPSHOT_FADVISE_BYTES: &str = "SNAPSHOT_FADVISE_BYTES";
/// Pages accumulated by the direct-I/O write stage before a vectored write.
pub const SNAPSHOT_DIRECT_IO_WRITE_PAGES: &str = "SNAPSHOT_DIRECT_IO_WRITE_PAGES";
/// Process-wide snapshot write rate limit in megabytes per second.
pub const SNAPSHOT_RATELIMIT_MEGABYTES: &str = "SNAPSHOT_RATELIMIT_MEGABYTES";
/// Byte budget that may be written but not yet synced across all targets.
pub const SNAPSHOT_BYTES_BEFORE_SYNC: &str = "SNAPSHOT_BYTES_BEFORE_SYNC";
/// Unsynced bytes per target that trigger a sync-file-range.
pub const SNAPSHOT_SYNC_THRESHOLD_BYTES: &str = "SNAPSHOT_SYNC_THRESHOLD_BYTES";
/// Enables the direct-I/O strategy where the directory supports it.
pub const SNAPSHOT_DIRECT_IO: &str = "SNAPSHOT_DIRECT_IO";
/// Alignment unit for direct-I/O buffers and offsets.
pub const SNAPSHOT_PAGE_SIZE: &str = "SNAPSHOT_PAGE_SIZE";

/// Snapshot pipeline configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Sync task period in milliseconds (default: 500)
    pub sync_frequency_ms: u64,
    /// Synced bytes between page-cache drop hints (default: 2MB)
    pub fadvise_bytes: u64,
    /// Pages per vectored direct-I/O write (default: 64)
    pub direct_io_write_pages: usize,
    /// Global write rate limit in MB/s; `None` means unthrottled
    pub rate_limit_mb_per_sec: Option<u64>,
    /// Process-wide written-but-unsynced byte budget (default: 256MB)
    pub bytes_before_sync: u64,
    /// Unsynced bytes per target before the sync task acts (default: 4MB)
    pub sync_threshold_bytes: u64,
    /// Use the direct-I/O strategy when the target directory supports it
    pub direct_io_enabled: bool,
    /// Page size for direct-I/O alignment (default: 4096)
    pub page_size: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        SnapshotConfig {
            sync_frequency_ms: 500,
            fadvise_bytes: 2 * 1024 * 1024,
            direct_io_write_pages: 64,
            rate_limit_mb_per_sec: None,
            bytes_before_sync: 256 * 1024 * 1024,
            sync_threshold_bytes: 4 * 1024 * 1024,
            direct_io_enabled: false,
            page_size: 4096,
        }
    }
}

impl SnapshotConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the process environment on top of defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {}", path.display(), e)))?;
        let config: SnapshotConfig =
            toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from a property lookup and validate the result.
    ///
    /// `lookup` maps a property name to its raw string value.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_prop::<u64>(&lookup, SNAPSHOT_SYNC_FREQUENCY)? {
            self.sync_frequency_ms = v;
        }
        if let Some(v) = parse_prop::<u64>(&lookup, SNAPSHOT_FADVISE_BYTES)? {
            self.fadvise_bytes = v;
        }
        if let Some(v) = parse_prop::<usize>(&lookup, SNAPSHOT_DIRECT_IO_WRITE_PAGES)? {
            self.direct_io_write_pages = v;
        }
        if let Some(v) = parse_prop::<u64>(&lookup, SNAPSHOT_RATELIMIT_MEGABYTES)? {
            // Zero keeps the historical meaning of "no limit"
            self.rate_limit_mb_per_sec = if v == 0 { None } else { Some(v) };
        }
        if let Some(v) = parse_prop::<u64>(&lookup, SNAPSHOT_BYTES_BEFORE_SYNC)? {
            self.bytes_before_sync = v;
        }
        if let Some(v) = parse_prop::<u64>(&lookup, SNAPSHOT_SYNC_THRESHOLD_BYTES)? {
            self.sync_threshold_bytes = v;
        }
        if let Some(v) = parse_prop::<bool>(&lookup, SNAPSHOT_DIRECT_IO)? {
            self.direct_io_enabled = v;
        }
        if let Some(v) = parse_prop::<usize>(&lookup, SNAPSHOT_PAGE_SIZE)? {
            self.page_size = v;
        }
        self.validate()?;
        Ok(self)
    }

    /// Set the direct-I/O switch (builder pattern).
    pub fn with_direct_io(mut self, enabled: bool) -> Self {
        self.direct_io_enabled = enabled;
        self
    }

    /// Set the rate limit (builder pattern).
    pub fn with_rate_limit_mb(mut self, mb_per_sec: Option<u64>) -> Self {
        self.rate_limit_mb_per_sec = mb_per_sec;
        self
    }

    /// Set the sync period (builder pattern).
    pub fn with_sync_frequency_ms(mut self, ms: u64) -> Self {
        self.sync_frequency_ms = ms;
        self
    }

    /// Set the per-target sync threshold (builder pattern).
    pub fn with_sync_threshold_bytes(mut self, bytes: u64) -> Self {
        self.sync_threshold_bytes = bytes;
        self
    }

    /// Set the pages per direct-I/O write (builder pattern).
    pub fn with_direct_io_write_pages(mut self, pages: usize) -> Self {
        self.direct_io_write_pages = pages;
        self
    }

    /// Set the byte budget (builder pattern).
    pub fn with_bytes_before_sync(mut self, bytes: u64) -> Self {
        self.bytes_before_sync = bytes;
        self
    }

    /// Rate limit converted to bytes per second.
    pub fn rate_limit_bytes_per_sec(&self) -> Option<u64> {
        self.rate_limit_mb_per_sec.map(|mb| mb.saturating_mul(1024 * 1024))
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync_frequency_ms == 0 {
            return Err(ConfigError::Invalid(format!(
                "{} must be greater than zero",
                SNAPSHOT_SYNC_FREQUENCY
            )));
        }
        if !self.page_size.is_power_of_two() || self.page_size < 512 {
            return Err(ConfigError::Invalid(format!(
                "{} must be a power of two >= 512, got {}",
                SNAPSHOT_PAGE_SIZE, self.page_size
            )));
        }
        if self.direct_io_write_pages == 0 {
            return Err(ConfigError::Invalid(format!(
                "{} must be greater than zero",
                SNAPSHOT_DIRECT_IO_WRITE_PAGES
            )));
        }
        if self.bytes_before_sync == 0 {
            return Err(ConfigError::Invalid(format!(
                "{} must be greater than zero",
                SNAPSHOT_BYTES_BEFORE_SYNC
            )));
        }
        if self.sync_threshold_bytes > self.bytes_before_sync / 4 {
            return Err(ConfigError::Invalid(format!(
                "{} ({}) must not exceed a quarter of {} ({})",
                SNAPSHOT_SYNC_THRESHOLD_BYTES,
                self.sync_threshold_bytes,
                SNAPSHOT_BYTES_BEFORE_SYNC,
                self.bytes_before_sync
            )));
        }
        Ok(())
    }

    /// Create a configuration suited to tests: fast sync, small thresholds.
    pub fn for_testing() -> Self {
        SnapshotConfig {
            sync_frequency_ms: 10,
            fadvise_bytes: 64 * 1024,
            direct_io_write_pages: 4,
            rate_limit_mb_per_sec: None,
            bytes_before_sync: 16 * 1024 * 1024,
            sync_threshold_bytes: 32 * 1024,
            direct_io_enabled: false,
            page_size: 4096,
        }
    }
}

fn parse_prop<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, ConfigError> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            ConfigError::Invalid(format!("{} has unparseable value '{}'", name, raw))
        }),
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Cannot read snapshot config: {0}")]
    Read(String),

    /// Config file is not valid TOML for this schema
    #[error("Cannot parse snapshot config: {0}")]
    Parse(String),

    /// A value is out of range
    #[error("Invalid snapshot config: {0}")]
    Invalid(String),
}

impl From<ConfigError> for crate::SnapshotError {
    fn from(e: ConfigError) -> Self {
        crate::SnapshotError::InvalidConfig(e.to_string())
    }
}
