//! Per-generation target factory.

use super::{
    DefaultSnapshotDataTarget, DirectIoSnapshotDataTarget, SnapshotDataTarget, TargetResources,
    TargetSpec, TargetStrategy,
};
use crate::format::digest::{self, sync_dir};
use crate::format::header::SnapshotMetadata;
use crate::format::paths::table_file_name;
use crate::memory_pool::{MemoryPool, PoolRef};
use super::sys;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tablesnap_core::{Result, SnapshotConfig};
use tracing::{debug, info};

const PROBE_FILE: &str = ".tablesnap-direct-io-probe";

/// Returns `true` if files in `dir` can be opened with `O_DIRECT`.
pub fn probe_direct_io(dir: &Path) -> bool {
    let probe = dir.join(PROBE_FILE);
    let supported = sys::create_direct(&probe).is_ok();
    let _ = std::fs::remove_file(&probe);
    debug!(dir = %dir.display(), supported, "Probed O_DIRECT support");
    supported
}

/// Creates the targets of one snapshot generation
///
/// The strategy is chosen once, when the factory is built: direct I/O if it
/// is enabled in the configuration and the directory accepts `O_DIRECT`,
/// buffered otherwise. The factory owns one reference to the generation's
/// [`MemoryPool`]; each direct-I/O target takes another.
pub struct SnapshotTargetFactory {
    dir: PathBuf,
    nonce: String,
    config: SnapshotConfig,
    resources: TargetResources,
    strategy: TargetStrategy,
    pool: MemoryPool,
    pool_ref: Mutex<Option<PoolRef>>,
    created: Mutex<Vec<String>>,
}

impl SnapshotTargetFactory {
    /// Factory writing into `dir` for snapshot `nonce`.
    pub fn new(
        dir: impl Into<PathBuf>,
        nonce: impl Into<String>,
        config: SnapshotConfig,
        resources: TargetResources,
    ) -> Result<Self> {
        config.validate()?;
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let strategy = if config.direct_io_enabled && probe_direct_io(&dir) {
            TargetStrategy::DirectIo
        } else {
            TargetStrategy::Buffered
        };
        let pool = MemoryPool::new(config.page_size);
        let pool_ref = pool.reference();
        let nonce = nonce.into();
        info!(
            dir = %dir.display(),
            nonce = %nonce,
            strategy = %strategy,
            direct_io_requested = config.direct_io_enabled,
            "Snapshot target strategy selected"
        );

        Ok(SnapshotTargetFactory {
            dir,
            nonce,
            config,
            resources,
            strategy,
            pool,
            pool_ref: Mutex::new(Some(pool_ref)),
            created: Mutex::new(Vec::new()),
        })
    }

    /// Factory with the direct-I/O choice forced, bypassing the probe.
    pub fn with_strategy(
        dir: impl Into<PathBuf>,
        nonce: impl Into<String>,
        config: SnapshotConfig,
        resources: TargetResources,
        strategy: TargetStrategy,
    ) -> Result<Self> {
        let mut factory = Self::new(dir, nonce, config.with_direct_io(false), resources)?;
        factory.config.direct_io_enabled = strategy == TargetStrategy::DirectIo;
        factory.strategy = strategy;
        Ok(factory)
    }

    /// Strategy used for every target of this generation.
    pub fn strategy(&self) -> TargetStrategy {
        self.strategy
    }

    /// Snapshot directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot nonce.
    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    /// The generation's buffer pool.
    pub fn pool(&self) -> &MemoryPool {
        &self.pool
    }

    /// Path the target for `metadata` would be written to.
    pub fn target_path(&self, metadata: &SnapshotMetadata) -> PathBuf {
        self.dir.join(table_file_name(
            &self.nonce,
            &metadata.table_name,
            metadata.host_id,
            metadata.is_replicated,
        ))
    }

    /// Create the target for one table.
    pub fn create_target(
        &self,
        metadata: SnapshotMetadata,
        schema: Vec<u8>,
    ) -> Result<Arc<dyn SnapshotDataTarget>> {
        let spec = TargetSpec::new(self.target_path(&metadata), metadata, schema);
        self.create_target_from_spec(&spec)
    }

    /// Create a target from a fully specified [`TargetSpec`].
    pub fn create_target_from_spec(&self, spec: &TargetSpec) -> Result<Arc<dyn SnapshotDataTarget>> {
        let target: Arc<dyn SnapshotDataTarget> = match self.strategy {
            TargetStrategy::Buffered => Arc::new(DefaultSnapshotDataTarget::open(
                spec,
                &self.config,
                self.resources.clone(),
            )?),
            TargetStrategy::DirectIo => {
                let pool = match &*self.pool_ref.lock() {
                    Some(r) => r.clone(),
                    None => self.pool.reference(),
                };
                Arc::new(DirectIoSnapshotDataTarget::open(
                    spec,
                    &self.config,
                    self.resources.clone(),
                    pool,
                )?)
            }
        };
        self.created.lock().push(spec.metadata.table_name.clone());
        Ok(target)
    }

    /// Write the generation's digest listing every table created so far.
    pub fn write_digest(&self, time: i64) -> Result<PathBuf> {
        let tables = self.created.lock().clone();
        let path = digest::write_digest(&self.dir, &self.nonce, time, &tables)?;
        sync_dir(&self.dir)?;
        Ok(path)
    }

    /// Drop the factory's pool reference. Targets still open keep theirs.
    pub fn release(&self) {
        let pool_ref = self.pool_ref.lock().take();
        if pool_ref.is_some() {
            debug!(nonce = %self.nonce, "Released factory memory pool reference");
        }
    }
}

impl Drop for SnapshotTargetFactory {
    fn drop(&mut self) {
        self.release();
    }
}
