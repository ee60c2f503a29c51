//! Snapshot file naming.

use tablesnap_core::HostId;

/// Extension of per-table snapshot files.
pub const TABLE_FILE_EXTENSION: &str = "vpt";

/// File name for one table of snapshot `nonce`.
///
/// Replicated tables are written once per cluster so the name carries no host;
/// partitioned tables get one file per host.
pub fn table_file_name(nonce: &str, table: &str, host_id: HostId, is_replicated: bool) -> String {
    if is_replicated {
        format!("{}-{}.{}", nonce, table, TABLE_FILE_EXTENSION)
    } else {
        format!("{}-{}-host_{}.{}", nonce, table, host_id, TABLE_FILE_EXTENSION)
    }
}
