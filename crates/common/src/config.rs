use serde::{Deserialize, Serialize};

/// Process-wide resource runtime configuration.
///
/// Byte limits use `-1` for "unlimited"; scratch directories left empty fall
/// back to a single directory under the system temp dir.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Ordered scratch directory paths used for spill files.
    pub scratch_dirs: Vec<String>,
    /// Use only one scratch directory per distinct physical device.
    pub one_dir_per_device: bool,
    /// Process-wide memory limit in bytes (`-1` = unlimited).
    pub process_mem_limit_bytes: i64,
    /// Default per-query memory limit applied when query options carry none.
    pub default_query_mem_limit_bytes: i64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            scratch_dirs: Vec::new(),
            one_dir_per_device: false,
            process_mem_limit_bytes: -1,
            default_query_mem_limit_bytes: -1,
        }
    }
}

/// Per-query resource options supplied at admission time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Query memory limit in bytes (`<= 0` = unlimited).
    pub mem_limit_bytes: i64,
    /// Aggregate scratch (spill) byte limit for the query (`-1` = unlimited).
    pub scratch_limit_bytes: i64,
    /// Execution batch size; fixed up to the default when unset (`<= 0`).
    pub batch_size_rows: i64,
    /// Admission resource pool the query was placed in.
    pub pool: String,
}

/// Batch size used when query options carry none.
pub const DEFAULT_BATCH_SIZE_ROWS: i64 = 1024;

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            mem_limit_bytes: -1,
            scratch_limit_bytes: -1,
            batch_size_rows: DEFAULT_BATCH_SIZE_ROWS,
            pool: "default-pool".to_string(),
        }
    }
}
