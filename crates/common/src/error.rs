use thiserror::Error;

/// Canonical Quarry error taxonomy used across crates.
///
/// Classification guidance:
/// - [`QuarryError::MemLimitExceeded`]: a requested consumption would breach a
///   memory limit; recoverable — the caller may spill, run GC and retry, or
///   fail the query
/// - [`QuarryError::ScratchLimitExceeded`]: a spill allocation would breach the
///   file group's aggregate scratch limit; recoverable only by failing the
///   requesting operator or query, never retried internally
/// - [`QuarryError::InvalidConfig`]: configuration/environment/path contract
///   violations discovered at startup
/// - [`QuarryError::Io`]: raw filesystem IO failures from std APIs
///
/// Programming errors (duplicate query or fragment-instance registration,
/// accounting calls after resources were released) are not represented here;
/// they panic at the violation site because they indicate a bug in the caller,
/// not an operational condition.
#[derive(Debug, Error)]
pub enum QuarryError {
    /// A requested consumption would push a tracker over its memory limit.
    ///
    /// `details` carries the recursive usage dump of the tracker hierarchy at
    /// failure time so operators can see which tracker (query, pool, or
    /// process) was the binding constraint.
    #[error("memory limit exceeded: {details}")]
    MemLimitExceeded {
        /// Human-readable hierarchy breakdown captured at failure time.
        details: String,
    },

    /// A scratch allocation would exceed the file group's aggregate limit.
    #[error("scratch limit exceeded: limit={limit} requested={requested}")]
    ScratchLimitExceeded {
        /// Configured aggregate scratch byte limit.
        limit: i64,
        /// Bytes requested by the failed allocation.
        requested: i64,
    },

    /// Invalid or inconsistent configuration state.
    ///
    /// Examples:
    /// - no usable scratch directory after initialization
    /// - allocation request against an unknown scratch device
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Transparent std IO failures.
    ///
    /// Examples:
    /// - scratch file extension failed on a full or read-only device
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl QuarryError {
    /// True for the memory-limit variant; used by callers deciding whether a
    /// failed allocation can be recovered by spilling or GC.
    pub fn is_mem_limit_exceeded(&self) -> bool {
        matches!(self, QuarryError::MemLimitExceeded { .. })
    }

    /// True for the scratch-limit variant.
    pub fn is_scratch_limit_exceeded(&self) -> bool {
        matches!(self, QuarryError::ScratchLimitExceeded { .. })
    }
}

/// Standard Quarry result alias.
pub type Result<T> = std::result::Result<T, QuarryError>;
