//! Backend resource management for Quarry.
//!
//! This crate owns the process-side resource model that query execution runs
//! on top of:
//!
//! - `mem_tracker`: hierarchical memory accounting and limit enforcement
//!   (process, pool, query, fragment levels) with interned pool/query
//!   trackers and garbage-collection hooks.
//! - `tmp_file_mgr`: scratch-device management and per-query temporary file
//!   groups for operators that spill, with round-robin placement and a
//!   per-query scratch byte limit.
//! - `query_state`: refcounted per-query state tying the two together, plus
//!   the process-wide [`QueryExecMgr`] that interns it by query id.
//! - `mem_info`: best-effort physical memory detection.

pub mod mem_info;
pub mod mem_tracker;
pub mod query_state;
pub mod tmp_file_mgr;

pub use mem_tracker::{MemTracker, TrackerRegistry};
pub use query_state::{FragmentInstanceState, QueryExecMgr, QueryState, ScopedRef};
pub use tmp_file_mgr::{DeviceId, TmpFile, TmpFileGroup, TmpFileMgr, TMP_SUB_DIR_NAME};
