//! Scratch ("spill") space management.
//!
//! [`TmpFileMgr`] owns the set of scratch devices configured for the process:
//! one device per scratch directory, or one per distinct physical device when
//! configured. [`TmpFileGroup`] is the per-query view: a collection of
//! [`TmpFile`]s spanning the devices, selected round-robin, with an optional
//! aggregate byte limit shared by all files in the group.
//!
//! Failure policy:
//! - initialization fails open: an unusable directory is dropped with a
//!   warning, and only zero usable devices is a configuration error;
//! - file-level I/O errors are recorded and surfaced but never remove a
//!   device from rotation (blacklisting is a manual, separately invoked
//!   policy via [`TmpFileMgr::blacklist_device`]);
//! - deleting backing storage on close is best-effort; failures are logged
//!   and never escalated.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use quarry_common::{MetricsRegistry, QuarryError, QueryId, Result, RuntimeConfig};
use tracing::{debug, info, warn};

/// Subdirectory created beneath every configured scratch directory.
pub const TMP_SUB_DIR_NAME: &str = "quarry-scratch";

/// Dense, process-stable scratch device identifier.
pub type DeviceId = usize;

#[derive(Debug)]
struct TmpDevice {
    /// Absolute path of the device's scratch subdirectory.
    path: PathBuf,
    active: AtomicBool,
}

/// Process-wide scratch device set.
#[derive(Debug)]
pub struct TmpFileMgr {
    devices: Vec<TmpDevice>,
    metrics: MetricsRegistry,
}

impl TmpFileMgr {
    /// Validate the configured scratch directories and register one device
    /// per directory (or per distinct physical device when
    /// `one_dir_per_device`). Absent configuration yields a single device
    /// under the system temp dir.
    pub fn new(config: &RuntimeConfig, metrics: &MetricsRegistry) -> Result<TmpFileMgr> {
        let dirs: Vec<PathBuf> = if config.scratch_dirs.is_empty() {
            vec![std::env::temp_dir()]
        } else {
            config.scratch_dirs.iter().map(PathBuf::from).collect()
        };

        let mut devices: Vec<TmpDevice> = Vec::new();
        let mut seen_physical: Vec<u64> = Vec::new();
        for dir in &dirs {
            let scratch = dir.join(TMP_SUB_DIR_NAME);
            if let Err(e) = fs::create_dir_all(&scratch) {
                warn!(dir = %scratch.display(), error = %e, "dropping unusable scratch directory");
                continue;
            }
            if config.one_dir_per_device {
                match physical_device_of(&scratch) {
                    Some(dev) if seen_physical.contains(&dev) => {
                        debug!(
                            dir = %scratch.display(),
                            "skipping scratch directory on an already-used physical device"
                        );
                        continue;
                    }
                    Some(dev) => seen_physical.push(dev),
                    None => {}
                }
            }
            devices.push(TmpDevice {
                path: scratch,
                active: AtomicBool::new(true),
            });
        }

        if devices.is_empty() {
            return Err(QuarryError::InvalidConfig(
                "no usable scratch directories after initialization".to_string(),
            ));
        }
        info!(num_devices = devices.len(), "scratch devices initialized");
        metrics.set_active_scratch_dirs(devices.len());
        Ok(TmpFileMgr {
            devices,
            metrics: metrics.clone(),
        })
    }

    pub fn num_active_tmp_devices(&self) -> usize {
        self.active_tmp_devices().len()
    }

    /// Ids of devices currently usable for new allocations.
    pub fn active_tmp_devices(&self) -> Vec<DeviceId> {
        self.devices
            .iter()
            .enumerate()
            .filter(|(_, d)| d.active.load(Ordering::Acquire))
            .map(|(id, _)| id)
            .collect()
    }

    /// Total configured devices, including blacklisted ones.
    pub fn total_tmp_devices(&self) -> usize {
        self.devices.len()
    }

    /// Scratch directory path for a device; `None` for unknown ids.
    pub fn tmp_dir_path(&self, device_id: DeviceId) -> Option<&Path> {
        self.devices.get(device_id).map(|d| d.path.as_path())
    }

    /// Manually remove a device from future allocation. Existing files on it
    /// stay addressable until their groups close. Never invoked by the
    /// runtime itself: file-level errors deliberately do not trigger this.
    pub fn blacklist_device(&self, device_id: DeviceId) {
        if let Some(device) = self.devices.get(device_id) {
            if device.active.swap(false, Ordering::AcqRel) {
                warn!(device_id, dir = %device.path.display(), "scratch device blacklisted");
            }
            self.metrics
                .set_active_scratch_dirs(self.num_active_tmp_devices());
        }
    }

    fn device(&self, device_id: DeviceId) -> Result<&TmpDevice> {
        self.devices.get(device_id).ok_or_else(|| {
            QuarryError::InvalidConfig(format!("unknown scratch device id {device_id}"))
        })
    }
}

#[cfg(unix)]
fn physical_device_of(path: &Path) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    fs::metadata(path).ok().map(|m| m.dev())
}

#[cfg(not(unix))]
fn physical_device_of(_path: &Path) -> Option<u64> {
    None
}

#[derive(Debug, Default)]
struct TmpFileState {
    /// High-water mark of allocated bytes; offsets never regress or overlap.
    bytes_allocated: i64,
    /// First I/O error observed, kept until cleared.
    io_error: Option<String>,
}

/// One scratch file on one device.
///
/// Creation is lazy: nothing touches disk until the first allocation, so
/// operators that never spill cause no empty-file churn.
#[derive(Debug)]
pub struct TmpFile {
    mgr: Arc<TmpFileMgr>,
    device_id: DeviceId,
    path: PathBuf,
    state: Mutex<TmpFileState>,
}

impl TmpFile {
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Whether this file's device has been manually blacklisted. I/O errors
    /// never set this; see [`TmpFileMgr::blacklist_device`].
    pub fn blacklisted(&self) -> bool {
        self.mgr
            .devices
            .get(self.device_id)
            .is_some_and(|d| !d.active.load(Ordering::Acquire))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_allocated(&self) -> i64 {
        lock(&self.state).bytes_allocated
    }

    /// First recorded I/O error, if any.
    pub fn io_error(&self) -> Option<String> {
        lock(&self.state).io_error.clone()
    }

    /// Record an I/O error observed by a caller. Only the first report is
    /// kept until [`TmpFile::clear_io_error`]; the error is observational and
    /// does not stop further allocation on this file or its device.
    pub fn report_io_error(&self, msg: &str) {
        let mut state = lock(&self.state);
        if state.io_error.is_none() {
            warn!(file = %self.path.display(), error = msg, "scratch file I/O error reported");
            state.io_error = Some(msg.to_string());
        }
    }

    pub fn clear_io_error(&self) {
        lock(&self.state).io_error = None;
    }

    /// Allocate `num_bytes` at the current high-water mark, extending the
    /// file on disk. Returns the offset of the new range. On failure the
    /// error is recorded on the file and surfaced; the mark does not advance.
    fn allocate_space(&self, num_bytes: i64) -> Result<i64> {
        debug_assert!(num_bytes > 0);
        let mut state = lock(&self.state);
        let offset = state.bytes_allocated;
        let new_size = offset + num_bytes;

        let extend = || -> std::io::Result<()> {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .open(&self.path)?;
            file.set_len(new_size as u64)
        };
        if let Err(e) = extend() {
            if state.io_error.is_none() {
                warn!(file = %self.path.display(), error = %e, "scratch file extend failed");
                state.io_error = Some(e.to_string());
            }
            return Err(QuarryError::Io(e));
        }
        state.bytes_allocated = new_size;
        Ok(offset)
    }
}

/// Per-query collection of scratch files spanning the configured devices.
#[derive(Debug)]
pub struct TmpFileGroup {
    mgr: Arc<TmpFileMgr>,
    metrics: MetricsRegistry,
    query_id: QueryId,
    /// Aggregate byte limit shared by all files in the group; `-1` unlimited.
    scratch_limit: i64,
    scratch_allocated: AtomicI64,
    /// Round-robin pointer over `files`; advances regardless of allocation
    /// success for fairness across devices.
    next_file: AtomicUsize,
    file_seq: AtomicU64,
    files: Mutex<Vec<Arc<TmpFile>>>,
    closed: AtomicBool,
}

impl TmpFileGroup {
    pub fn new(mgr: &Arc<TmpFileMgr>, query_id: QueryId, scratch_limit: i64) -> TmpFileGroup {
        TmpFileGroup {
            mgr: Arc::clone(mgr),
            metrics: mgr.metrics.clone(),
            query_id,
            scratch_limit,
            scratch_allocated: AtomicI64::new(0),
            next_file: AtomicUsize::new(0),
            file_seq: AtomicU64::new(0),
            files: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn scratch_limit(&self) -> i64 {
        self.scratch_limit
    }

    /// Aggregate bytes currently allocated across all files in the group.
    pub fn scratch_allocated(&self) -> i64 {
        self.scratch_allocated.load(Ordering::Acquire)
    }

    /// Create a fresh scratch file on `device_id` scoped to this group.
    /// Does not touch disk; the file is created by its first allocation.
    pub fn new_file(&self, device_id: DeviceId) -> Result<Arc<TmpFile>> {
        self.check_open();
        let mut files = lock(&self.files);
        self.new_file_locked(&mut files, device_id)
    }

    fn new_file_locked(
        &self,
        files: &mut Vec<Arc<TmpFile>>,
        device_id: DeviceId,
    ) -> Result<Arc<TmpFile>> {
        let device = self.mgr.device(device_id)?;
        if !device.active.load(Ordering::Acquire) {
            return Err(QuarryError::InvalidConfig(format!(
                "scratch device {device_id} is blacklisted"
            )));
        }
        let seq = self.file_seq.fetch_add(1, Ordering::Relaxed);
        let path = device.path.join(format!("{}_{}", self.query_id, seq));
        let file = Arc::new(TmpFile {
            mgr: Arc::clone(&self.mgr),
            device_id,
            path,
            state: Mutex::new(TmpFileState::default()),
        });
        files.push(Arc::clone(&file));
        Ok(file)
    }

    /// Allocate `num_bytes` of scratch space on the next file in round-robin
    /// order. The aggregate limit is checked atomically before any file is
    /// touched; a request that would exceed it fails with
    /// [`QuarryError::ScratchLimitExceeded`] and no partial allocation.
    ///
    /// On first use the group lazily creates one file per active device.
    pub fn allocate_space(&self, num_bytes: i64) -> Result<(Arc<TmpFile>, i64)> {
        self.check_open();
        debug_assert!(num_bytes > 0);

        // Reserve against the aggregate counter first; rolled back if the
        // file-level allocation fails. This keeps the limit exact under
        // concurrent requests.
        let reserve = self
            .scratch_allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                if self.scratch_limit >= 0 && cur + num_bytes > self.scratch_limit {
                    None
                } else {
                    Some(cur + num_bytes)
                }
            });
        if reserve.is_err() {
            return Err(QuarryError::ScratchLimitExceeded {
                limit: self.scratch_limit,
                requested: num_bytes,
            });
        }

        let file = {
            let mut files = lock(&self.files);
            if files.is_empty() {
                for device_id in self.mgr.active_tmp_devices() {
                    if let Err(e) = self.new_file_locked(&mut files, device_id) {
                        self.scratch_allocated.fetch_sub(num_bytes, Ordering::AcqRel);
                        return Err(e);
                    }
                }
            }
            if files.is_empty() {
                self.scratch_allocated.fetch_sub(num_bytes, Ordering::AcqRel);
                return Err(QuarryError::InvalidConfig(
                    "no active scratch devices".to_string(),
                ));
            }
            let idx = self.next_file.fetch_add(1, Ordering::Relaxed) % files.len();
            Arc::clone(&files[idx])
        };

        match file.allocate_space(num_bytes) {
            Ok(offset) => {
                self.metrics
                    .add_scratch_allocated(&self.query_id.to_string(), num_bytes);
                Ok((file, offset))
            }
            Err(e) => {
                self.scratch_allocated.fetch_sub(num_bytes, Ordering::AcqRel);
                Err(e)
            }
        }
    }

    /// Delete every file's backing storage and release the group's tracked
    /// allocation. Safe to call more than once; only the first call acts.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let files = std::mem::take(&mut *lock(&self.files));
        for file in files {
            match fs::remove_file(file.path()) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // Never allocated, so never created on disk.
                }
                Err(e) => {
                    warn!(file = %file.path().display(), error = %e, "failed to delete scratch file");
                }
            }
        }
        self.scratch_allocated.store(0, Ordering::Release);
        self.metrics
            .reset_scratch_allocated(&self.query_id.to_string());
    }

    fn check_open(&self) {
        // Fatal: accounting calls after resources were released indicate a
        // caller bug, not an operational condition.
        assert!(
            !self.closed.load(Ordering::Acquire),
            "scratch file group for query {} used after close",
            self.query_id
        );
    }
}

impl Drop for TmpFileGroup {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn mgr_for(dirs: &[&Path], one_dir_per_device: bool) -> Arc<TmpFileMgr> {
        let config = RuntimeConfig {
            scratch_dirs: dirs
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
            one_dir_per_device,
            ..RuntimeConfig::default()
        };
        Arc::new(TmpFileMgr::new(&config, &MetricsRegistry::new()).unwrap())
    }

    #[test]
    fn allocations_are_contiguous_and_extend_the_file() {
        let dir = TempDir::new().unwrap();
        let mgr = mgr_for(&[dir.path()], false);
        assert_eq!(mgr.num_active_tmp_devices(), 1);

        let group = TmpFileGroup::new(&mgr, QueryId(1), -1);
        let file = group.new_file(0).unwrap();
        // Lazy creation: nothing on disk yet.
        assert!(!file.path().exists());

        let write_sizes: [i64; 7] = [1, 10, 1024, 4, 1024 * 1024, 16, 10];
        let mut next_offset = 0;
        for size in write_sizes {
            let (alloc_file, offset) = group.allocate_space(size).unwrap();
            assert!(Arc::ptr_eq(&alloc_file, &file));
            assert_eq!(offset, next_offset);
            next_offset = offset + size;
            assert_eq!(fs::metadata(file.path()).unwrap().len(), next_offset as u64);
        }
        assert_eq!(group.scratch_allocated(), next_offset);

        let path = file.path().to_path_buf();
        group.close();
        assert!(!path.exists());
        assert_eq!(group.scratch_allocated(), 0);
    }

    #[test]
    fn one_dir_per_device_deduplicates_directories() {
        let root = TempDir::new().unwrap();
        let dir_a = root.path().join("scratch-a");
        let dir_b = root.path().join("scratch-b");
        fs::create_dir_all(&dir_a).unwrap();
        fs::create_dir_all(&dir_b).unwrap();

        // Same filesystem: only the first directory is used.
        let deduped = mgr_for(&[&dir_a, &dir_b], true);
        assert_eq!(deduped.num_active_tmp_devices(), 1);
        assert!(deduped
            .tmp_dir_path(0)
            .unwrap()
            .starts_with(&dir_a));

        // Verbatim mode keeps both.
        let verbatim = mgr_for(&[&dir_a, &dir_b], false);
        assert_eq!(verbatim.num_active_tmp_devices(), 2);
        assert_eq!(verbatim.active_tmp_devices(), vec![0, 1]);
    }

    #[test]
    fn zero_usable_directories_is_a_config_error() {
        let config = RuntimeConfig {
            scratch_dirs: vec!["/proc/definitely-not-writable/scratch".to_string()],
            ..RuntimeConfig::default()
        };
        let err = TmpFileMgr::new(&config, &MetricsRegistry::new()).unwrap_err();
        assert!(matches!(err, QuarryError::InvalidConfig(_)));
    }

    #[test]
    fn io_error_report_is_observational_and_first_wins() {
        let root = TempDir::new().unwrap();
        let dir_a = root.path().join("a");
        let dir_b = root.path().join("b");
        fs::create_dir_all(&dir_a).unwrap();
        fs::create_dir_all(&dir_b).unwrap();
        let mgr = mgr_for(&[&dir_a, &dir_b], false);

        let group = TmpFileGroup::new(&mgr, QueryId(2), -1);
        let bad_file = group.new_file(1).unwrap();
        bad_file.report_io_error("a fake error");
        bad_file.report_io_error("a later error");
        assert_eq!(bad_file.io_error().as_deref(), Some("a fake error"));
        assert!(!bad_file.blacklisted());

        // Errors do not blacklist anything: the device stays active and the
        // same file still accepts allocations.
        assert_eq!(mgr.num_active_tmp_devices(), 2);
        let offset = bad_file.allocate_space(128).unwrap();
        assert_eq!(offset, 0);
        // New files on the reported device also stay allowed.
        group.new_file(1).unwrap();

        bad_file.clear_io_error();
        assert!(bad_file.io_error().is_none());
    }

    #[test]
    fn failed_extend_records_error_and_rolls_back_reservation() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("a");
        fs::create_dir_all(&dir).unwrap();
        let mgr = mgr_for(&[&dir], false);

        let group = TmpFileGroup::new(&mgr, QueryId(3), 100);
        let file = group.new_file(0).unwrap();
        // Remove the scratch subdirectory out from under the file.
        fs::remove_dir_all(mgr.tmp_dir_path(0).unwrap()).unwrap();

        let err = group.allocate_space(10).unwrap_err();
        assert!(matches!(err, QuarryError::Io(_)));
        assert!(file.io_error().is_some());
        // The reservation was rolled back: the full limit is still available.
        assert_eq!(group.scratch_allocated(), 0);
    }

    #[test]
    fn scratch_limit_is_enforced_before_touching_files() {
        let root = TempDir::new().unwrap();
        let dir_a = root.path().join("a");
        let dir_b = root.path().join("b");
        fs::create_dir_all(&dir_a).unwrap();
        fs::create_dir_all(&dir_b).unwrap();
        let mgr = mgr_for(&[&dir_a, &dir_b], false);

        const LIMIT: i64 = 100;
        const FILE1_ALLOC: i64 = 25;
        const FILE2_ALLOC: i64 = LIMIT - FILE1_ALLOC;
        let group = TmpFileGroup::new(&mgr, QueryId(4), LIMIT);
        let file1 = group.new_file(0).unwrap();
        let file2 = group.new_file(1).unwrap();

        // Oversized requests fail without any partial write.
        for _ in 0..2 {
            let err = group.allocate_space(LIMIT + 1).unwrap_err();
            assert!(err.is_scratch_limit_exceeded());
        }
        assert!(!file1.path().exists());
        assert!(!file2.path().exists());

        // Files are selected round-robin.
        let (f, offset) = group.allocate_space(FILE1_ALLOC).unwrap();
        assert!(Arc::ptr_eq(&f, &file1));
        assert_eq!(offset, 0);

        for _ in 0..2 {
            let err = group.allocate_space(FILE2_ALLOC + 1).unwrap_err();
            assert!(err.is_scratch_limit_exceeded());
        }

        let (f, offset) = group.allocate_space(FILE2_ALLOC).unwrap();
        assert!(Arc::ptr_eq(&f, &file2));
        assert_eq!(offset, 0);
        assert_eq!(group.scratch_allocated(), LIMIT);

        let err = group.allocate_space(1).unwrap_err();
        assert!(err.is_scratch_limit_exceeded());

        group.close();
        group.close(); // idempotent
    }

    #[test]
    fn blacklist_is_manual_and_visible_in_device_accounting() {
        let root = TempDir::new().unwrap();
        let dir_a = root.path().join("a");
        let dir_b = root.path().join("b");
        fs::create_dir_all(&dir_a).unwrap();
        fs::create_dir_all(&dir_b).unwrap();
        let mgr = mgr_for(&[&dir_a, &dir_b], false);

        mgr.blacklist_device(1);
        assert_eq!(mgr.num_active_tmp_devices(), 1);
        assert_eq!(mgr.total_tmp_devices(), 2);
        assert_eq!(mgr.active_tmp_devices(), vec![0]);

        let group = TmpFileGroup::new(&mgr, QueryId(5), -1);
        let err = group.new_file(1).unwrap_err();
        assert!(matches!(err, QuarryError::InvalidConfig(_)));

        // Lazy file creation only covers active devices.
        let (file, _) = group.allocate_space(64).unwrap();
        assert_eq!(file.device_id(), 0);
        assert!(!file.blacklisted());

        mgr.blacklist_device(0);
        assert!(file.blacklisted());
    }

    #[test]
    #[should_panic(expected = "used after close")]
    fn allocation_after_close_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mgr = mgr_for(&[dir.path()], false);
        let group = TmpFileGroup::new(&mgr, QueryId(6), -1);
        group.close();
        let _ = group.allocate_space(1);
    }
}
