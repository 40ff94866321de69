//! Query lifetime and per-query resource ownership.
//!
//! A [`QueryState`] is the root of one query's resource graph: it owns the
//! query's root [`MemTracker`], its [`TmpFileGroup`], and the map of
//! fragment-instance execution states. Its lifetime is dictated by a
//! reference count managed by [`QueryExecMgr`]: any thread that executes on
//! behalf of a query must hold a reference (usually via [`ScopedRef`]) for at
//! least the duration of that access, which guarantees resources are not torn
//! down underneath in-flight work.
//!
//! Teardown unwinds leaf-first: fragment-instance trackers are dropped, then
//! the scratch file group is closed, then the query tracker itself goes away
//! when the last strong owner releases the state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use quarry_common::{
    FragmentInstanceId, MetricsRegistry, QuarryError, QueryId, QueryOptions, Result,
    RuntimeConfig, DEFAULT_BATCH_SIZE_ROWS,
};
use tracing::{debug, info};

use crate::mem_tracker::{MemTracker, TrackerRegistry};
use crate::tmp_file_mgr::{TmpFileGroup, TmpFileMgr};

/// Execution state for one fragment instance of a query.
///
/// Holds the per-instance memory tracker under the query root; operator code
/// accounts its allocations against it.
#[derive(Debug)]
pub struct FragmentInstanceState {
    instance_id: FragmentInstanceId,
    mem_tracker: Arc<MemTracker>,
}

impl FragmentInstanceState {
    pub fn instance_id(&self) -> FragmentInstanceId {
        self.instance_id
    }

    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.mem_tracker
    }
}

enum PrepareState {
    NotPrepared,
    Prepared,
    /// Cached failure details, replayed to every later caller without
    /// re-running side effects.
    Failed(String),
}

/// Central state for all backend execution of one query.
#[derive(Debug)]
pub struct QueryState {
    query_id: QueryId,
    options: QueryOptions,
    /// Logical reference count; teardown runs when it reaches zero.
    refcnt: AtomicI32,
    process_mem_tracker: Arc<MemTracker>,
    query_mem_tracker: Arc<MemTracker>,
    file_group: TmpFileGroup,
    fis_map: Mutex<HashMap<FragmentInstanceId, Arc<FragmentInstanceState>>>,
    prepare_state: Mutex<PrepareState>,
    released_resources: AtomicBool,
}

impl std::fmt::Debug for PrepareState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrepareState::NotPrepared => write!(f, "NotPrepared"),
            PrepareState::Prepared => write!(f, "Prepared"),
            PrepareState::Failed(_) => write!(f, "Failed"),
        }
    }
}

impl QueryState {
    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    /// Query options after defaulting (batch size fixed up when unset).
    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    pub fn query_mem_tracker(&self) -> &Arc<MemTracker> {
        &self.query_mem_tracker
    }

    pub fn file_group(&self) -> &TmpFileGroup {
        &self.file_group
    }

    /// Admission-style preparation. Serialized: concurrent callers block and
    /// only the first actually runs the checks; a failure is cached and
    /// replayed to every subsequent caller.
    ///
    /// Starting a query creates threads and consumes a nontrivial amount of
    /// memory, so an already-starved process fails the query as early and as
    /// cheaply as possible.
    pub fn prepare(&self) -> Result<()> {
        self.check_not_released();
        let mut state = lock(&self.prepare_state);
        match &*state {
            PrepareState::Prepared => Ok(()),
            PrepareState::Failed(details) => Err(QuarryError::MemLimitExceeded {
                details: details.clone(),
            }),
            PrepareState::NotPrepared => {
                if self.process_mem_tracker.limit_exceeded() {
                    let err = self.process_mem_tracker.mem_limit_exceeded(
                        &format!(
                            "query {} could not start because the process is over its memory limit",
                            self.query_id
                        ),
                        0,
                    );
                    if let QuarryError::MemLimitExceeded { details } = &err {
                        *state = PrepareState::Failed(details.clone());
                    }
                    return Err(err);
                }
                *state = PrepareState::Prepared;
                Ok(())
            }
        }
    }

    pub fn is_prepared(&self) -> bool {
        matches!(&*lock(&self.prepare_state), PrepareState::Prepared)
    }

    /// Register a new fragment instance, creating its per-instance tracker
    /// under the query root. Registering the same instance id twice is a
    /// fatal caller bug.
    pub fn register_fragment_instance(
        &self,
        instance_id: FragmentInstanceId,
    ) -> Arc<FragmentInstanceState> {
        self.check_not_released();
        let fis = Arc::new(FragmentInstanceState {
            instance_id,
            mem_tracker: MemTracker::create_quiet(
                format!("Fragment {instance_id}"),
                -1,
                &self.query_mem_tracker,
            ),
        });
        let mut map = lock(&self.fis_map);
        assert!(
            !map.contains_key(&instance_id),
            "duplicate fragment instance registration: query {} instance {}",
            self.query_id,
            instance_id
        );
        debug!(query_id = %self.query_id, instance_id = %instance_id, "fragment instance registered");
        map.insert(instance_id, Arc::clone(&fis));
        fis
    }

    /// Look up a registered fragment instance; `None` for unknown ids.
    pub fn get_fragment_instance(
        &self,
        instance_id: FragmentInstanceId,
    ) -> Option<Arc<FragmentInstanceState>> {
        lock(&self.fis_map).get(&instance_id).cloned()
    }

    /// Tear down query-scoped resources. Called exactly once, by the manager,
    /// when the reference count reaches zero; a second call is fatal.
    fn release_resources(&self) {
        assert!(
            !self.released_resources.swap(true, Ordering::AcqRel),
            "release_resources called twice for query {}",
            self.query_id
        );
        // Leaf-first: fragment trackers go before the query tracker, scratch
        // files before the state itself.
        lock(&self.fis_map).clear();
        self.file_group.close();
        self.query_mem_tracker.publish_usage();
        info!(query_id = %self.query_id, "query resources released");
    }

    fn check_not_released(&self) {
        assert!(
            !self.released_resources.load(Ordering::Acquire),
            "query {} used after resources were released",
            self.query_id
        );
    }

    #[cfg(test)]
    fn refcnt(&self) -> i32 {
        self.refcnt.load(Ordering::SeqCst)
    }
}

impl Drop for QueryState {
    fn drop(&mut self) {
        if !self.released_resources.load(Ordering::Acquire) && !std::thread::panicking() {
            panic!(
                "QueryState for query {} destroyed without release_resources",
                self.query_id
            );
        }
    }
}

/// Process-wide owner of query states and the resources they share.
///
/// Explicitly constructed (never a hidden static): owns the process memory
/// tracker, the tracker interning registry, and the scratch device set, so
/// tests can build isolated instances.
pub struct QueryExecMgr {
    metrics: MetricsRegistry,
    default_query_mem_limit: i64,
    process_mem_tracker: Arc<MemTracker>,
    tracker_registry: Arc<TrackerRegistry>,
    tmp_file_mgr: Arc<TmpFileMgr>,
    queries: Mutex<HashMap<QueryId, Arc<QueryState>>>,
}

impl QueryExecMgr {
    pub fn new(config: &RuntimeConfig, metrics: &MetricsRegistry) -> Result<Arc<QueryExecMgr>> {
        let process_mem_tracker = MemTracker::root("Process", config.process_mem_limit_bytes);
        process_mem_tracker.register_metrics(metrics);
        let tmp_file_mgr = Arc::new(TmpFileMgr::new(config, metrics)?);
        Ok(Arc::new(QueryExecMgr {
            metrics: metrics.clone(),
            default_query_mem_limit: config.default_query_mem_limit_bytes,
            process_mem_tracker,
            tracker_registry: TrackerRegistry::new(),
            tmp_file_mgr,
            queries: Mutex::new(HashMap::new()),
        }))
    }

    pub fn process_mem_tracker(&self) -> &Arc<MemTracker> {
        &self.process_mem_tracker
    }

    pub fn tracker_registry(&self) -> &Arc<TrackerRegistry> {
        &self.tracker_registry
    }

    pub fn tmp_file_mgr(&self) -> &Arc<TmpFileMgr> {
        &self.tmp_file_mgr
    }

    /// Return the query state for `query_id` with a reference acquired,
    /// constructing it on first use. Concurrent callers for the same id
    /// observe a single winner; losers receive the winner's instance.
    pub fn get_or_create_query_state(
        &self,
        query_id: QueryId,
        options: &QueryOptions,
    ) -> Arc<QueryState> {
        let mut queries = lock(&self.queries);
        if let Some(qs) = queries.get(&query_id) {
            qs.refcnt.fetch_add(1, Ordering::SeqCst);
            return Arc::clone(qs);
        }

        let mut options = options.clone();
        if options.batch_size_rows <= 0 {
            options.batch_size_rows = DEFAULT_BATCH_SIZE_ROWS;
        }
        let mem_limit = if options.mem_limit_bytes > 0 {
            options.mem_limit_bytes
        } else {
            self.default_query_mem_limit
        };

        let pool_tracker = self
            .tracker_registry
            .request_pool_tracker(&options.pool, &self.process_mem_tracker);
        let query_mem_tracker = self
            .tracker_registry
            .query_tracker(query_id, mem_limit, &pool_tracker);
        query_mem_tracker.register_metrics(&self.metrics);
        let file_group =
            TmpFileGroup::new(&self.tmp_file_mgr, query_id, options.scratch_limit_bytes);

        let qs = Arc::new(QueryState {
            query_id,
            options,
            refcnt: AtomicI32::new(1),
            process_mem_tracker: Arc::clone(&self.process_mem_tracker),
            query_mem_tracker,
            file_group,
            fis_map: Mutex::new(HashMap::new()),
            prepare_state: Mutex::new(PrepareState::NotPrepared),
            released_resources: AtomicBool::new(false),
        });
        info!(query_id = %query_id, "query state created");
        queries.insert(query_id, Arc::clone(&qs));
        qs
    }

    /// Acquire a reference to an existing query state, or `None` when the
    /// query is unknown (never created, or already fully released).
    pub fn get_query_state(&self, query_id: QueryId) -> Option<Arc<QueryState>> {
        let queries = lock(&self.queries);
        queries.get(&query_id).map(|qs| {
            qs.refcnt.fetch_add(1, Ordering::SeqCst);
            Arc::clone(qs)
        })
    }

    /// Drop one reference. At zero the state is removed from the registry and
    /// its resources are released; this runs under the same lock as
    /// `get_or_create_query_state`, so a concurrent create for the same id
    /// cannot observe a half-torn-down entry.
    pub fn release_query_state(&self, qs: Arc<QueryState>) {
        let query_id = qs.query_id;
        let mut queries = lock(&self.queries);
        let prev = qs.refcnt.fetch_sub(1, Ordering::SeqCst);
        assert!(
            prev > 0,
            "release without matching reference for query {query_id}"
        );
        if prev == 1 {
            let removed = queries.remove(&query_id);
            debug_assert!(removed.is_some());
            qs.release_resources();
        }
    }

    /// Number of live query states (diagnostics/tests).
    pub fn num_live_queries(&self) -> usize {
        lock(&self.queries).len()
    }
}

/// Scoped strong reference to a query state.
///
/// Obtains a reference for the duration of a function or block and releases
/// it on every exit path:
///
/// ```ignore
/// let qs = ScopedRef::new(&mgr, query_id);
/// let Some(qs) = qs.get() else { return };
/// // ... use qs; the reference is dropped when `qs` leaves scope
/// ```
pub struct ScopedRef<'a> {
    mgr: &'a QueryExecMgr,
    query_state: Option<Arc<QueryState>>,
}

impl<'a> ScopedRef<'a> {
    pub fn new(mgr: &'a QueryExecMgr, query_id: QueryId) -> ScopedRef<'a> {
        ScopedRef {
            mgr,
            query_state: mgr.get_query_state(query_id),
        }
    }

    /// May return `None` when the query id is not (or no longer) live.
    pub fn get(&self) -> Option<&Arc<QueryState>> {
        self.query_state.as_ref()
    }
}

impl Drop for ScopedRef<'_> {
    fn drop(&mut self) {
        if let Some(qs) = self.query_state.take() {
            self.mgr.release_query_state(qs);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
