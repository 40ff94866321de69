//! Hierarchical memory accounting.
//!
//! A [`MemTracker`] is one node in a process-wide tree of accounting units.
//! Consuming or releasing bytes on a tracker updates it and every ancestor, so
//! a child's consumption is always reflected at the query, pool, and process
//! levels. Accounting and enforcement are deliberately separate:
//! [`MemTracker::consume`]/[`MemTracker::release`] are unconditional and never
//! fail, while [`MemTracker::any_limit_exceeded`] is the explicit pre-check
//! callers run for allocations that should be limited, falling back to
//! [`MemTracker::gc_memory`] when it trips.
//!
//! Trackers for resource pools and queries are interned in a
//! [`TrackerRegistry`] so that repeated lookups by the same pool name or query
//! id share one aggregation root. The registry stores weak references and
//! entries erase themselves when the last strong owner goes away.

use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use quarry_common::{MetricsRegistry, QuarryError, QueryId};
use tracing::warn;

use crate::mem_info::physical_mem;

/// Reclamation callback registered via [`MemTracker::add_gc_function`].
pub type GcFunction = Box<dyn Fn() + Send + Sync>;

/// External consumption source for a root tracker, e.g. an allocator gauge.
pub type ConsumptionSource = Box<dyn Fn() -> i64 + Send + Sync>;

enum RegistryKey {
    Pool(String),
    Query(QueryId),
}

struct Registration {
    registry: Weak<TrackerRegistry>,
    key: RegistryKey,
}

/// One node in the memory accounting tree.
///
/// Thread-safe. `consume`/`release` are lock-free atomic walks up the
/// ancestor chain; child-list mutation and GC passes take short per-tracker
/// locks. Reparenting is never supported, so the chain of ancestors carrying
/// limits is computed once at construction.
pub struct MemTracker {
    label: String,
    /// Byte limit; `-1` means unlimited.
    limit: i64,
    pool_name: Option<String>,
    /// Include this tracker in usage dumps even when consumption is zero.
    log_usage_if_zero: bool,
    parent: Option<Arc<MemTracker>>,
    /// Ancestors with a finite limit, nearest-first. Excludes `self`; the own
    /// limit is checked directly.
    limit_ancestors: Vec<Arc<MemTracker>>,
    consumption: AtomicI64,
    peak: AtomicI64,
    consumption_source: Option<ConsumptionSource>,
    children: Mutex<Vec<Weak<MemTracker>>>,
    gc_functions: Mutex<Vec<GcFunction>>,
    /// Serializes GC passes; never held while touching another tracker's GC.
    gc_lock: Mutex<()>,
    metrics: Mutex<Option<MetricsRegistry>>,
    registration: Mutex<Option<Registration>>,
}

impl fmt::Debug for MemTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemTracker")
            .field("label", &self.label)
            .field("limit", &self.limit)
            .field("consumption", &self.consumption())
            .field("peak", &self.peak())
            .finish_non_exhaustive()
    }
}

impl MemTracker {
    /// Create a root tracker with no parent.
    pub fn root(label: impl Into<String>, limit: i64) -> Arc<MemTracker> {
        Self::build(label.into(), limit, None, None, None, true)
    }

    /// Create a root tracker whose consumption is driven by an external
    /// source (e.g. allocator-reported totals), polled before GC decisions.
    pub fn root_with_source(
        label: impl Into<String>,
        limit: i64,
        source: ConsumptionSource,
    ) -> Arc<MemTracker> {
        Self::build(label.into(), limit, None, None, Some(source), true)
    }

    /// Create a tracker under `parent`, registered in its child list.
    pub fn create(
        label: impl Into<String>,
        limit: i64,
        parent: &Arc<MemTracker>,
    ) -> Arc<MemTracker> {
        Self::build(label.into(), limit, Some(Arc::clone(parent)), None, None, true)
    }

    /// Like [`MemTracker::create`], but omitted from usage dumps while its
    /// consumption is zero. Used for per-fragment and per-operator trackers
    /// that would otherwise flood diagnostics.
    pub fn create_quiet(
        label: impl Into<String>,
        limit: i64,
        parent: &Arc<MemTracker>,
    ) -> Arc<MemTracker> {
        Self::build(label.into(), limit, Some(Arc::clone(parent)), None, None, false)
    }

    fn build(
        label: String,
        limit: i64,
        parent: Option<Arc<MemTracker>>,
        pool_name: Option<String>,
        consumption_source: Option<ConsumptionSource>,
        log_usage_if_zero: bool,
    ) -> Arc<MemTracker> {
        debug_assert!(limit >= -1, "invalid limit {limit} for tracker '{label}'");
        debug_assert!(
            consumption_source.is_none() || parent.is_none(),
            "consumption source is only valid on a root tracker"
        );

        let mut limit_ancestors = Vec::new();
        let mut cur = parent.clone();
        while let Some(t) = cur {
            if t.has_limit() {
                limit_ancestors.push(Arc::clone(&t));
            }
            cur = t.parent.clone();
        }

        let tracker = Arc::new(MemTracker {
            label,
            limit,
            pool_name,
            log_usage_if_zero,
            parent,
            limit_ancestors,
            consumption: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            consumption_source,
            children: Mutex::new(Vec::new()),
            gc_functions: Mutex::new(Vec::new()),
            gc_lock: Mutex::new(()),
            metrics: Mutex::new(None),
            registration: Mutex::new(None),
        });
        if let Some(parent) = &tracker.parent {
            parent.add_child(&tracker);
        }
        tracker
    }

    fn add_child(&self, child: &Arc<MemTracker>) {
        let mut children = lock(&self.children);
        children.retain(|w| w.strong_count() > 0);
        children.push(Arc::downgrade(child));
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    pub fn has_limit(&self) -> bool {
        self.limit >= 0
    }

    pub fn consumption(&self) -> i64 {
        self.consumption.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }

    pub fn parent(&self) -> Option<&Arc<MemTracker>> {
        self.parent.as_ref()
    }

    /// Live children, in registration order.
    pub fn children(&self) -> Vec<Arc<MemTracker>> {
        lock(&self.children)
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Record `bytes` of consumption on this tracker and every ancestor.
    ///
    /// Unconditional: never blocks, never fails, applies even when a limit is
    /// already exceeded. Callers that want enforcement run
    /// [`MemTracker::any_limit_exceeded`] first.
    pub fn consume(&self, bytes: i64) {
        if bytes < 0 {
            self.release(-bytes);
            return;
        }
        if bytes == 0 {
            return;
        }
        let mut cur = Some(self);
        while let Some(t) = cur {
            let new_total = t.consumption.fetch_add(bytes, Ordering::Relaxed) + bytes;
            t.peak.fetch_max(new_total, Ordering::Relaxed);
            cur = t.parent.as_deref();
        }
    }

    /// Release `bytes` of consumption from this tracker and every ancestor.
    ///
    /// Releasing more than is currently consumed is a usage error: it is
    /// reported and consumption saturates at zero rather than going negative.
    pub fn release(&self, bytes: i64) {
        if bytes < 0 {
            self.consume(-bytes);
            return;
        }
        if bytes == 0 {
            return;
        }
        let mut cur = Some(self);
        while let Some(t) = cur {
            let prev = t
                .consumption
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                    Some((c - bytes).max(0))
                })
                .unwrap_or_else(|v| v);
            if prev < bytes {
                tracing::error!(
                    tracker = %t.label,
                    released = bytes,
                    consumed = prev,
                    "released more bytes than tracked"
                );
            }
            cur = t.parent.as_deref();
        }
    }

    /// Whether consuming `requested` additional bytes would push this tracker
    /// or any limited ancestor over its limit.
    ///
    /// This is the explicit enforcement half of the contract: callers check
    /// before `consume` for allocations that should be limited and call
    /// [`MemTracker::gc_memory`] when it returns true.
    pub fn any_limit_exceeded(&self, requested: i64) -> bool {
        if self.would_exceed(requested) {
            return true;
        }
        self.limit_ancestors.iter().any(|t| t.would_exceed(requested))
    }

    /// Whether some tracker on the limit chain is over its limit right now.
    pub fn limit_exceeded(&self) -> bool {
        self.any_limit_exceeded(0)
    }

    fn would_exceed(&self, requested: i64) -> bool {
        if !self.has_limit() {
            return false;
        }
        let over = self.consumption().saturating_add(requested) - self.limit;
        if over > 0 {
            if let Some(m) = lock(&self.metrics).as_ref() {
                m.set_bytes_over_limit(&self.label, over);
            }
            true
        } else {
            false
        }
    }

    /// Register a reclamation callback, invoked by GC passes in registration
    /// order. Callbacks must not register further callbacks or call back into
    /// this tracker's GC.
    pub fn add_gc_function(&self, f: impl Fn() + Send + Sync + 'static) {
        lock(&self.gc_functions).push(Box::new(f));
    }

    /// Run reclamation callbacks until consumption drops to `target_bytes` or
    /// the callback list is exhausted. Returns whether the target was reached.
    ///
    /// Concurrent passes on the same tracker serialize; a racing caller that
    /// finds consumption already at or below the target returns without
    /// re-running the callbacks.
    pub fn gc_memory(&self, target_bytes: i64) -> bool {
        if target_bytes < 0 {
            return true;
        }
        let _pass = lock(&self.gc_lock);
        self.refresh_consumption_from_source();
        let pre = self.consumption();
        // Someone gc'd while we waited for the lock.
        if pre <= target_bytes {
            return true;
        }

        let gc_functions = lock(&self.gc_functions);
        for f in gc_functions.iter() {
            f();
            self.refresh_consumption_from_source();
            if self.consumption() <= target_bytes {
                break;
            }
        }

        let post = self.consumption();
        if let Some(m) = lock(&self.metrics).as_ref() {
            m.record_gc(&self.label, pre - post);
        }
        post <= target_bytes
    }

    /// Re-read consumption from the external source, if one is attached.
    pub fn refresh_consumption_from_source(&self) {
        if let Some(source) = &self.consumption_source {
            let v = source();
            self.consumption.store(v, Ordering::Relaxed);
            self.peak.fetch_max(v, Ordering::Relaxed);
        }
    }

    /// Build the recoverable memory-limit failure for a rejected allocation,
    /// carrying a usage dump of the whole tracker hierarchy for diagnostics.
    pub fn mem_limit_exceeded(&self, details: &str, failed_allocation_bytes: i64) -> QuarryError {
        let mut dump = String::new();
        let _ = writeln!(dump, "{details}");
        if failed_allocation_bytes > 0 {
            let _ = writeln!(
                dump,
                "failed allocation of {} on tracker '{}'",
                fmt_bytes(failed_allocation_bytes),
                self.label
            );
        }
        let mut top: &MemTracker = self;
        while let Some(parent) = top.parent.as_deref() {
            top = parent;
        }
        dump.push_str(&top.log_usage(""));
        QuarryError::MemLimitExceeded { details: dump }
    }

    /// Recursive usage dump: label, limit, current, and peak for this tracker
    /// and every child, indented two spaces per level. Children with zero
    /// consumption are skipped unless flagged to always log. Diagnostic only,
    /// never used for control flow.
    pub fn log_usage(&self, prefix: &str) -> String {
        if !self.log_usage_if_zero && self.consumption() == 0 {
            return String::new();
        }
        let mut out = format!("{}{}:", prefix, self.label);
        if self.has_limit() && self.consumption() > self.limit {
            out.push_str(" memory limit exceeded.");
        }
        if self.limit > 0 {
            let _ = write!(out, " Limit={}", fmt_bytes(self.limit));
        }
        let _ = write!(
            out,
            " Total={} Peak={}",
            fmt_bytes(self.consumption()),
            fmt_bytes(self.peak())
        );

        let child_prefix = format!("{prefix}  ");
        let children = lock(&self.children);
        for weak in children.iter() {
            if let Some(child) = weak.upgrade() {
                let usage = child.log_usage(&child_prefix);
                if !usage.is_empty() {
                    out.push('\n');
                    out.push_str(&usage);
                }
            }
        }
        out
    }

    /// Attach a metrics registry; GC statistics and over-limit gauges for
    /// this tracker are published through it from now on.
    pub fn register_metrics(&self, metrics: &MetricsRegistry) {
        *lock(&self.metrics) = Some(metrics.clone());
        self.publish_usage();
    }

    /// Publish current/peak consumption to the attached metrics registry.
    pub fn publish_usage(&self) {
        if let Some(m) = lock(&self.metrics).as_ref() {
            m.set_tracker_usage(&self.label, self.consumption(), self.peak());
        }
    }

    /// Sum of child reservations for a pool tracker: a limited child reserves
    /// `min(limit, physical memory)`, an unlimited child its consumption.
    pub fn pool_mem_reserved(&self) -> i64 {
        debug_assert!(
            self.pool_name.is_some(),
            "pool_mem_reserved on non-pool tracker '{}'",
            self.label
        );
        debug_assert_eq!(self.limit, -1, "pool trackers are unlimited");

        let mut reserved = 0i64;
        let children = lock(&self.children);
        for weak in children.iter() {
            if let Some(child) = weak.upgrade() {
                if child.limit > 0 {
                    reserved = reserved.saturating_add(child.limit.min(physical_mem()));
                } else {
                    reserved = reserved.saturating_add(child.consumption());
                }
            }
        }
        reserved
    }

    fn set_registration(&self, registry: &Arc<TrackerRegistry>, key: RegistryKey) {
        *lock(&self.registration) = Some(Registration {
            registry: Arc::downgrade(registry),
            key,
        });
    }
}

impl Drop for MemTracker {
    fn drop(&mut self) {
        let outstanding = self.consumption();
        if outstanding != 0 && !std::thread::panicking() {
            tracing::error!(
                tracker = %self.label,
                bytes = outstanding,
                "tracker dropped with outstanding consumption"
            );
            debug_assert_eq!(
                outstanding, 0,
                "tracker '{}' dropped with {} outstanding bytes",
                self.label, outstanding
            );
        }
        let registration = lock(&self.registration).take();
        if let Some(registration) = registration {
            if let Some(registry) = registration.registry.upgrade() {
                registry.remove(&registration.key);
            }
        }
    }
}

/// Process-wide interning registry for pool and query trackers.
///
/// Explicitly constructed and injected (never a hidden static) so tests can
/// build a fresh instance. Entries hold weak references: the registry never
/// keeps a tracker alive, and an entry disappears exactly when the last
/// strong owner releases the tracker.
#[derive(Default)]
pub struct TrackerRegistry {
    maps: Mutex<RegistryMaps>,
}

#[derive(Default)]
struct RegistryMaps {
    pools: HashMap<String, Weak<MemTracker>>,
    queries: HashMap<QueryId, Weak<MemTracker>>,
}

impl TrackerRegistry {
    pub fn new() -> Arc<TrackerRegistry> {
        Arc::new(TrackerRegistry::default())
    }

    /// Return the interned tracker for `pool`, creating an unlimited
    /// aggregation tracker labelled `RequestPool=<pool>` on first use.
    pub fn request_pool_tracker(
        self: &Arc<Self>,
        pool: &str,
        parent: &Arc<MemTracker>,
    ) -> Arc<MemTracker> {
        debug_assert!(!pool.is_empty());
        let mut maps = lock(&self.maps);
        if let Some(existing) = maps.pools.get(pool).and_then(Weak::upgrade) {
            debug_assert_eq!(existing.pool_name.as_deref(), Some(pool));
            return existing;
        }
        let tracker = MemTracker::build(
            format!("RequestPool={pool}"),
            -1,
            Some(Arc::clone(parent)),
            Some(pool.to_string()),
            None,
            true,
        );
        tracker.set_registration(self, RegistryKey::Pool(pool.to_string()));
        maps.pools.insert(pool.to_string(), Arc::downgrade(&tracker));
        tracker
    }

    /// Return the interned tracker for `query_id`, creating one labelled
    /// `Query(<id>)` with the given limit on first use. A limit above
    /// detected physical memory is kept but warned about.
    pub fn query_tracker(
        self: &Arc<Self>,
        query_id: QueryId,
        limit: i64,
        parent: &Arc<MemTracker>,
    ) -> Arc<MemTracker> {
        if limit > 0 && limit > physical_mem() {
            warn!(
                query_id = %query_id,
                limit_bytes = limit,
                physical_bytes = physical_mem(),
                "query memory limit exceeds physical memory"
            );
        }
        let mut maps = lock(&self.maps);
        if let Some(existing) = maps.queries.get(&query_id).and_then(Weak::upgrade) {
            debug_assert_eq!(existing.limit, limit);
            return existing;
        }
        let tracker = MemTracker::create(format!("Query({query_id})"), limit, parent);
        tracker.set_registration(self, RegistryKey::Query(query_id));
        maps.queries.insert(query_id, Arc::downgrade(&tracker));
        tracker
    }

    /// Live query-tracker count; prunes dead entries as a side effect.
    pub fn num_query_trackers(&self) -> usize {
        let mut maps = lock(&self.maps);
        maps.queries.retain(|_, w| w.strong_count() > 0);
        maps.queries.len()
    }

    /// Live pool-tracker count; prunes dead entries as a side effect.
    pub fn num_pool_trackers(&self) -> usize {
        let mut maps = lock(&self.maps);
        maps.pools.retain(|_, w| w.strong_count() > 0);
        maps.pools.len()
    }

    /// Erase a key on tracker drop. Only removes the entry if its weak
    /// reference is dead, so a re-created tracker racing the drop of the old
    /// one is not evicted.
    fn remove(&self, key: &RegistryKey) {
        let mut maps = lock(&self.maps);
        match key {
            RegistryKey::Pool(name) => {
                if maps.pools.get(name).is_some_and(|w| w.strong_count() == 0) {
                    maps.pools.remove(name);
                }
            }
            RegistryKey::Query(id) => {
                if maps.queries.get(id).is_some_and(|w| w.strong_count() == 0) {
                    maps.queries.remove(id);
                }
            }
        }
    }
}

/// Poison-tolerant lock: accounting must stay consistent even if an unrelated
/// panic poisoned the mutex.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn fmt_bytes(v: i64) -> String {
    const KB: i64 = 1024;
    const MB: i64 = 1024 * KB;
    const GB: i64 = 1024 * MB;
    if v >= GB {
        format!("{:.2} GB", v as f64 / GB as f64)
    } else if v >= MB {
        format!("{:.2} MB", v as f64 / MB as f64)
    } else if v >= KB {
        format!("{:.2} KB", v as f64 / KB as f64)
    } else {
        format!("{v} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;

    #[test]
    fn consume_propagates_to_all_ancestors() {
        let process = MemTracker::root("Process", -1);
        let query = MemTracker::create("Query", -1, &process);
        let fragment = MemTracker::create("Fragment", -1, &query);

        fragment.consume(100);
        query.consume(30);
        assert_eq!(fragment.consumption(), 100);
        assert_eq!(query.consumption(), 130);
        assert_eq!(process.consumption(), 130);

        fragment.release(100);
        query.release(30);
        assert_eq!(fragment.consumption(), 0);
        assert_eq!(query.consumption(), 0);
        assert_eq!(process.consumption(), 0);
    }

    #[test]
    fn peak_is_monotonic_and_at_least_current() {
        let t = MemTracker::root("t", -1);
        t.consume(100);
        assert_eq!(t.peak(), 100);
        t.release(60);
        assert_eq!(t.peak(), 100);
        assert!(t.peak() >= t.consumption());
        t.consume(200);
        assert_eq!(t.peak(), 240);
        t.release(t.consumption());
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn over_release_saturates_at_zero() {
        let t = MemTracker::root("t", -1);
        t.consume(10);
        t.release(50);
        assert_eq!(t.consumption(), 0);
    }

    #[test]
    fn release_of_current_consumption_reaches_exactly_zero() {
        let t = MemTracker::root("t", -1);
        t.consume(75);
        t.release(25);
        t.release(t.consumption());
        assert_eq!(t.consumption(), 0);
    }

    #[test]
    fn limit_check_walks_the_effective_limit_chain() {
        // Process(unlimited) -> Query(limit 100) -> Fragment(unlimited).
        let process = MemTracker::root("Process", -1);
        let query = MemTracker::create("Query", 100, &process);
        let fragment = MemTracker::create("Fragment", -1, &query);

        fragment.consume(60);
        assert!(!fragment.any_limit_exceeded(30));
        assert!(fragment.any_limit_exceeded(50));

        // consume() is mechanical accounting: it still applies past the limit.
        fragment.consume(50);
        assert_eq!(query.consumption(), 110);
        assert!(fragment.limit_exceeded());
        assert!(query.limit_exceeded());
        assert!(!process.would_exceed(0));

        fragment.release(110);
    }

    #[test]
    fn gc_runs_callbacks_in_order_until_target_reached() {
        let t = MemTracker::root("t", 100);
        t.consume(90);

        let calls = Arc::new(AtomicI64::new(0));
        {
            // Weak capture: the callback must not keep its own tracker alive.
            let weak = Arc::downgrade(&t);
            let calls = Arc::clone(&calls);
            t.add_gc_function(move || {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(t) = weak.upgrade() {
                    t.release(30);
                }
            });
        }
        {
            let calls = Arc::clone(&calls);
            t.add_gc_function(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }

        // First callback already reaches the target; the second must not run.
        assert!(t.gc_memory(60));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(t.consumption(), 60);

        // Already at or below target: no callbacks run.
        assert!(t.gc_memory(60));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Unreachable target: every callback runs, target not met.
        assert!(!t.gc_memory(10));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(t.consumption(), 30);
        t.release(t.consumption());
    }

    #[test]
    fn gc_never_increases_consumption() {
        let t = MemTracker::root("t", -1);
        t.consume(10);
        let before = t.consumption();
        assert!(!t.gc_memory(5));
        assert!(t.consumption() <= before);
        t.release(t.consumption());
    }

    #[test]
    fn root_consumption_source_is_polled_by_gc() {
        let gauge = Arc::new(AtomicI64::new(400));
        let source_gauge = Arc::clone(&gauge);
        let t = MemTracker::root_with_source(
            "Process",
            1000,
            Box::new(move || source_gauge.load(Ordering::SeqCst)),
        );

        t.refresh_consumption_from_source();
        assert_eq!(t.consumption(), 400);

        // The external gauge dropping is observed by the GC pass.
        gauge.store(100, Ordering::SeqCst);
        assert!(t.gc_memory(200));
        assert_eq!(t.consumption(), 100);
        gauge.store(0, Ordering::SeqCst);
        t.refresh_consumption_from_source();
    }

    #[test]
    fn log_usage_skips_quiet_zero_children() {
        let process = MemTracker::root("Process", -1);
        let query = MemTracker::create("Query(1)", 1024, &process);
        let busy = MemTracker::create_quiet("Fragment 1", -1, &query);
        let _idle = MemTracker::create_quiet("Fragment 2", -1, &query);

        busy.consume(512);
        let dump = process.log_usage("");
        assert!(dump.contains("Process"));
        assert!(dump.contains("Query(1): Limit=1.00 KB"));
        assert!(dump.contains("  Fragment 1"));
        assert!(!dump.contains("Fragment 2"));
        busy.release(512);
    }

    #[test]
    fn mem_limit_exceeded_carries_hierarchy_dump() {
        let process = MemTracker::root("Process", -1);
        let query = MemTracker::create("Query(9)", 100, &process);
        query.consume(90);

        let err = query.mem_limit_exceeded("query 9 exceeded its memory limit", 64);
        assert!(err.is_mem_limit_exceeded());
        let text = err.to_string();
        assert!(text.contains("Process"));
        assert!(text.contains("Query(9)"));
        assert!(text.contains("failed allocation of 64 B"));
        query.release(90);
    }

    #[test]
    fn registry_interns_pool_and_query_trackers() {
        let registry = TrackerRegistry::new();
        let process = MemTracker::root("Process", -1);

        let pool_a = registry.request_pool_tracker("etl", &process);
        let pool_b = registry.request_pool_tracker("etl", &process);
        assert!(Arc::ptr_eq(&pool_a, &pool_b));
        assert_eq!(pool_a.label(), "RequestPool=etl");

        let q1 = registry.query_tracker(QueryId(7), 2048, &pool_a);
        let q2 = registry.query_tracker(QueryId(7), 2048, &pool_a);
        assert!(Arc::ptr_eq(&q1, &q2));
        assert_eq!(registry.num_query_trackers(), 1);

        drop(q1);
        drop(q2);
        assert_eq!(registry.num_query_trackers(), 0);

        // A fresh tracker under the same id is a distinct instance.
        let q3 = registry.query_tracker(QueryId(7), 2048, &pool_a);
        assert_eq!(registry.num_query_trackers(), 1);
        drop(q3);
        assert_eq!(registry.num_query_trackers(), 0);
    }

    #[test]
    fn pool_mem_reserved_sums_child_limits_and_consumption() {
        let registry = TrackerRegistry::new();
        let process = MemTracker::root("Process", -1);
        let pool = registry.request_pool_tracker("adhoc", &process);

        let limited = registry.query_tracker(QueryId(1), 500, &pool);
        let unlimited = registry.query_tracker(QueryId(2), -1, &pool);
        unlimited.consume(300);

        assert_eq!(pool.pool_mem_reserved(), 800);
        unlimited.release(300);
        drop(limited);
        drop(unlimited);
    }

    #[test]
    fn concurrent_consume_release_settles_to_zero() {
        let process = MemTracker::root("Process", -1);
        let query = MemTracker::create("Query", -1, &process);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let q = Arc::clone(&query);
            handles.push(std::thread::spawn(move || {
                for i in 1..=1000i64 {
                    q.consume(i % 97 + 1);
                    q.release(i % 97 + 1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(query.consumption(), 0);
        assert_eq!(process.consumption(), 0);
        assert!(query.peak() >= query.consumption());
    }

    #[test]
    fn fmt_bytes_scales_units() {
        assert_eq!(fmt_bytes(512), "512 B");
        assert_eq!(fmt_bytes(2048), "2.00 KB");
        assert_eq!(fmt_bytes(3 * 1024 * 1024), "3.00 MB");
    }
}
