use std::sync::{Arc, OnceLock};

use prometheus::{CounterVec, Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};

/// Resource-runtime metrics surface.
///
/// Cheap to clone; all clones share one underlying prometheus registry.
#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    mem_consumption_bytes: GaugeVec,
    mem_peak_bytes: GaugeVec,
    mem_num_gcs: CounterVec,
    mem_bytes_freed_by_last_gc: GaugeVec,
    mem_bytes_over_limit: GaugeVec,
    scratch_active_dirs: Gauge,
    scratch_bytes_allocated: GaugeVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// Publish a tracker's current and peak consumption.
    pub fn set_tracker_usage(&self, tracker: &str, current_bytes: i64, peak_bytes: i64) {
        self.inner
            .mem_consumption_bytes
            .with_label_values(&[tracker])
            .set(current_bytes as f64);
        self.inner
            .mem_peak_bytes
            .with_label_values(&[tracker])
            .set(peak_bytes as f64);
    }

    /// Record one completed GC pass and the bytes it freed.
    pub fn record_gc(&self, tracker: &str, bytes_freed: i64) {
        self.inner.mem_num_gcs.with_label_values(&[tracker]).inc();
        self.inner
            .mem_bytes_freed_by_last_gc
            .with_label_values(&[tracker])
            .set(bytes_freed as f64);
    }

    /// Publish how far a tracker sits over its limit (`-1` when under).
    pub fn set_bytes_over_limit(&self, tracker: &str, bytes: i64) {
        self.inner
            .mem_bytes_over_limit
            .with_label_values(&[tracker])
            .set(bytes as f64);
    }

    /// Publish the number of usable scratch devices.
    pub fn set_active_scratch_dirs(&self, count: usize) {
        self.inner.scratch_active_dirs.set(count as f64);
    }

    /// Adjust a query's aggregate allocated scratch bytes by `delta`.
    pub fn add_scratch_allocated(&self, query_id: &str, delta: i64) {
        self.inner
            .scratch_bytes_allocated
            .with_label_values(&[query_id])
            .add(delta as f64);
    }

    /// Reset a query's allocated scratch bytes (file group closed).
    pub fn reset_scratch_allocated(&self, query_id: &str) {
        self.inner
            .scratch_bytes_allocated
            .with_label_values(&[query_id])
            .set(0.0);
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let mem_consumption_bytes = gauge_vec(
            &registry,
            "quarry_mem_tracker_consumption_bytes",
            "Current tracked memory consumption per tracker",
            &["tracker"],
        );
        let mem_peak_bytes = gauge_vec(
            &registry,
            "quarry_mem_tracker_peak_bytes",
            "Peak tracked memory consumption per tracker",
            &["tracker"],
        );
        let mem_num_gcs = counter_vec(
            &registry,
            "quarry_mem_tracker_num_gcs_total",
            "Number of GC passes run per tracker",
            &["tracker"],
        );
        let mem_bytes_freed_by_last_gc = gauge_vec(
            &registry,
            "quarry_mem_tracker_bytes_freed_by_last_gc",
            "Bytes freed by the most recent GC pass per tracker",
            &["tracker"],
        );
        let mem_bytes_over_limit = gauge_vec(
            &registry,
            "quarry_mem_tracker_bytes_over_limit",
            "Bytes over the configured limit at last failed check per tracker",
            &["tracker"],
        );

        let scratch_active_dirs = gauge(
            &registry,
            "quarry_tmp_file_mgr_active_scratch_dirs",
            "Number of usable scratch devices",
        );
        let scratch_bytes_allocated = gauge_vec(
            &registry,
            "quarry_tmp_file_mgr_scratch_bytes_allocated",
            "Aggregate scratch bytes allocated per query",
            &["query_id"],
        );

        Self {
            registry,
            mem_consumption_bytes,
            mem_peak_bytes,
            mem_num_gcs,
            mem_bytes_freed_by_last_gc,
            mem_bytes_over_limit,
            scratch_active_dirs,
            scratch_bytes_allocated,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Gauge {
    let g = Gauge::with_opts(Opts::new(name, help)).expect("gauge");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

/// Process-wide default registry for callers that do not inject their own.
pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}
