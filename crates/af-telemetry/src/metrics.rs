use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ahash::AHashMap;

/// Metric names shared by the crates that report into a collector.
pub mod names {
    /// Task attempts started; label `provider`.
    pub const TASK_ATTEMPTS: &str = "af_task_attempts_total";
    /// Terminal task outcomes; labels `provider`, `outcome` (done|failed).
    pub const TASK_OUTCOMES: &str = "af_task_outcomes_total";
    /// Retries scheduled after a failed attempt; label `error_kind`.
    pub const TASK_RETRIES: &str = "af_task_retries_total";
    /// Task execution wall time in seconds.
    pub const TASK_DURATION: &str = "af_task_duration_seconds";
    /// Action plan steps; labels `kind`, `status`.
    pub const PLAN_STEPS: &str = "af_plan_steps_total";
    /// Executed plans; label `status`.
    pub const PLANS_EXECUTED: &str = "af_plans_executed_total";
    /// Validation decisions; labels `strategy`, `outcome` (pass|fail).
    pub const VALIDATIONS: &str = "af_validations_total";
    /// Samples flagged for review; label `strategy`.
    pub const VALIDATIONS_UNCERTAIN: &str = "af_validations_uncertain_total";
    /// Final validator scores in [0, 1].
    pub const VALIDATION_SCORE: &str = "af_validation_score";
    /// Critique loop runs; label `outcome` (final|exhausted|cancelled).
    pub const CRITIQUE_RUNS: &str = "af_critique_runs_total";
    /// Pending review samples.
    pub const REVIEW_QUEUE_DEPTH: &str = "af_review_queue_depth";
}

// ---------------------------------------------------------------------------
// Buckets
// ---------------------------------------------------------------------------

/// Upper bounds for wall-time histograms, in seconds.
pub fn duration_buckets() -> Vec<f64> {
    vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]
}

/// Upper bounds for scores in [0, 1].
pub fn score_buckets() -> Vec<f64> {
    (1..=10).map(|i| f64::from(i) / 10.0).collect()
}

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

/// Fixed-bucket histogram. Bucket counts are stored non-cumulatively and
/// accumulated on export.
#[derive(Debug)]
pub struct Histogram {
    bounds: Vec<f64>,
    hits: Vec<AtomicU64>,
    sum_bits: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(mut bounds: Vec<f64>) -> Self {
        bounds.retain(|b| b.is_finite());
        bounds.sort_by(f64::total_cmp);
        bounds.dedup();
        let hits = bounds.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            hits,
            sum_bits: AtomicU64::new(0f64.to_bits()),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        // f64 add as a CAS loop over the bit pattern.
        let _ = self
            .sum_bits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + value).to_bits())
            });
        if let Some(slot) = self.bounds.iter().position(|bound| value <= *bound) {
            self.hits[slot].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn sum(&self) -> f64 {
        f64::from_bits(self.sum_bits.load(Ordering::Relaxed))
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// `(upper bound, cumulative count)` pairs, excluding `+Inf`.
    pub fn cumulative(&self) -> Vec<(f64, u64)> {
        let mut running = 0;
        self.bounds
            .iter()
            .zip(&self.hits)
            .map(|(bound, hits)| {
                running += hits.load(Ordering::Relaxed);
                (*bound, running)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// Sorted `key=value` pairs identifying one series of a metric family.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut pairs: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        pairs.sort();
        Self(pairs)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `{k="v",...}` with values escaped, or an empty string.
    pub fn prometheus_str(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let body = self
            .0
            .iter()
            .map(|(k, v)| format!("{k}=\"{}\"", escape_label_value(v)))
            .collect::<Vec<_>>()
            .join(",");
        format!("{{{body}}}")
    }

    fn with_le(&self, le: &str) -> Labels {
        let mut pairs = self.0.clone();
        pairs.push(("le".to_string(), le.to_string()));
        pairs.sort();
        Labels(pairs)
    }
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

type SeriesKey = (String, Labels);

/// Thread-safe registry of counters, gauges, and histograms.
///
/// Series are created on first use. Values are atomics behind a `RwLock`
/// that is only taken for writing when a new series appears.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: RwLock<AHashMap<SeriesKey, AtomicU64>>,
    gauges: RwLock<AHashMap<SeriesKey, AtomicI64>>,
    histograms: RwLock<AHashMap<SeriesKey, Histogram>>,
    bucket_overrides: RwLock<AHashMap<String, Vec<f64>>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A collector with score buckets registered for the validator histogram.
    pub fn with_defaults() -> Self {
        let collector = Self::new();
        collector.register_buckets(names::VALIDATION_SCORE, score_buckets());
        collector.register_buckets(names::TASK_DURATION, duration_buckets());
        collector
    }

    /// Use `bounds` for every future series of histogram `name`.
    pub fn register_buckets(&self, name: &str, bounds: Vec<f64>) {
        write(&self.bucket_overrides).insert(name.to_string(), bounds);
    }

    // -- Counters -----------------------------------------------------------

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.increment_counter_by(name, labels, 1);
    }

    pub fn increment_counter_by(&self, name: &str, labels: &[(&str, &str)], amount: u64) {
        let key = (name.to_string(), Labels::new(labels));
        if let Some(counter) = read(&self.counters).get(&key) {
            counter.fetch_add(amount, Ordering::Relaxed);
            return;
        }
        write(&self.counters)
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(amount, Ordering::Relaxed);
    }

    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (name.to_string(), Labels::new(labels));
        read(&self.counters)
            .get(&key)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Sum of every series of a counter family.
    pub fn counter_total(&self, name: &str) -> u64 {
        read(&self.counters)
            .iter()
            .filter(|((n, _), _)| n == name)
            .map(|(_, c)| c.load(Ordering::Relaxed))
            .sum()
    }

    // -- Gauges -------------------------------------------------------------

    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: i64) {
        let key = (name.to_string(), Labels::new(labels));
        if let Some(gauge) = read(&self.gauges).get(&key) {
            gauge.store(value, Ordering::Relaxed);
            return;
        }
        write(&self.gauges)
            .entry(key)
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> i64 {
        let key = (name.to_string(), Labels::new(labels));
        read(&self.gauges)
            .get(&key)
            .map_or(0, |g| g.load(Ordering::Relaxed))
    }

    // -- Histograms ---------------------------------------------------------

    pub fn observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = (name.to_string(), Labels::new(labels));
        if let Some(histogram) = read(&self.histograms).get(&key) {
            histogram.observe(value);
            return;
        }
        let bounds = read(&self.bucket_overrides)
            .get(name)
            .cloned()
            .unwrap_or_else(duration_buckets);
        write(&self.histograms)
            .entry(key)
            .or_insert_with(|| Histogram::new(bounds))
            .observe(value);
    }

    /// `(count, sum)` of one histogram series.
    pub fn histogram_stats(&self, name: &str, labels: &[(&str, &str)]) -> Option<(u64, f64)> {
        let key = (name.to_string(), Labels::new(labels));
        read(&self.histograms)
            .get(&key)
            .map(|h| (h.count(), h.sum()))
    }

    // -- Export --------------------------------------------------------------

    /// Prometheus text exposition format, families sorted by name.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        let counters = read(&self.counters);
        let mut keys: Vec<&SeriesKey> = counters.keys().collect();
        keys.sort();
        let mut last_family = None;
        for key in keys {
            let (name, labels) = key;
            if last_family != Some(name) {
                out.push_str(&format!("# TYPE {name} counter\n"));
                last_family = Some(name);
            }
            let value = counters[key].load(Ordering::Relaxed);
            out.push_str(&format!("{name}{} {value}\n", labels.prometheus_str()));
        }
        drop(counters);

        let gauges = read(&self.gauges);
        let mut keys: Vec<&SeriesKey> = gauges.keys().collect();
        keys.sort();
        let mut last_family = None;
        for key in keys {
            let (name, labels) = key;
            if last_family != Some(name) {
                out.push_str(&format!("# TYPE {name} gauge\n"));
                last_family = Some(name);
            }
            let value = gauges[key].load(Ordering::Relaxed);
            out.push_str(&format!("{name}{} {value}\n", labels.prometheus_str()));
        }
        drop(gauges);

        let histograms = read(&self.histograms);
        let mut keys: Vec<&SeriesKey> = histograms.keys().collect();
        keys.sort();
        let mut last_family = None;
        for key in keys {
            let (name, labels) = key;
            if last_family != Some(name) {
                out.push_str(&format!("# TYPE {name} histogram\n"));
                last_family = Some(name);
            }
            let histogram = &histograms[key];
            for (bound, cumulative) in histogram.cumulative() {
                let le = labels.with_le(&bound.to_string());
                out.push_str(&format!("{name}_bucket{} {cumulative}\n", le.prometheus_str()));
            }
            let inf = labels.with_le("+Inf");
            out.push_str(&format!(
                "{name}_bucket{} {}\n",
                inf.prometheus_str(),
                histogram.count()
            ));
            out.push_str(&format!("{name}_sum{} {}\n", labels.prometheus_str(), histogram.sum()));
            out.push_str(&format!(
                "{name}_count{} {}\n",
                labels.prometheus_str(),
                histogram.count()
            ));
        }

        out
    }

    /// Flat JSON snapshot, keyed by `name{labels}`.
    pub fn export_json(&self) -> serde_json::Value {
        let series_name = |(name, labels): &SeriesKey| format!("{name}{}", labels.prometheus_str());

        let counters: serde_json::Map<String, serde_json::Value> = read(&self.counters)
            .iter()
            .map(|(k, v)| (series_name(k), v.load(Ordering::Relaxed).into()))
            .collect();
        let gauges: serde_json::Map<String, serde_json::Value> = read(&self.gauges)
            .iter()
            .map(|(k, v)| (series_name(k), v.load(Ordering::Relaxed).into()))
            .collect();
        let histograms: serde_json::Map<String, serde_json::Value> = read(&self.histograms)
            .iter()
            .map(|(k, h)| {
                (
                    series_name(k),
                    serde_json::json!({ "count": h.count(), "sum": h.sum() }),
                )
            })
            .collect();

        serde_json::json!({
            "counters": counters,
            "gauges": gauges,
            "histograms": histograms,
        })
    }
}

/// Process-wide collector, created on first use.
pub fn global_metrics() -> &'static MetricsCollector {
    static INSTANCE: OnceLock<MetricsCollector> = OnceLock::new();
    INSTANCE.get_or_init(MetricsCollector::with_defaults)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
