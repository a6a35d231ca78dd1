use ahash::AHashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Events seen on the bus, labelled by `type`.
pub const EVENTS_TOTAL: &str = "taskhive_events_total";
/// Claim-to-terminal duration of tasks, labelled by outcome.
pub const TASK_DURATION_SECONDS: &str = "taskhive_task_duration_seconds";
/// Claimable backlog per role.
pub const PENDING_TASKS: &str = "taskhive_pending_tasks";
/// Registered instances per role.
pub const INSTANCES: &str = "taskhive_instances";

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

/// Distribution of observed values over fixed bucket boundaries.
#[derive(Debug)]
pub struct Histogram {
    pub buckets: Vec<f64>,
    pub counts: Vec<AtomicU64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        // f64 sum stored as bits.
        let _ = self
            .sum
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + value).to_bits())
            });
        if let Some(idx) = self.buckets.iter().position(|b| value <= *b) {
            self.counts[idx].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get_sum(&self) -> f64 {
        f64::from_bits(self.sum.load(Ordering::Relaxed))
    }

    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Cumulative counts per bucket, as Prometheus reports them.
    pub fn cumulative(&self) -> Vec<(f64, u64)> {
        let mut running = 0;
        self.buckets
            .iter()
            .zip(&self.counts)
            .map(|(bound, count)| {
                running += count.load(Ordering::Relaxed);
                (*bound, running)
            })
            .collect()
    }
}

/// Buckets for task durations in seconds, from one second to two hours.
pub fn task_duration_buckets() -> Vec<f64> {
    vec![
        1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0, 3600.0, 7200.0,
    ]
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// Sorted `key=value` pairs distinguishing series of one metric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut v: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        v.sort_by(|a, b| a.0.cmp(&b.0));
        Self(v)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `{key="value",key2="value2"}`, or nothing for an empty set.
    pub fn prometheus_str(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let inner: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{k}=\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")))
            .collect();
        format!("{{{}}}", inner.join(","))
    }

    fn with(&self, key: &str, value: &str) -> String {
        let mut pairs: Vec<(&str, &str)> =
            self.0.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        pairs.push((key, value));
        Labels::new(&pairs).prometheus_str()
    }
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

type Series<T> = RwLock<AHashMap<(String, Labels), T>>;

/// Counters, gauges and histograms keyed by name and label set.
///
/// Registration takes a write lock once per series; updates are atomic.
#[derive(Debug)]
pub struct MetricsCollector {
    counters: Series<AtomicU64>,
    gauges: Series<AtomicI64>,
    histograms: Series<Histogram>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(AHashMap::new()),
            gauges: RwLock::new(AHashMap::new()),
            histograms: RwLock::new(AHashMap::new()),
        }
    }

    // -- Counters -----------------------------------------------------------

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.increment_counter_by(name, labels, 1);
    }

    pub fn increment_counter_by(&self, name: &str, labels: &[(&str, &str)], amount: u64) {
        let key = (name.to_string(), Labels::new(labels));
        {
            let map = read(&self.counters);
            if let Some(c) = map.get(&key) {
                c.fetch_add(amount, Ordering::Relaxed);
                return;
            }
        }
        write(&self.counters)
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(amount, Ordering::Relaxed);
    }

    pub fn get_counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (name.to_string(), Labels::new(labels));
        read(&self.counters)
            .get(&key)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    // -- Gauges -------------------------------------------------------------

    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: i64) {
        let key = (name.to_string(), Labels::new(labels));
        {
            let map = read(&self.gauges);
            if let Some(g) = map.get(&key) {
                g.store(value, Ordering::Relaxed);
                return;
            }
        }
        write(&self.gauges)
            .entry(key)
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub fn get_gauge(&self, name: &str, labels: &[(&str, &str)]) -> i64 {
        let key = (name.to_string(), Labels::new(labels));
        read(&self.gauges)
            .get(&key)
            .map_or(0, |g| g.load(Ordering::Relaxed))
    }

    // -- Histograms ---------------------------------------------------------

    /// Record into a histogram, creating it with [`task_duration_buckets`]
    /// on first use.
    pub fn record_histogram(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = (name.to_string(), Labels::new(labels));
        {
            let map = read(&self.histograms);
            if let Some(h) = map.get(&key) {
                h.observe(value);
                return;
            }
        }
        write(&self.histograms)
            .entry(key)
            .or_insert_with(|| Histogram::new(task_duration_buckets()))
            .observe(value);
    }

    /// `(count, sum)` of a histogram series.
    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> (u64, f64) {
        let key = (name.to_string(), Labels::new(labels));
        read(&self.histograms)
            .get(&key)
            .map_or((0, 0.0), |h| (h.get_count(), h.get_sum()))
    }

    // -- Export --------------------------------------------------------------

    /// Prometheus text exposition format, series sorted by name then labels.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        {
            let map = read(&self.counters);
            let mut series: Vec<_> = map.iter().collect();
            series.sort_by(|a, b| a.0.cmp(b.0));
            let mut last = None;
            for ((name, labels), value) in series {
                if last != Some(name) {
                    out.push_str(&format!("# TYPE {name} counter\n"));
                    last = Some(name);
                }
                out.push_str(&format!(
                    "{name}{} {}\n",
                    labels.prometheus_str(),
                    value.load(Ordering::Relaxed)
                ));
            }
        }

        {
            let map = read(&self.gauges);
            let mut series: Vec<_> = map.iter().collect();
            series.sort_by(|a, b| a.0.cmp(b.0));
            let mut last = None;
            for ((name, labels), value) in series {
                if last != Some(name) {
                    out.push_str(&format!("# TYPE {name} gauge\n"));
                    last = Some(name);
                }
                out.push_str(&format!(
                    "{name}{} {}\n",
                    labels.prometheus_str(),
                    value.load(Ordering::Relaxed)
                ));
            }
        }

        {
            let map = read(&self.histograms);
            let mut series: Vec<_> = map.iter().collect();
            series.sort_by(|a, b| a.0.cmp(b.0));
            let mut last = None;
            for ((name, labels), h) in series {
                if last != Some(name) {
                    out.push_str(&format!("# TYPE {name} histogram\n"));
                    last = Some(name);
                }
                for (bound, cumulative) in h.cumulative() {
                    out.push_str(&format!(
                        "{name}_bucket{} {cumulative}\n",
                        labels.with("le", &bound.to_string())
                    ));
                }
                out.push_str(&format!(
                    "{name}_bucket{} {}\n",
                    labels.with("le", "+Inf"),
                    h.get_count()
                ));
                let plain = labels.prometheus_str();
                out.push_str(&format!("{name}_sum{plain} {}\n", h.get_sum()));
                out.push_str(&format!("{name}_count{plain} {}\n", h.get_count()));
            }
        }

        out
    }

    /// All series as one JSON object keyed by `name{labels}`.
    pub fn export_json(&self) -> serde_json::Value {
        let series_key = |name: &str, labels: &Labels| format!("{name}{}", labels.prometheus_str());

        let counters: serde_json::Map<String, serde_json::Value> = read(&self.counters)
            .iter()
            .map(|((name, labels), v)| {
                (series_key(name, labels), serde_json::json!(v.load(Ordering::Relaxed)))
            })
            .collect();

        let gauges: serde_json::Map<String, serde_json::Value> = read(&self.gauges)
            .iter()
            .map(|((name, labels), v)| {
                (series_key(name, labels), serde_json::json!(v.load(Ordering::Relaxed)))
            })
            .collect();

        let histograms: serde_json::Map<String, serde_json::Value> = read(&self.histograms)
            .iter()
            .map(|((name, labels), h)| {
                let buckets: Vec<serde_json::Value> = h
                    .cumulative()
                    .into_iter()
                    .map(|(le, count)| serde_json::json!({ "le": le, "count": count }))
                    .collect();
                (
                    series_key(name, labels),
                    serde_json::json!({
                        "buckets": buckets,
                        "sum": h.get_sum(),
                        "count": h.get_count(),
                    }),
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

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
