use ahash::AHashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{OnceLock, RwLock};

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// A label set is a sorted list of key=value pairs, used to distinguish
/// counter families (e.g. `messages_total{direction="outbound"}`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
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
}

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

/// Tracks the distribution of observed values across fixed buckets.
#[derive(Debug)]
pub struct Histogram {
    pub buckets: Vec<f64>,
    pub counts: Vec<AtomicU64>,
    sum_bits: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum_bits: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        // Sum is stored as f64 bits so it can be updated atomically.
        loop {
            let current = self.sum_bits.load(Ordering::Relaxed);
            let new = (f64::from_bits(current) + value).to_bits();
            if self
                .sum_bits
                .compare_exchange_weak(current, new, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
        for (i, boundary) in self.buckets.iter().enumerate() {
            if value <= *boundary {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn sum(&self) -> f64 {
        f64::from_bits(self.sum_bits.load(Ordering::Relaxed))
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Latency buckets in milliseconds.
fn default_latency_buckets() -> Vec<f64> {
    vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0]
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

/// Central collector for counters, gauges, and histograms.
///
/// Thread-safe: `RwLock` for registration, atomics for values.
#[derive(Debug)]
pub struct MetricsCollector {
    counters: RwLock<AHashMap<(String, Labels), AtomicU64>>,
    gauges: RwLock<AHashMap<String, AtomicI64>>,
    histograms: RwLock<AHashMap<String, Histogram>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let collector = Self {
            counters: RwLock::new(AHashMap::new()),
            gauges: RwLock::new(AHashMap::new()),
            histograms: RwLock::new(AHashMap::new()),
        };
        {
            let mut h = collector.histograms.write().expect("metrics lock");
            h.insert(
                "search_latency_ms".to_string(),
                Histogram::new(default_latency_buckets()),
            );
        }
        collector
    }

    pub fn inc_counter(&self, name: &str, labels: Labels) {
        self.add_counter(name, labels, 1);
    }

    pub fn add_counter(&self, name: &str, labels: Labels, delta: u64) {
        let key = (name.to_string(), labels);
        {
            let counters = self.counters.read().expect("metrics lock");
            if let Some(c) = counters.get(&key) {
                c.fetch_add(delta, Ordering::Relaxed);
                return;
            }
        }
        let mut counters = self.counters.write().expect("metrics lock");
        counters
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    pub fn counter(&self, name: &str, labels: &Labels) -> u64 {
        let counters = self.counters.read().expect("metrics lock");
        counters
            .get(&(name.to_string(), labels.clone()))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn set_gauge(&self, name: &str, value: i64) {
        {
            let gauges = self.gauges.read().expect("metrics lock");
            if let Some(g) = gauges.get(name) {
                g.store(value, Ordering::Relaxed);
                return;
            }
        }
        let mut gauges = self.gauges.write().expect("metrics lock");
        gauges
            .entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub fn gauge(&self, name: &str) -> i64 {
        let gauges = self.gauges.read().expect("metrics lock");
        gauges
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn observe(&self, name: &str, value: f64) {
        let histograms = self.histograms.read().expect("metrics lock");
        if let Some(h) = histograms.get(name) {
            h.observe(value);
        }
    }

    pub fn histogram_count(&self, name: &str) -> u64 {
        let histograms = self.histograms.read().expect("metrics lock");
        histograms.get(name).map(|h| h.count()).unwrap_or(0)
    }

    /// Snapshot counters into a JSON object for `/health`-style surfaces.
    pub fn snapshot(&self) -> serde_json::Value {
        let mut out = serde_json::Map::new();
        {
            let counters = self.counters.read().expect("metrics lock");
            for ((name, labels), value) in counters.iter() {
                let key = if labels.0.is_empty() {
                    name.clone()
                } else {
                    let inner: Vec<String> =
                        labels.0.iter().map(|(k, v)| format!("{k}={v}")).collect();
                    format!("{}{{{}}}", name, inner.join(","))
                };
                out.insert(key, serde_json::json!(value.load(Ordering::Relaxed)));
            }
        }
        {
            let gauges = self.gauges.read().expect("metrics lock");
            for (name, value) in gauges.iter() {
                out.insert(name.clone(), serde_json::json!(value.load(Ordering::Relaxed)));
            }
        }
        serde_json::Value::Object(out)
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide collector used by components that do not take an injected one.
pub fn global_metrics() -> &'static MetricsCollector {
    static GLOBAL: OnceLock<MetricsCollector> = OnceLock::new();
    GLOBAL.get_or_init(MetricsCollector::new)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_label_set() {
        let m = MetricsCollector::new();
        let out = Labels::new(&[("direction", "outbound")]);
        let inb = Labels::new(&[("direction", "inbound")]);

        m.inc_counter("messages_total", out.clone());
        m.inc_counter("messages_total", out.clone());
        m.inc_counter("messages_total", inb.clone());

        assert_eq!(m.counter("messages_total", &out), 2);
        assert_eq!(m.counter("messages_total", &inb), 1);
        assert_eq!(m.counter("messages_total", &Labels::empty()), 0);
    }

    #[test]
    fn labels_are_order_insensitive() {
        let a = Labels::new(&[("a", "1"), ("b", "2")]);
        let b = Labels::new(&[("b", "2"), ("a", "1")]);
        assert_eq!(a, b);
    }

    #[test]
    fn gauges_store_latest_value() {
        let m = MetricsCollector::new();
        m.set_gauge("connected_matrices", 3);
        m.set_gauge("connected_matrices", 2);
        assert_eq!(m.gauge("connected_matrices"), 2);
    }

    #[test]
    fn histogram_observes() {
        let m = MetricsCollector::new();
        m.observe("search_latency_ms", 12.0);
        m.observe("search_latency_ms", 480.0);
        assert_eq!(m.histogram_count("search_latency_ms"), 2);
    }

    #[test]
    fn snapshot_includes_counters_and_gauges() {
        let m = MetricsCollector::new();
        m.inc_counter("auth_failures_total", Labels::empty());
        m.set_gauge("connected_matrices", 1);
        let snap = m.snapshot();
        assert_eq!(snap["auth_failures_total"], 1);
        assert_eq!(snap["connected_matrices"], 1);
    }
}
