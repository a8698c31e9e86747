use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use ahash::AHashMap;

// ---------------------------------------------------------------------------
// Metric names
// ---------------------------------------------------------------------------

pub const REQUESTS_TOTAL: &str = "switchboard_requests_total";
pub const CACHE_HITS_TOTAL: &str = "switchboard_cache_hits_total";
pub const CACHE_MISSES_TOTAL: &str = "switchboard_cache_misses_total";
pub const BUDGET_DENIALS_TOTAL: &str = "switchboard_budget_denials_total";
pub const DISPATCH_FAILURES_TOTAL: &str = "switchboard_dispatch_failures_total";
pub const DISPATCH_DURATION_SECONDS: &str = "switchboard_dispatch_duration_seconds";
pub const WRITE_QUEUE_DROPPED_TOTAL: &str = "switchboard_write_queue_dropped_total";
pub const CATALOG_MODELS: &str = "switchboard_catalog_models";

/// Bucket bounds for model call latency, in seconds. Model calls run from
/// tens of milliseconds (local, warm) up to the dispatch timeout.
fn dispatch_buckets() -> Vec<f64> {
    vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0]
}

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Histogram {
    bounds: Vec<f64>,
    /// Per-bucket (non-cumulative) counts.
    counts: Vec<AtomicU64>,
    sum_bits: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(bounds: Vec<f64>) -> Self {
        let counts = bounds.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            counts,
            sum_bits: AtomicU64::new(0f64.to_bits()),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        // f64 add via CAS on the bit pattern
        let _ = self
            .sum_bits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + value).to_bits())
            });
        if let Some(i) = self.bounds.iter().position(|b| value <= *b) {
            self.counts[i].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn sum(&self) -> f64 {
        f64::from_bits(self.sum_bits.load(Ordering::Relaxed))
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// `(upper_bound, cumulative_count)` pairs, Prometheus style.
    pub fn cumulative(&self) -> Vec<(f64, u64)> {
        let mut running = 0;
        self.bounds
            .iter()
            .zip(&self.counts)
            .map(|(b, c)| {
                running += c.load(Ordering::Relaxed);
                (*b, running)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// Sorted `key=value` pairs distinguishing series within a counter family.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut v: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        v.sort();
        Self(v)
    }

    fn render(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let inner: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}=\"{v}\"")).collect();
        format!("{{{}}}", inner.join(","))
    }
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

/// Counters, gauges and histograms for one router instance.
///
/// Constructed at boot and shared by `Arc`; there is no process-global
/// instance. Values are atomics; the maps are only write-locked the first
/// time a series is seen.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: RwLock<AHashMap<(String, Labels), AtomicU64>>,
    gauges: RwLock<AHashMap<String, AtomicI64>>,
    histograms: RwLock<AHashMap<String, Histogram>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        let key = (name.to_string(), Labels::new(labels));
        {
            let map = self.counters.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(c) = map.get(&key) {
                c.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        let mut map = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (name.to_string(), Labels::new(labels));
        self.counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn set_gauge(&self, name: &str, value: i64) {
        {
            let map = self.gauges.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(g) = map.get(name) {
                g.store(value, Ordering::Relaxed);
                return;
            }
        }
        let mut map = self.gauges.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub fn gauge(&self, name: &str) -> i64 {
        self.gauges
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Record an observation, creating the histogram with dispatch buckets
    /// on first use.
    pub fn observe(&self, name: &str, value: f64) {
        {
            let map = self.histograms.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(h) = map.get(name) {
                h.observe(value);
                return;
            }
        }
        let mut map = self.histograms.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(name.to_string())
            .or_insert_with(|| Histogram::new(dispatch_buckets()))
            .observe(value);
    }

    pub fn histogram_count(&self, name: &str) -> u64 {
        self.histograms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(Histogram::count)
            .unwrap_or(0)
    }

    // -- Export --------------------------------------------------------------

    /// Prometheus text exposition format, families sorted by name.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        {
            let map = self.counters.read().unwrap_or_else(PoisonError::into_inner);
            let mut series: Vec<(&String, &Labels, u64)> = map
                .iter()
                .map(|((name, labels), v)| (name, labels, v.load(Ordering::Relaxed)))
                .collect();
            series.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
            let mut last: Option<&str> = None;
            for (name, labels, value) in series {
                if last != Some(name.as_str()) {
                    let _ = writeln!(out, "# TYPE {name} counter");
                    last = Some(name.as_str());
                }
                let _ = writeln!(out, "{name}{} {value}", labels.render());
            }
        }

        {
            let map = self.gauges.read().unwrap_or_else(PoisonError::into_inner);
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            for name in names {
                let _ = writeln!(out, "# TYPE {name} gauge");
                let _ = writeln!(out, "{name} {}", map[name].load(Ordering::Relaxed));
            }
        }

        {
            let map = self.histograms.read().unwrap_or_else(PoisonError::into_inner);
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            for name in names {
                let h = &map[name];
                let _ = writeln!(out, "# TYPE {name} histogram");
                for (bound, cumulative) in h.cumulative() {
                    let _ = writeln!(out, "{name}_bucket{{le=\"{bound}\"}} {cumulative}");
                }
                let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {}", h.count());
                let _ = writeln!(out, "{name}_sum {}", h.sum());
                let _ = writeln!(out, "{name}_count {}", h.count());
            }
        }

        out
    }

    /// Flat JSON snapshot for the daemon's one-shot output.
    pub fn export_json(&self) -> serde_json::Value {
        let counters: serde_json::Map<String, serde_json::Value> = self
            .counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|((name, labels), v)| {
                (
                    format!("{name}{}", labels.render()),
                    serde_json::json!(v.load(Ordering::Relaxed)),
                )
            })
            .collect();

        let gauges: serde_json::Map<String, serde_json::Value> = self
            .gauges
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, g)| (name.clone(), serde_json::json!(g.load(Ordering::Relaxed))))
            .collect();

        let histograms: serde_json::Map<String, serde_json::Value> = self
            .histograms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, h)| {
                (
                    name.clone(),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_split_by_labels() {
        let m = MetricsCollector::new();
        m.increment_counter(REQUESTS_TOTAL, &[("outcome", "success")]);
        m.increment_counter(REQUESTS_TOTAL, &[("outcome", "success")]);
        m.increment_counter(REQUESTS_TOTAL, &[("outcome", "failure")]);

        assert_eq!(m.counter(REQUESTS_TOTAL, &[("outcome", "success")]), 2);
        assert_eq!(m.counter(REQUESTS_TOTAL, &[("outcome", "failure")]), 1);
        assert_eq!(m.counter(REQUESTS_TOTAL, &[("outcome", "cached")]), 0);
    }

    #[test]
    fn label_order_does_not_matter() {
        let m = MetricsCollector::new();
        m.increment_counter("x", &[("a", "1"), ("b", "2")]);
        assert_eq!(m.counter("x", &[("b", "2"), ("a", "1")]), 1);
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let h = Histogram::new(vec![0.1, 1.0, 10.0]);
        h.observe(0.05);
        h.observe(0.5);
        h.observe(5.0);
        h.observe(50.0);

        assert_eq!(h.count(), 4);
        assert!((h.sum() - 55.55).abs() < 1e-9);
        assert_eq!(h.cumulative(), vec![(0.1, 1), (1.0, 2), (10.0, 3)]);
    }

    #[test]
    fn prometheus_export_groups_families() {
        let m = MetricsCollector::new();
        m.increment_counter(CACHE_HITS_TOTAL, &[("tier", "fast")]);
        m.increment_counter(CACHE_HITS_TOTAL, &[("tier", "durable")]);
        m.set_gauge(CATALOG_MODELS, 7);
        m.observe(DISPATCH_DURATION_SECONDS, 0.3);

        let text = m.export_prometheus();
        assert_eq!(text.matches("# TYPE switchboard_cache_hits_total counter").count(), 1);
        assert!(text.contains("switchboard_cache_hits_total{tier=\"fast\"} 1"));
        assert!(text.contains("switchboard_catalog_models 7"));
        assert!(text.contains("switchboard_dispatch_duration_seconds_count 1"));
        assert!(text.contains("le=\"+Inf\"} 1"));
    }

    #[test]
    fn json_export_has_sections() {
        let m = MetricsCollector::new();
        m.increment_counter(BUDGET_DENIALS_TOTAL, &[]);
        let json = m.export_json();
        assert_eq!(json["counters"]["switchboard_budget_denials_total"], 1);
        assert!(json["gauges"].as_object().unwrap().is_empty());
    }
}
