//! Metrics Sink (`spec.md` §2): counters, gauges, and timers exposed
//! to an observer. No concrete backend ships here — JMX/Prometheus
//! exporters are out of scope — but every component calls through
//! this trait so a host can wire in whichever it likes.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

use std::collections::HashMap;

pub trait Metrics: Send + Sync {
    fn incr_counter(&self, name: &str, labels: &[(&str, &str)], by: u64);
    fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: i64);
    fn record_timer(&self, name: &str, labels: &[(&str, &str)], millis: u64);
}

/// Discards everything. The default when no observer is configured.
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn incr_counter(&self, _name: &str, _labels: &[(&str, &str)], _by: u64) {}
    fn set_gauge(&self, _name: &str, _labels: &[(&str, &str)], _value: i64) {}
    fn record_timer(&self, _name: &str, _labels: &[(&str, &str)], _millis: u64) {}
}

fn label_key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut parts: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
    parts.sort();
    format!("{name}{{{}}}", parts.join(","))
}

/// Records everything in memory, for assertions in tests and for
/// simple embedded deployments without an external metrics backend.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<String, AtomicU64>>,
    gauges: Mutex<HashMap<String, AtomicI64>>,
    timers: Mutex<HashMap<String, Vec<u64>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .lock()
            .unwrap()
            .get(&label_key(name, labels))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> i64 {
        self.gauges
            .lock()
            .unwrap()
            .get(&label_key(name, labels))
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn timer_samples(&self, name: &str, labels: &[(&str, &str)]) -> Vec<u64> {
        self.timers
            .lock()
            .unwrap()
            .get(&label_key(name, labels))
            .cloned()
            .unwrap_or_default()
    }
}

impl Metrics for InMemoryMetrics {
    fn incr_counter(&self, name: &str, labels: &[(&str, &str)], by: u64) {
        let key = label_key(name, labels);
        let mut map = self.counters.lock().unwrap();
        map.entry(key).or_insert_with(|| AtomicU64::new(0)).fetch_add(by, Ordering::Relaxed);
    }

    fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: i64) {
        let key = label_key(name, labels);
        let mut map = self.gauges.lock().unwrap();
        map.entry(key).or_insert_with(|| AtomicI64::new(0)).store(value, Ordering::Relaxed);
    }

    fn record_timer(&self, name: &str, labels: &[(&str, &str)], millis: u64) {
        let key = label_key(name, labels);
        let mut map = self.timers.lock().unwrap();
        map.entry(key).or_default().push(millis);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_label_set() {
        let m = InMemoryMetrics::new();
        m.incr_counter("fetch.attempts", &[("endpoint", "api1")], 1);
        m.incr_counter("fetch.attempts", &[("endpoint", "api1")], 2);
        m.incr_counter("fetch.attempts", &[("endpoint", "api2")], 5);

        assert_eq!(m.counter("fetch.attempts", &[("endpoint", "api1")]), 3);
        assert_eq!(m.counter("fetch.attempts", &[("endpoint", "api2")]), 5);
    }

    #[test]
    fn gauge_overwrites() {
        let m = InMemoryMetrics::new();
        m.set_gauge("cache.size", &[], 10);
        m.set_gauge("cache.size", &[], 7);
        assert_eq!(m.gauge("cache.size", &[]), 7);
    }

    #[test]
    fn timer_samples_accumulate() {
        let m = InMemoryMetrics::new();
        m.record_timer("fetch.duration_ms", &[], 12);
        m.record_timer("fetch.duration_ms", &[], 34);
        assert_eq!(m.timer_samples("fetch.duration_ms", &[]), vec![12, 34]);
    }
}
