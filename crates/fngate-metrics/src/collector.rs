//! Metrics collector — per-function invocation counters and latency
//! histograms.
//!
//! Series are created on first sight and never removed. Recording on an
//! existing series only touches atomics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use fngate_core::{FunctionIdentity, Observation, Observer};
use tracing::debug;

/// Upper bounds, in seconds, of the latency histogram buckets.
pub const LATENCY_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct SeriesKey {
    function: String,
    code: u16,
}

#[derive(Default)]
struct Histogram {
    /// Non-cumulative counts per bucket; the last slot is `+Inf`.
    buckets: [AtomicU64; LATENCY_BUCKETS.len() + 1],
    count: AtomicU64,
    sum_ns: AtomicU64,
}

impl Histogram {
    fn observe(&self, duration: Duration) {
        let secs = duration.as_secs_f64();
        let slot = LATENCY_BUCKETS
            .iter()
            .position(|bound| secs <= *bound)
            .unwrap_or(LATENCY_BUCKETS.len());
        self.buckets[slot].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }
}

/// One `(function, code)` series.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationSeries {
    /// `name.namespace`.
    pub function: String,
    pub code: u16,
    pub count: u64,
    pub sum_seconds: f64,
    /// Cumulative counts aligned with [`LATENCY_BUCKETS`].
    pub cumulative: Vec<u64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    /// Sorted by function, then code.
    pub invocations: Vec<InvocationSeries>,
    /// `(function, started)` sorted by function.
    pub started: Vec<(String, u64)>,
}

#[derive(Default)]
pub struct MetricsCollector {
    series: RwLock<HashMap<SeriesKey, Arc<Histogram>>>,
    started: RwLock<HashMap<String, Arc<AtomicU64>>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one finished invocation of `function` (`name.namespace`).
    pub fn record(&self, function: &str, code: u16, duration: Duration) {
        let key = SeriesKey {
            function: function.to_string(),
            code,
        };
        let existing = self.series.read().expect("metrics lock").get(&key).cloned();
        let histogram = match existing {
            Some(h) => h,
            None => {
                debug!(function, code, "new invocation series");
                self.series
                    .write()
                    .expect("metrics lock")
                    .entry(key)
                    .or_default()
                    .clone()
            }
        };
        histogram.observe(duration);
    }

    pub fn record_started(&self, function: &str) {
        let existing = self
            .started
            .read()
            .expect("metrics lock")
            .get(function)
            .cloned();
        let counter = match existing {
            Some(c) => c,
            None => self
                .started
                .write()
                .expect("metrics lock")
                .entry(function.to_string())
                .or_default()
                .clone(),
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let series = self.series.read().expect("metrics lock");
        let mut invocations: Vec<InvocationSeries> = series
            .iter()
            .map(|(key, h)| {
                let mut running = 0;
                let cumulative = LATENCY_BUCKETS
                    .iter()
                    .enumerate()
                    .map(|(i, _)| {
                        running += h.buckets[i].load(Ordering::Relaxed);
                        running
                    })
                    .collect();
                InvocationSeries {
                    function: key.function.clone(),
                    code: key.code,
                    count: h.count.load(Ordering::Relaxed),
                    sum_seconds: h.sum_ns.load(Ordering::Relaxed) as f64 / 1e9,
                    cumulative,
                }
            })
            .collect();
        drop(series);
        invocations.sort_by(|a, b| (&a.function, a.code).cmp(&(&b.function, b.code)));

        let mut started: Vec<(String, u64)> = self
            .started
            .read()
            .expect("metrics lock")
            .iter()
            .map(|(f, c)| (f.clone(), c.load(Ordering::Relaxed)))
            .collect();
        started.sort();

        MetricsSnapshot {
            invocations,
            started,
        }
    }
}

impl Observer for MetricsCollector {
    fn started(&self, identity: &FunctionIdentity) {
        self.record_started(&identity.to_string());
    }

    fn observe(&self, o: &Observation) {
        let function = format!("{}.{}", o.function, o.namespace);
        self.record(&function, o.status, Duration::from_nanos(o.duration_ns));
    }
}

#[cfg(test)]
mod tests {
    use fngate_core::{DEFAULT_NAMESPACE, InvocationPath};

    use super::*;

    fn observation(status: u16, millis: u64) -> Observation {
        Observation {
            function: "echo".into(),
            namespace: DEFAULT_NAMESPACE.into(),
            status,
            duration_ns: millis * 1_000_000,
            bytes_out: 0,
            bytes_in: 0,
            call_id: "c".into(),
            path: InvocationPath::Sync,
        }
    }

    #[test]
    fn buckets_are_cumulative() {
        let collector = MetricsCollector::new();
        collector.observe(&observation(200, 3));
        collector.observe(&observation(200, 40));
        collector.observe(&observation(200, 20_000));

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.invocations.len(), 1);
        let series = &snapshot.invocations[0];
        assert_eq!(series.function, "echo.openfaas-fn");
        assert_eq!(series.count, 3);
        // <= 5ms
        assert_eq!(series.cumulative[0], 1);
        // <= 50ms
        assert_eq!(series.cumulative[3], 2);
        // The 20s call only shows up in +Inf.
        assert_eq!(*series.cumulative.last().unwrap(), 2);
        assert!((series.sum_seconds - 20.043).abs() < 1e-6);
    }

    #[test]
    fn codes_are_separate_series() {
        let collector = MetricsCollector::new();
        collector.observe(&observation(200, 1));
        collector.observe(&observation(502, 1));
        collector.observe(&observation(200, 1));

        let codes: Vec<(u16, u64)> = collector
            .snapshot()
            .invocations
            .iter()
            .map(|s| (s.code, s.count))
            .collect();
        assert_eq!(codes, vec![(200, 2), (502, 1)]);
    }

    #[test]
    fn started_counts_per_function() {
        let collector = MetricsCollector::new();
        let echo = FunctionIdentity::parse("echo", DEFAULT_NAMESPACE).unwrap();
        collector.started(&echo);
        collector.started(&echo);
        collector.record_started("other.fns");

        assert_eq!(
            collector.snapshot().started,
            vec![
                ("echo.openfaas-fn".to_string(), 2),
                ("other.fns".to_string(), 1)
            ]
        );
    }
}
