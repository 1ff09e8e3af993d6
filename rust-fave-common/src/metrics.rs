//! Metrics collection for the aggregator.
//!
//! Counters and gauges are plain atomics so acceptors and the worker can
//! update them through a shared reference.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/* ---------------------------------------------------------------- *
 * Counter
 * ---------------------------------------------------------------- */

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        self.add(1);
    }

    pub fn add(&self, value: u64) {
        self.value.fetch_add(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/* ---------------------------------------------------------------- *
 * Gauge
 * ---------------------------------------------------------------- */

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturates at zero.
    pub fn decrement(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/* ---------------------------------------------------------------- *
 * Latency histogram
 * ---------------------------------------------------------------- */

/// Task durations in microseconds, bucketed by upper bound.
#[derive(Debug)]
pub struct Histogram {
    bounds: Vec<u64>,
    buckets: Vec<AtomicU64>,
    overflow: AtomicU64,
    sum: AtomicU64,
    count: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    pub fn new(bounds: Vec<u64>) -> Self {
        let buckets = bounds.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            buckets,
            overflow: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
            max: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: u64) {
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.max.fetch_max(value, Ordering::Relaxed);

        match self.bounds.iter().position(|b| value <= *b) {
            Some(i) => self.buckets[i].fetch_add(1, Ordering::Relaxed),
            None => self.overflow.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn observe_duration(&self, elapsed: Duration) {
        self.observe(elapsed.as_micros().min(u64::MAX as u128) as u64);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }

    pub fn average(&self) -> f64 {
        match self.count() {
            0 => 0.0,
            c => self.sum.load(Ordering::Relaxed) as f64 / c as f64,
        }
    }

    /// `(upper_bound, count)` per bucket, followed by `(u64::MAX, overflow)`.
    pub fn counts(&self) -> Vec<(u64, u64)> {
        self.bounds
            .iter()
            .zip(&self.buckets)
            .map(|(b, c)| (*b, c.load(Ordering::Relaxed)))
            .chain(std::iter::once((u64::MAX, self.overflow.load(Ordering::Relaxed))))
            .collect()
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new(vec![100, 1_000, 10_000, 100_000, 1_000_000, 10_000_000])
    }
}

/* ---------------------------------------------------------------- *
 * Timer
 * ---------------------------------------------------------------- */

/// Running measurement that lands in a histogram when stopped.
#[derive(Debug)]
pub struct Timer<'a> {
    start: Instant,
    histogram: &'a Histogram,
}

impl<'a> Timer<'a> {
    pub fn start(histogram: &'a Histogram) -> Self {
        Self {
            start: Instant::now(),
            histogram,
        }
    }

    pub fn stop(self) -> Duration {
        let elapsed = self.start.elapsed();
        self.histogram.observe_duration(elapsed);
        elapsed
    }
}

/* ---------------------------------------------------------------- *
 * Aggregator metrics
 * ---------------------------------------------------------------- */

#[derive(Debug, Default)]
pub struct AggregatorMetrics {
    // Ingress
    pub connections_accepted: Counter,
    pub frames_received: Counter,
    pub frames_rejected: Counter,
    pub bytes_received: Counter,
    pub queue_depth: Gauge,

    // Worker
    pub messages_applied: Counter,
    pub messages_rejected: Counter,
    pub messages_failed: Counter,
    /// Edits skipped because they named unknown tables or ports.
    pub edits_skipped: Counter,
    pub task_time: Histogram,

    // Engine
    pub rpc_calls: Counter,
    pub rpc_errors: Counter,
}

impl AggregatorMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Display for AggregatorMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "frames={} rejected_frames={} applied={} rejected={} failed={} skipped_edits={} \
             rpc_calls={} rpc_errors={} avg_task_us={:.1} max_task_us={}",
            self.frames_received.value(),
            self.frames_rejected.value(),
            self.messages_applied.value(),
            self.messages_rejected.value(),
            self.messages_failed.value(),
            self.edits_skipped.value(),
            self.rpc_calls.value(),
            self.rpc_errors.value(),
            self.task_time.average(),
            self.task_time.max(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauge_saturates() {
        let gauge = Gauge::new();
        gauge.increment();
        gauge.decrement();
        gauge.decrement();
        assert_eq!(gauge.value(), 0);
    }

    #[test]
    fn test_histogram_buckets() {
        let histogram = Histogram::new(vec![10, 100]);
        histogram.observe(5);
        histogram.observe(10);
        histogram.observe(50);
        histogram.observe(500);

        assert_eq!(histogram.counts(), vec![(10, 2), (100, 1), (u64::MAX, 1)]);
        assert_eq!(histogram.count(), 4);
        assert_eq!(histogram.max(), 500);
        assert!((histogram.average() - 141.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_summary_line() {
        let metrics = AggregatorMetrics::new();
        metrics.rpc_calls.add(3);
        metrics.task_time.observe_duration(Duration::from_millis(2));
        let line = metrics.to_string();
        assert!(line.contains("rpc_calls=3"));
        assert!(line.contains("max_task_us=2000"));
    }

    #[test]
    fn test_timer_records() {
        let histogram = Histogram::default();
        let timer = Timer::start(&histogram);
        let elapsed = timer.stop();
        assert_eq!(histogram.count(), 1);
        assert!(histogram.max() <= elapsed.as_micros() as u64);
    }
}
