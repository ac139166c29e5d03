//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Lock-free metrics collector for the polling/publish pipeline.
///
/// All recording operations are lock-free using atomics. The `report()`
/// method atomically swaps counters to get a consistent snapshot.
pub struct Metrics {
    /// Total successful reads ever processed (monotonic).
    reads_total: AtomicU64,
    /// Total failed reads, by classified error code (monotonic).
    read_errors_total: AtomicU64,
    /// Envelopes published since last report (reset on report).
    envelopes_since_report: AtomicU64,
    /// Envelopes published ever (monotonic).
    envelopes_total: AtomicU64,
    /// Write commands accepted from MQTT (monotonic).
    write_commands_total: AtomicU64,
    /// Write commands dropped due to a full queue (monotonic).
    write_commands_dropped: AtomicU64,
    /// Max observed read latency in microseconds (reset on report).
    latency_max_us: AtomicU64,
    /// Sum of read latencies in microseconds (reset on report).
    latency_sum_us: AtomicU64,
    /// Last report time (only accessed from the reporter, not atomic).
    last_report_time: std::sync::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            reads_total: AtomicU64::new(0),
            read_errors_total: AtomicU64::new(0),
            envelopes_since_report: AtomicU64::new(0),
            envelopes_total: AtomicU64::new(0),
            write_commands_total: AtomicU64::new(0),
            write_commands_dropped: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            last_report_time: std::sync::Mutex::new(Instant::now()),
        }
    }

    /// Record a completed read transaction (lock-free).
    #[inline]
    pub fn record_read(&self, ok: bool, latency_us: u64) {
        if ok {
            self.reads_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.read_errors_total.fetch_add(1, Ordering::Relaxed);
        }
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);

        let mut current_max = self.latency_max_us.load(Ordering::Relaxed);
        while latency_us > current_max {
            match self.latency_max_us.compare_exchange_weak(
                current_max,
                latency_us,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current_max = actual,
            }
        }
    }

    /// Record an envelope publish (lock-free).
    #[inline]
    pub fn record_envelope_published(&self) {
        self.envelopes_total.fetch_add(1, Ordering::Relaxed);
        self.envelopes_since_report.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an accepted write command (lock-free).
    #[inline]
    pub fn record_write_command(&self) {
        self.write_commands_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a write command dropped because the write queue was full.
    #[inline]
    pub fn record_write_command_dropped(&self) {
        self.write_commands_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn reads_total(&self) -> u64 {
        self.reads_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn read_errors_total(&self) -> u64 {
        self.read_errors_total.load(Ordering::Relaxed)
    }

    /// Calculate and return a metrics summary, then reset periodic counters.
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self, bus_count: usize, write_queue_depth: usize) -> MetricsSummary {
        let envelopes_count = self.envelopes_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.latency_max_us.swap(0, Ordering::Relaxed);

        let reads_total = self.reads_total.load(Ordering::Relaxed);
        let read_errors_total = self.read_errors_total.load(Ordering::Relaxed);
        let envelopes_total = self.envelopes_total.load(Ordering::Relaxed);
        let write_commands_total = self.write_commands_total.load(Ordering::Relaxed);
        let write_commands_dropped = self.write_commands_dropped.load(Ordering::Relaxed);

        let elapsed = {
            let mut last = self.last_report_time.lock().unwrap();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let envelopes_per_sec = if elapsed.as_secs_f64() > 0.0 {
            envelopes_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let avg_latency = if reads_total > 0 { latency_sum / reads_total.max(1) } else { 0 };

        MetricsSummary {
            reads_total,
            read_errors_total,
            envelopes_total,
            envelopes_per_sec,
            avg_read_latency_us: avg_latency,
            max_read_latency_us: max_latency,
            write_commands_total,
            write_commands_dropped,
            bus_count,
            write_queue_depth,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

// Metrics is Send + Sync because all fields are atomic or Mutex-wrapped.
unsafe impl Send for Metrics {}
unsafe impl Sync for Metrics {}

#[derive(Debug)]
#[allow(dead_code)]
pub struct MetricsSummary {
    pub reads_total: u64,
    pub read_errors_total: u64,
    pub envelopes_total: u64,
    pub envelopes_per_sec: f64,
    pub avg_read_latency_us: u64,
    pub max_read_latency_us: u64,
    pub write_commands_total: u64,
    pub write_commands_dropped: u64,
    pub bus_count: usize,
    pub write_queue_depth: usize,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            reads_total = %self.reads_total,
            read_errors_total = %self.read_errors_total,
            envelopes_total = %self.envelopes_total,
            envelopes_per_sec = format!("{:.1}", self.envelopes_per_sec),
            avg_read_latency_us = %self.avg_read_latency_us,
            max_read_latency_us = %self.max_read_latency_us,
            write_commands_total = %self.write_commands_total,
            write_commands_dropped = %self.write_commands_dropped,
            bus_count = %self.bus_count,
            write_queue_depth = %self.write_queue_depth,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.reads_total(), 0);
        assert_eq!(metrics.read_errors_total(), 0);
    }

    #[test]
    fn test_record_read() {
        let metrics = Metrics::new();
        metrics.record_read(true, 100);
        metrics.record_read(false, 200);
        assert_eq!(metrics.reads_total(), 1);
        assert_eq!(metrics.read_errors_total(), 1);
    }

    #[test]
    fn test_record_envelope_and_write_command() {
        let metrics = Metrics::new();
        metrics.record_envelope_published();
        metrics.record_envelope_published();
        metrics.record_write_command();
        metrics.record_write_command_dropped();

        let summary = metrics.report(1, 0);
        assert_eq!(summary.envelopes_total, 2);
        assert_eq!(summary.write_commands_total, 1);
        assert_eq!(summary.write_commands_dropped, 1);
    }

    #[test]
    fn test_report_resets_periodic_counters() {
        let metrics = Metrics::new();
        metrics.record_read(true, 100);
        metrics.record_read(true, 300);
        metrics.record_envelope_published();

        let summary = metrics.report(2, 5);
        assert_eq!(summary.reads_total, 2);
        assert_eq!(summary.avg_read_latency_us, 200);
        assert_eq!(summary.max_read_latency_us, 300);
        assert_eq!(summary.bus_count, 2);
        assert_eq!(summary.write_queue_depth, 5);

        assert_eq!(metrics.envelopes_since_report.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.latency_sum_us.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.latency_max_us.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let metrics = Arc::new(Metrics::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let m = metrics.clone();
            handles.push(thread::spawn(move || {
                for i in 0..1000 {
                    m.record_read(true, i as u64);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.reads_total(), 10_000);
    }
}
