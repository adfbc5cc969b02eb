//! Prometheus-compatible metrics primitives and per-role registries.
//!
//! Counters, gauges and histograms are plain atomics so recording never
//! blocks a request path. Each process constructs exactly one registry and
//! passes it explicitly to the components that record into it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for latency measurements (in milliseconds)
const LATENCY_BUCKETS: [f64; 11] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];

/// Histogram bucket boundaries for migration durations (in seconds)
const MIGRATION_BUCKETS: [f64; 9] = [1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 900.0, 1800.0];

/// A simple histogram for duration tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Create a new histogram with default latency buckets (milliseconds)
    pub fn new() -> Self {
        Self::with_buckets(&LATENCY_BUCKETS)
    }

    /// Create a histogram with migration-scale buckets (seconds)
    pub fn for_migrations() -> Self {
        Self::with_buckets(&MIGRATION_BUCKETS)
    }

    /// Create a histogram with custom bucket boundaries
    pub fn with_buckets(boundaries: &[f64]) -> Self {
        let mut buckets = Vec::with_capacity(boundaries.len() + 1);
        for _ in 0..=boundaries.len() {
            buckets.push(AtomicU64::new(0));
        }
        Self {
            buckets,
            boundaries: boundaries.to_vec(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a value in the histogram
    pub fn observe(&self, value: f64) {
        let mut bucket_idx = self.boundaries.len();
        for (i, &boundary) in self.boundaries.iter().enumerate() {
            if value <= boundary {
                bucket_idx = i;
                break;
            }
        }

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        // Stored scaled by 1000 to keep sub-unit precision in an integer
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative (boundary, count) pairs, ending with +Inf
    pub fn cumulative_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.boundaries.len() + 1);

        for (i, &boundary) in self.boundaries.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            result.push((boundary, cumulative));
        }

        cumulative += self.buckets[self.boundaries.len()].load(Ordering::Relaxed);
        result.push((f64::INFINITY, cumulative));

        result
    }

    pub fn sum(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge for tracking current values
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

fn write_counter(out: &mut String, name: &str, help: &str, value: u64) {
    use std::fmt::Write;
    writeln!(out, "# HELP {} {}", name, help).unwrap();
    writeln!(out, "# TYPE {} counter", name).unwrap();
    writeln!(out, "{} {}", name, value).unwrap();
}

fn write_gauge(out: &mut String, name: &str, help: &str, value: u64) {
    use std::fmt::Write;
    writeln!(out, "# HELP {} {}", name, help).unwrap();
    writeln!(out, "# TYPE {} gauge", name).unwrap();
    writeln!(out, "{} {}", name, value).unwrap();
}

fn write_histogram(out: &mut String, name: &str, help: &str, hist: &Histogram) {
    use std::fmt::Write;
    writeln!(out, "# HELP {} {}", name, help).unwrap();
    writeln!(out, "# TYPE {} histogram", name).unwrap();
    for (le, count) in hist.cumulative_buckets() {
        if le.is_infinite() {
            writeln!(out, "{}_bucket{{le=\"+Inf\"}} {}", name, count).unwrap();
        } else {
            writeln!(out, "{}_bucket{{le=\"{}\"}} {}", name, le, count).unwrap();
        }
    }
    writeln!(out, "{}_sum {}", name, hist.sum()).unwrap();
    writeln!(out, "{}_count {}", name, hist.count()).unwrap();
}

/// Metrics for a metadata node (consensus gauges + API counters)
#[derive(Debug)]
pub struct MetaMetrics {
    pub requests_total: Counter,
    pub request_errors: Counter,
    pub request_duration: Histogram,
    pub commands_applied: Counter,
    pub commands_rejected: Counter,
    pub raft_last_index: Gauge,
    pub raft_commit_index: Gauge,
    pub raft_applied_index: Gauge,
    pub raft_term: Gauge,
    pub snapshots_taken: Counter,
    start_time: Instant,
}

impl MetaMetrics {
    pub fn new() -> Self {
        Self {
            requests_total: Counter::new(),
            request_errors: Counter::new(),
            request_duration: Histogram::new(),
            commands_applied: Counter::new(),
            commands_rejected: Counter::new(),
            raft_last_index: Gauge::new(),
            raft_commit_index: Gauge::new(),
            raft_applied_index: Gauge::new(),
            raft_term: Gauge::new(),
            snapshots_taken: Counter::new(),
            start_time: Instant::now(),
        }
    }

    pub fn record_request(&self, duration: Duration, success: bool) {
        self.requests_total.inc();
        self.request_duration
            .observe(duration.as_secs_f64() * 1000.0);
        if !success {
            self.request_errors.inc();
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        write_counter(
            &mut out,
            "tierstore_meta_requests_total",
            "Total API requests",
            self.requests_total.get(),
        );
        write_counter(
            &mut out,
            "tierstore_meta_request_errors_total",
            "Total API request errors",
            self.request_errors.get(),
        );
        write_histogram(
            &mut out,
            "tierstore_meta_request_duration_ms",
            "API request duration in milliseconds",
            &self.request_duration,
        );
        write_counter(
            &mut out,
            "tierstore_meta_commands_applied_total",
            "Catalog commands applied",
            self.commands_applied.get(),
        );
        write_counter(
            &mut out,
            "tierstore_meta_commands_rejected_total",
            "Catalog commands rejected",
            self.commands_rejected.get(),
        );
        write_gauge(
            &mut out,
            "tierstore_raft_last_index",
            "Last raft log index",
            self.raft_last_index.get(),
        );
        write_gauge(
            &mut out,
            "tierstore_raft_commit_index",
            "Raft commit index",
            self.raft_commit_index.get(),
        );
        write_gauge(
            &mut out,
            "tierstore_raft_applied_index",
            "Raft applied index",
            self.raft_applied_index.get(),
        );
        write_gauge(
            &mut out,
            "tierstore_raft_term",
            "Current raft term",
            self.raft_term.get(),
        );
        write_counter(
            &mut out,
            "tierstore_raft_snapshots_total",
            "Raft snapshots taken",
            self.snapshots_taken.get(),
        );
        write_gauge(
            &mut out,
            "tierstore_meta_uptime_seconds",
            "Process uptime in seconds",
            self.uptime_seconds(),
        );
        out
    }
}

impl Default for MetaMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Metrics for a shard node
#[derive(Debug)]
pub struct ShardMetrics {
    pub bytes_stored_total: Counter,
    pub bytes_served_total: Counter,
    pub upload_duration: Histogram,
    pub download_duration: Histogram,
    pub disk_usage_bytes: Gauge,
    pub shard_count: Gauge,
    pub orphans_removed: Counter,
    start_time: Instant,
}

impl ShardMetrics {
    pub fn new() -> Self {
        Self {
            bytes_stored_total: Counter::new(),
            bytes_served_total: Counter::new(),
            upload_duration: Histogram::new(),
            download_duration: Histogram::new(),
            disk_usage_bytes: Gauge::new(),
            shard_count: Gauge::new(),
            orphans_removed: Counter::new(),
            start_time: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        write_counter(
            &mut out,
            "tierstore_shard_bytes_stored_total",
            "Total bytes written to this node",
            self.bytes_stored_total.get(),
        );
        write_counter(
            &mut out,
            "tierstore_shard_bytes_served_total",
            "Total bytes served from this node",
            self.bytes_served_total.get(),
        );
        write_histogram(
            &mut out,
            "tierstore_shard_upload_duration_ms",
            "Shard upload duration in milliseconds",
            &self.upload_duration,
        );
        write_histogram(
            &mut out,
            "tierstore_shard_download_duration_ms",
            "Shard download duration in milliseconds",
            &self.download_duration,
        );
        write_gauge(
            &mut out,
            "tierstore_shard_disk_usage_bytes",
            "Bytes on disk under the shard root",
            self.disk_usage_bytes.get(),
        );
        write_gauge(
            &mut out,
            "tierstore_shard_count",
            "Shards stored on this node",
            self.shard_count.get(),
        );
        write_counter(
            &mut out,
            "tierstore_shard_orphans_removed_total",
            "Orphaned shards removed by cleanup",
            self.orphans_removed.get(),
        );
        write_gauge(
            &mut out,
            "tierstore_shard_uptime_seconds",
            "Process uptime in seconds",
            self.uptime_seconds(),
        );
        out
    }
}

impl Default for ShardMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Metrics for the tier controller
#[derive(Debug)]
pub struct TierMetrics {
    pub events_received: Counter,
    pub events_invalid: Counter,
    pub requests_queued: Counter,
    pub requests_dropped: Counter,
    pub requests_skipped: Counter,
    pub migrations_creation_failed: Counter,
    pub migrations_succeeded: Counter,
    pub migrations_failed: Counter,
    pub migrations_timed_out: Counter,
    pub migrations_in_flight: Gauge,
    pub migration_duration: Histogram,
    start_time: Instant,
}

impl TierMetrics {
    pub fn new() -> Self {
        Self {
            events_received: Counter::new(),
            events_invalid: Counter::new(),
            requests_queued: Counter::new(),
            requests_dropped: Counter::new(),
            requests_skipped: Counter::new(),
            migrations_creation_failed: Counter::new(),
            migrations_succeeded: Counter::new(),
            migrations_failed: Counter::new(),
            migrations_timed_out: Counter::new(),
            migrations_in_flight: Gauge::new(),
            migration_duration: Histogram::for_migrations(),
            start_time: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        write_counter(
            &mut out,
            "tierstore_tier_events_received_total",
            "Tiering events received",
            self.events_received.get(),
        );
        write_counter(
            &mut out,
            "tierstore_tier_events_invalid_total",
            "Tiering events that failed to parse",
            self.events_invalid.get(),
        );
        write_counter(
            &mut out,
            "tierstore_tier_requests_queued_total",
            "Migration requests enqueued",
            self.requests_queued.get(),
        );
        write_counter(
            &mut out,
            "tierstore_tier_requests_dropped_total",
            "Migration requests dropped on queue overflow",
            self.requests_dropped.get(),
        );
        write_counter(
            &mut out,
            "tierstore_tier_requests_skipped_total",
            "Migration requests skipped by decision rules",
            self.requests_skipped.get(),
        );
        write_counter(
            &mut out,
            "tierstore_tier_migrations_creation_failed_total",
            "Migrations that failed to start",
            self.migrations_creation_failed.get(),
        );
        write_counter(
            &mut out,
            "tierstore_tier_migrations_succeeded_total",
            "Migrations completed successfully",
            self.migrations_succeeded.get(),
        );
        write_counter(
            &mut out,
            "tierstore_tier_migrations_failed_total",
            "Migrations that failed",
            self.migrations_failed.get(),
        );
        write_counter(
            &mut out,
            "tierstore_tier_migrations_timed_out_total",
            "Migrations cancelled on deadline",
            self.migrations_timed_out.get(),
        );
        write_gauge(
            &mut out,
            "tierstore_tier_migrations_in_flight",
            "Migrations currently running",
            self.migrations_in_flight.get(),
        );
        write_histogram(
            &mut out,
            "tierstore_tier_migration_duration_seconds",
            "End-to-end migration duration in seconds",
            &self.migration_duration,
        );
        write_gauge(
            &mut out,
            "tierstore_tier_uptime_seconds",
            "Process uptime in seconds",
            self.uptime_seconds(),
        );
        out
    }
}

impl Default for TierMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram() {
        let hist = Histogram::new();

        hist.observe(5.0);
        hist.observe(50.0);
        hist.observe(500.0);

        assert_eq!(hist.count(), 3);

        let buckets = hist.cumulative_buckets();
        assert_eq!(buckets.last().unwrap().1, 3);
    }

    #[test]
    fn test_counter_and_gauge() {
        let counter = Counter::new();
        counter.inc();
        counter.add(5);
        assert_eq!(counter.get(), 6);

        let gauge = Gauge::new();
        gauge.set(10);
        assert_eq!(gauge.get(), 10);
    }

    #[test]
    fn test_shard_exposition() {
        let metrics = ShardMetrics::new();
        metrics.bytes_stored_total.add(1024);
        metrics.shard_count.set(9);
        metrics.upload_duration.observe(12.5);

        let out = metrics.to_prometheus();
        assert!(out.contains("tierstore_shard_bytes_stored_total 1024"));
        assert!(out.contains("tierstore_shard_count 9"));
        assert!(out.contains("tierstore_shard_upload_duration_ms_count 1"));
    }

    #[test]
    fn test_tier_exposition() {
        let metrics = TierMetrics::new();
        metrics.events_received.inc();
        metrics.requests_dropped.inc();

        let out = metrics.to_prometheus();
        assert!(out.contains("tierstore_tier_events_received_total 1"));
        assert!(out.contains("tierstore_tier_requests_dropped_total 1"));
    }
}
