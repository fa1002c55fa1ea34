use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;

use crate::model::BufferType;

/// Network measurement for one segment, reported once the segment is both fully loaded
/// and fully parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentNetworkMetrics {
    pub buffer_type: BufferType,
    /// Total size of the loaded data, in bytes.
    pub size: u64,
    /// Time spent on the request that succeeded.
    pub request_duration: Duration,
    /// Duration of media contained in the segment, in seconds, when parsing found it.
    pub segment_duration: Option<f64>,
}

/// Receives per-segment network measurements, typically a bandwidth estimator.
pub trait MetricsListener: Send + Sync {
    fn on_segment_metrics(&self, metrics: &SegmentNetworkMetrics);
}

/// Counters describing the scheduler's network activity
///
/// All counters use atomic operations for thread-safe access.
#[derive(Debug, Default)]
pub struct NetworkMetrics {
    // Request metrics
    /// Segment requests sent to a loader, retries included
    pub requests_total: AtomicU64,
    /// Segments fully loaded and parsed
    pub segments_loaded: AtomicU64,
    /// Bytes of fully loaded segments
    pub loaded_bytes_total: AtomicU64,
    /// Sum of successful request durations in milliseconds
    pub request_duration_sum_ms: AtomicU64,
    /// Retries scheduled after a failed attempt
    pub retries: AtomicU64,
    /// Segment requests which failed after every retry
    pub failures: AtomicU64,

    // Scheduling metrics
    /// Tasks interrupted by more urgent ones
    pub interruptions: AtomicU64,

    // Init segment cache metrics
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
}

impl NetworkMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_segment_loaded(&self, bytes: u64, duration: Duration) {
        self.segments_loaded.fetch_add(1, Ordering::Relaxed);
        self.loaded_bytes_total.fetch_add(bytes, Ordering::Relaxed);
        self.request_duration_sum_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_interruption(&self) {
        self.interruptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Average throughput in bytes per second
    ///
    /// Returns None while no measured segment took any time
    pub fn average_throughput(&self) -> Option<f64> {
        let total_bytes = self.loaded_bytes_total.load(Ordering::Relaxed);
        let total_ms = self.request_duration_sum_ms.load(Ordering::Relaxed);
        if total_ms == 0 {
            return None;
        }
        Some(total_bytes as f64 / (total_ms as f64 / 1000.0))
    }

    /// Init segment cache hit rate (0.0 to 1.0)
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    pub fn log_summary(&self) {
        let snapshot = self.snapshot();
        let avg_throughput = self
            .average_throughput()
            .map(format_bytes_per_sec)
            .unwrap_or_else(|| "N/A".to_string());

        info!(
            requests = snapshot.requests_total,
            segments_loaded = snapshot.segments_loaded,
            loaded_bytes = snapshot.loaded_bytes_total,
            avg_throughput = %avg_throughput,
            retries = snapshot.retries,
            failures = snapshot.failures,
            interruptions = snapshot.interruptions,
            cache_hits = snapshot.cache_hits,
            cache_misses = snapshot.cache_misses,
            cache_hit_rate = format!("{:.1}%", self.cache_hit_rate() * 100.0),
            "Segment scheduler network summary"
        );
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            segments_loaded: self.segments_loaded.load(Ordering::Relaxed),
            loaded_bytes_total: self.loaded_bytes_total.load(Ordering::Relaxed),
            request_duration_sum_ms: self.request_duration_sum_ms.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }
}

impl MetricsListener for NetworkMetrics {
    fn on_segment_metrics(&self, metrics: &SegmentNetworkMetrics) {
        self.record_segment_loaded(metrics.size, metrics.request_duration);
    }
}

/// A point-in-time copy of every counter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub segments_loaded: u64,
    pub loaded_bytes_total: u64,
    pub request_duration_sum_ms: u64,
    pub retries: u64,
    pub failures: u64,
    pub interruptions: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

fn format_bytes_per_sec(bytes_per_sec: f64) -> String {
    if bytes_per_sec >= 1_000_000_000.0 {
        format!("{:.2} GB/s", bytes_per_sec / 1_000_000_000.0)
    } else if bytes_per_sec >= 1_000_000.0 {
        format!("{:.2} MB/s", bytes_per_sec / 1_000_000.0)
    } else if bytes_per_sec >= 1_000.0 {
        format!("{:.2} KB/s", bytes_per_sec / 1_000.0)
    } else {
        format!("{:.2} B/s", bytes_per_sec)
    }
}
