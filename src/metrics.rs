use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

/// Sliding window of latency measurements
#[derive(Debug, Clone)]
pub struct PercentileTracker {
    measurements: VecDeque<u64>,
    window_size: usize,
}

impl PercentileTracker {
    /// Create a new percentile tracker with a specified window size
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            measurements: VecDeque::with_capacity(window_size),
            window_size,
        }
    }

    /// Record a measurement (in nanoseconds)
    pub fn record(&mut self, nanos: u64) {
        if self.measurements.len() >= self.window_size {
            self.measurements.pop_front();
        }
        self.measurements.push_back(nanos);
    }

    /// Percentile `p` (0.0-1.0) in microseconds
    pub fn percentile_us(&self, p: f64) -> f64 {
        if self.measurements.is_empty() {
            return 0.0;
        }

        let mut sorted: Vec<_> = self.measurements.iter().copied().collect();
        sorted.sort_unstable();

        let idx = ((sorted.len() as f64 * p).ceil() as usize).saturating_sub(1);
        sorted[idx.min(sorted.len() - 1)] as f64 / 1000.0
    }

    pub fn count(&self) -> usize {
        self.measurements.len()
    }

    pub fn clear(&mut self) {
        self.measurements.clear();
    }
}

#[derive(Debug)]
struct MetricsState {
    received: u64,
    emitted: u64,
    filtered: u64,
    dropped: u64,
    errors: u64,
    latency: PercentileTracker,
    since: Instant,
}

impl MetricsState {
    fn new() -> Self {
        Self {
            received: 0,
            emitted: 0,
            filtered: 0,
            dropped: 0,
            errors: 0,
            latency: PercentileTracker::new(1000),
            since: Instant::now(),
        }
    }
}

/// Per-stage counters, shared between a stage's data path and whoever
/// observes it. All fields sit behind a single lock: a snapshot is never
/// torn, and a clear is ordered against every increment.
#[derive(Debug, Clone)]
pub struct StageMetrics {
    state: Arc<Mutex<MetricsState>>,
}

impl StageMetrics {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MetricsState::new())),
        }
    }

    /// An item taken from an input queue
    pub fn record_received(&self) {
        let mut state = self.state.lock();
        state.received = state.received.saturating_add(1);
    }

    /// An item placed on the output queue, or consumed by a sink
    pub fn record_emitted(&self) {
        let mut state = self.state.lock();
        state.emitted = state.emitted.saturating_add(1);
    }

    /// An item a transform chose not to forward
    pub fn record_filtered(&self) {
        let mut state = self.state.lock();
        state.filtered = state.filtered.saturating_add(1);
    }

    /// An item abandoned during shutdown or refused by the output queue
    pub fn record_dropped(&self) {
        let mut state = self.state.lock();
        state.dropped = state.dropped.saturating_add(1);
    }

    pub fn record_error(&self) {
        let mut state = self.state.lock();
        state.errors = state.errors.saturating_add(1);
    }

    /// Record a latency measurement in nanoseconds
    pub fn record_latency(&self, nanos: u64) {
        self.state.lock().latency.record(nanos);
    }

    pub fn total_received(&self) -> u64 {
        self.state.lock().received
    }

    pub fn total_emitted(&self) -> u64 {
        self.state.lock().emitted
    }

    pub fn total_errors(&self) -> u64 {
        self.state.lock().errors
    }

    /// Reset every counter and the latency window to the zero baseline
    pub fn clear(&self) {
        *self.state.lock() = MetricsState::new();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.lock();
        let elapsed_secs = state.since.elapsed().as_secs_f64();
        let throughput_mps = if elapsed_secs == 0.0 {
            0.0
        } else {
            state.emitted as f64 / elapsed_secs
        };
        MetricsSnapshot {
            received: state.received,
            emitted: state.emitted,
            filtered: state.filtered,
            dropped: state.dropped,
            errors: state.errors,
            throughput_mps,
            latency_p50_us: state.latency.percentile_us(0.50),
            latency_p95_us: state.latency.percentile_us(0.95),
            latency_p99_us: state.latency.percentile_us(0.99),
            elapsed_secs,
        }
    }
}

impl Default for StageMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub received: u64,
    pub emitted: u64,
    pub filtered: u64,
    pub dropped: u64,
    pub errors: u64,
    pub throughput_mps: f64,
    pub latency_p50_us: f64,
    pub latency_p95_us: f64,
    pub latency_p99_us: f64,
    /// Seconds since creation or the last clear
    pub elapsed_secs: f64,
}

impl MetricsSnapshot {
    /// Format metrics as a human-readable string
    pub fn format(&self) -> String {
        format!(
            "Received: {}, Emitted: {}, Filtered: {}, Dropped: {}, Errors: {}, \
             Throughput: {:.2} msg/s, Latency P50: {:.2}µs, P95: {:.2}µs, P99: {:.2}µs, Elapsed: {:.2}s",
            self.received,
            self.emitted,
            self.filtered,
            self.dropped,
            self.errors,
            self.throughput_mps,
            self.latency_p50_us,
            self.latency_p95_us,
            self.latency_p99_us,
            self.elapsed_secs
        )
    }
}
