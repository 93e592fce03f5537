use std::sync::atomic::{AtomicBool, Ordering};

/// Watermark-based flow control for sources.
/// When the output queue's utilization reaches the high watermark the
/// source stops producing, and resumes once it falls to the low watermark.
/// Queue length is advisory, so this is a heuristic and never a
/// correctness mechanism.
#[derive(Debug)]
pub struct BackpressureController {
    /// High watermark: threshold at which backpressure is triggered (percentage)
    high_watermark: u32,
    /// Low watermark: threshold at which backpressure is released (percentage)
    low_watermark: u32,
    is_active: AtomicBool,
}

impl BackpressureController {
    /// Create a new backpressure controller
    /// Default: high=80%, low=40%
    pub fn new() -> Self {
        Self::with_watermarks(80, 40)
    }

    /// Set custom watermark thresholds
    pub fn with_watermarks(high: u32, low: u32) -> Self {
        let high = high.min(100);
        Self {
            high_watermark: high,
            low_watermark: low.min(high),
            is_active: AtomicBool::new(false),
        }
    }

    /// Update state from the current utilization of a queue.
    /// Unbounded queues (`None`) never trigger backpressure.
    /// Returns true if backpressure is now active.
    pub fn check_and_update(&self, utilization: Option<u32>) -> bool {
        let Some(utilization) = utilization else {
            self.is_active.store(false, Ordering::Relaxed);
            return false;
        };
        let was_active = self.is_active.load(Ordering::Relaxed);

        let is_now_active = if was_active {
            utilization > self.low_watermark
        } else {
            utilization >= self.high_watermark
        };

        if is_now_active != was_active {
            self.is_active.store(is_now_active, Ordering::Relaxed);
            tracing::trace!(utilization, active = is_now_active, "backpressure changed");
        }

        is_now_active
    }

    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::Relaxed)
    }
}

impl Default for BackpressureController {
    fn default() -> Self {
        Self::new()
    }
}
