//! Process-wide metrics.
//!
//! Lock-free atomics with a single-writer, multiple-reader pattern. Counters
//! only move forward; the snapshot is taken for the health surface.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Global metrics instance.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    // Watcher counters
    pub captures_detected: AtomicU64,
    pub captures_queued: AtomicU64,
    pub captures_dropped: AtomicU64,
    /// Cumulative detection time (us) for averaging.
    pub detection_time_us: AtomicU64,
    /// Set when a detection exceeded the soft budget.
    pub detection_deferral: AtomicBool,

    // Queue counters
    pub jobs_dispatched: AtomicU64,
    pub jobs_completed: AtomicU64,
    pub jobs_failed: AtomicU64,
    pub jobs_retried: AtomicU64,

    // Inference counters
    pub inference_primary: AtomicU64,
    pub inference_fallback: AtomicU64,
    pub inference_retries: AtomicU64,

    // Webhook counters
    pub webhooks_delivered: AtomicU64,
    pub webhooks_rejected: AtomicU64,

    // Error counters
    pub db_errors: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            captures_detected: AtomicU64::new(0),
            captures_queued: AtomicU64::new(0),
            captures_dropped: AtomicU64::new(0),
            detection_time_us: AtomicU64::new(0),
            detection_deferral: AtomicBool::new(false),
            jobs_dispatched: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_retried: AtomicU64::new(0),
            inference_primary: AtomicU64::new(0),
            inference_fallback: AtomicU64::new(0),
            inference_retries: AtomicU64::new(0),
            webhooks_delivered: AtomicU64::new(0),
            webhooks_rejected: AtomicU64::new(0),
            db_errors: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record_detection(&self, elapsed_us: u64) {
        self.captures_detected.fetch_add(1, Ordering::Relaxed);
        self.detection_time_us.fetch_add(elapsed_us, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Rolling average detection time in microseconds.
    pub fn avg_detection_us(&self) -> u64 {
        let detected = self.captures_detected.load(Ordering::Relaxed);
        if detected == 0 {
            return 0;
        }
        self.detection_time_us.load(Ordering::Relaxed) / detected
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            captures_detected: self.captures_detected.load(Ordering::Relaxed),
            captures_queued: self.captures_queued.load(Ordering::Relaxed),
            captures_dropped: self.captures_dropped.load(Ordering::Relaxed),
            avg_detection_us: self.avg_detection_us(),
            detection_deferral: self.detection_deferral.load(Ordering::Relaxed),
            jobs_dispatched: self.jobs_dispatched.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_retried: self.jobs_retried.load(Ordering::Relaxed),
            inference_primary: self.inference_primary.load(Ordering::Relaxed),
            inference_fallback: self.inference_fallback.load(Ordering::Relaxed),
            webhooks_delivered: self.webhooks_delivered.load(Ordering::Relaxed),
            webhooks_rejected: self.webhooks_rejected.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub captures_detected: u64,
    pub captures_queued: u64,
    pub captures_dropped: u64,
    pub avg_detection_us: u64,
    pub detection_deferral: bool,
    pub jobs_dispatched: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    pub inference_primary: u64,
    pub inference_fallback: u64,
    pub webhooks_delivered: u64,
    pub webhooks_rejected: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn avg_detection_handles_zero() {
        let metrics = Metrics::new();
        assert_eq!(metrics.avg_detection_us(), 0);
        metrics.record_detection(900);
        metrics.record_detection(1100);
        assert_eq!(metrics.avg_detection_us(), 1000);
    }
}
