use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Failure-accounting counters for the alert pipeline. Updated once per
/// refresh cycle and per enhancement attempt; read by the metrics endpoint.
#[derive(Debug, Default)]
pub struct ProcessingMetrics {
    total_raw_alerts: AtomicU64,
    filtered_alerts: AtomicU64,
    enhanced_alerts: AtomicU64,
    enhancement_failures: AtomicU64,
    processing_time_total_ms: AtomicU64,
    processing_cycles: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_raw_alerts: u64,
    pub filtered_alerts: u64,
    pub enhanced_alerts: u64,
    pub enhancement_failures: u64,
    pub avg_processing_time_ms: u64,
}

impl ProcessingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_raw_alerts(&self, count: u64) {
        self.total_raw_alerts.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_filtered_alerts(&self, count: u64) {
        self.filtered_alerts.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_enhancement_success(&self) {
        self.enhanced_alerts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_enhancement_failure(&self) {
        self.enhancement_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cycle_time(&self, elapsed_ms: u64) {
        self.processing_time_total_ms
            .fetch_add(elapsed_ms, Ordering::Relaxed);
        self.processing_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let cycles = self.processing_cycles.load(Ordering::Relaxed);
        let total_ms = self.processing_time_total_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            total_raw_alerts: self.total_raw_alerts.load(Ordering::Relaxed),
            filtered_alerts: self.filtered_alerts.load(Ordering::Relaxed),
            enhanced_alerts: self.enhanced_alerts.load(Ordering::Relaxed),
            enhancement_failures: self.enhancement_failures.load(Ordering::Relaxed),
            avg_processing_time_ms: if cycles == 0 { 0 } else { total_ms / cycles },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_average() {
        let metrics = ProcessingMetrics::new();
        metrics.record_raw_alerts(10);
        metrics.record_filtered_alerts(4);
        metrics.record_enhancement_success();
        metrics.record_enhancement_success();
        metrics.record_enhancement_failure();
        metrics.record_cycle_time(100);
        metrics.record_cycle_time(300);

        let snap = metrics.snapshot();
        assert_eq!(snap.total_raw_alerts, 10);
        assert_eq!(snap.filtered_alerts, 4);
        assert_eq!(snap.enhanced_alerts, 2);
        assert_eq!(snap.enhancement_failures, 1);
        assert_eq!(snap.avg_processing_time_ms, 200);
    }

    #[test]
    fn empty_metrics_average_is_zero() {
        let snap = ProcessingMetrics::new().snapshot();
        assert_eq!(snap.avg_processing_time_ms, 0);
    }
}
