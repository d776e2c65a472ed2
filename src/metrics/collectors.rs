//! High-level recording interface over the raw Prometheus metrics.

use super::prometheus::{
    CREDENTIAL_EVENTS_TOTAL, GENERATION_LATENCY, JOBS_IN_PROGRESS, JOBS_TOTAL, QUEUE_DEPTH,
    TASKS_FINISHED_TOTAL,
};

/// Metrics collector for recording orchestration metrics.
///
/// Every method is safe to call before `init_metrics()`; nothing is recorded
/// in that case.
///
/// # Example
///
/// ```ignore
/// use image_forge::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_job("success", 3.2);
/// collector.record_task_finished("partial");
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a resolved Job and, for generated ones, the call latency.
    ///
    /// # Arguments
    ///
    /// * `outcome` - `success`, `failure` or `cancelled`
    /// * `latency_secs` - Time spent in external calls for this Job
    pub fn record_job(&self, outcome: &str, latency_secs: f64) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total.with_label_values(&[outcome]).inc();
        }

        if latency_secs > 0.0 {
            if let Some(latency) = GENERATION_LATENCY.get() {
                latency.observe(latency_secs);
            }
        }

        tracing::trace!(
            outcome = outcome,
            latency_secs = latency_secs,
            "Recorded job metric"
        );
    }

    /// Record a credential pool event.
    pub fn record_credential_event(&self, event: &str) {
        if let Some(events) = CREDENTIAL_EVENTS_TOTAL.get() {
            events.with_label_values(&[event]).inc();
        }
    }

    /// Record a Task reaching a terminal status.
    pub fn record_task_finished(&self, status: &str) {
        if let Some(finished) = TASKS_FINISHED_TOTAL.get() {
            finished.with_label_values(&[status]).inc();
        }

        tracing::trace!(status = status, "Recorded task completion metric");
    }

    /// Update the queue depth gauge.
    pub fn set_queue_depth(&self, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.set(depth as f64);
        }
    }

    /// Mark a Job as started.
    pub fn job_started(&self) {
        if let Some(in_progress) = JOBS_IN_PROGRESS.get() {
            in_progress.inc();
        }
    }

    /// Mark a Job as no longer in progress.
    pub fn job_finished(&self) {
        if let Some(in_progress) = JOBS_IN_PROGRESS.get() {
            in_progress.dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::prometheus::init_metrics;

    #[test]
    fn test_recording_before_init_is_noop() {
        // Must not panic regardless of initialization order
        let collector = MetricsCollector::new();
        collector.record_job("failure", 0.0);
        collector.record_credential_event("acquired");
        collector.set_queue_depth(0);
    }

    #[test]
    fn test_record_task_finished() {
        let _ = init_metrics();
        let collector = MetricsCollector::new();
        collector.record_task_finished("completed");

        let finished = TASKS_FINISHED_TOTAL.get().expect("metrics initialized");
        assert!(finished.with_label_values(&["completed"]).get() >= 1.0);
    }

    #[test]
    fn test_job_gauge() {
        let _ = init_metrics();
        let collector = MetricsCollector::new();
        collector.job_started();
        collector.job_finished();
        collector.set_queue_depth(3);

        let depth = QUEUE_DEPTH.get().expect("metrics initialized");
        assert!(depth.get() >= 0.0);
    }
}
