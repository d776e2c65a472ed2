//! Prometheus metric definitions and registry management.
//!
//! Metrics live in process-wide `OnceLock` statics; recording through
//! [`super::MetricsCollector`] is a no-op until [`init_metrics`] has run.

use prometheus::{CounterVec, Encoder, Gauge, Histogram, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all image-forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Jobs resolved, labelled by outcome (`success`, `failure`, `cancelled`).
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Latency of external generation calls.
pub static GENERATION_LATENCY: OnceLock<Histogram> = OnceLock::new();

/// Credential health events (`acquired`, `exhausted`, `invalid`, `transient`, `pool_exhausted`).
pub static CREDENTIAL_EVENTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Tasks reaching a terminal status, labelled by status.
pub static TASKS_FINISHED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Number of Tasks waiting in the Queue.
pub static QUEUE_DEPTH: OnceLock<Gauge> = OnceLock::new();

/// Number of Jobs currently talking to the external service.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Calling this more than once is harmless: later calls build a fresh
/// registry but the statics keep the first one.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Job metrics
    let jobs_total = CounterVec::new(
        Opts::new("image_forge_jobs_total", "Total number of jobs resolved"),
        &["outcome"],
    )?;

    let generation_latency = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "image_forge_generation_latency_seconds",
            "External image generation latency in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]),
    )?;

    let jobs_in_progress = Gauge::new(
        "image_forge_jobs_in_progress",
        "Number of jobs currently being generated",
    )?;

    // Credential metrics
    let credential_events_total = CounterVec::new(
        Opts::new(
            "image_forge_credential_events_total",
            "Credential pool events by kind",
        ),
        &["event"],
    )?;

    // Task and queue metrics
    let tasks_finished_total = CounterVec::new(
        Opts::new(
            "image_forge_tasks_finished_total",
            "Tasks reaching a terminal status",
        ),
        &["status"],
    )?;

    let queue_depth = Gauge::new("image_forge_queue_depth", "Number of tasks in the queue")?;

    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(generation_latency.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(credential_events_total.clone()))?;
    registry.register(Box::new(tasks_finished_total.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = GENERATION_LATENCY.set(generation_latency);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = CREDENTIAL_EVENTS_TOTAL.set(credential_events_total);
    let _ = TASKS_FINISHED_TOTAL.set(tasks_finished_total);
    let _ = QUEUE_DEPTH.set(queue_depth);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line instead when the registry has not
/// been initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
