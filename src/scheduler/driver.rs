//! Background driver loop that drains the Queue one Task at a time.
//!
//! The driver is the only writer of Task counters: Jobs may run
//! concurrently, but their Results are collected here in prompt order and
//! appended one by one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::dispatcher::{DispatchOutcome, JobContext, JobDispatcher};
use super::queue::{QueueScheduler, RunHandle};
use crate::config::ForgeConfig;
use crate::generation::{ImageFormat, ImageInput};
use crate::metrics::MetricsCollector;
use crate::storage::BlobHandle;
use crate::tasks::{Task, TaskError, TaskId, TaskResult, TaskStore};

/// Pacing and concurrency knobs for the driver.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub max_parallel_jobs: usize,
    /// Delay before each Job after the first of a run.
    pub job_interval: Duration,
    /// Safety tick while waiting for work.
    pub idle_poll_interval: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self::from(&ForgeConfig::default())
    }
}

impl From<&ForgeConfig> for DriverConfig {
    fn from(config: &ForgeConfig) -> Self {
        Self {
            max_parallel_jobs: config.max_parallel_jobs.max(1),
            job_interval: config.job_interval,
            idle_poll_interval: config.idle_poll_interval,
        }
    }
}

/// Drains the Queue, running each Task's Jobs through the dispatcher.
pub struct Driver {
    scheduler: Arc<QueueScheduler>,
    store: Arc<TaskStore>,
    dispatcher: JobDispatcher,
    config: DriverConfig,
    running: Arc<AtomicBool>,
    metrics: MetricsCollector,
}

impl Driver {
    pub fn new(
        scheduler: Arc<QueueScheduler>,
        dispatcher: JobDispatcher,
        config: DriverConfig,
    ) -> Self {
        Self {
            store: Arc::clone(scheduler.store()),
            scheduler,
            dispatcher,
            config,
            running: Arc::new(AtomicBool::new(false)),
            metrics: MetricsCollector::new(),
        }
    }

    /// Flag that reads `true` while the loop is alive.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Runs until the scheduler shuts down.
    pub async fn run(self) {
        let shutdown = self.scheduler.shutdown_token();
        self.running.store(true, Ordering::SeqCst);
        info!(
            max_parallel_jobs = self.config.max_parallel_jobs,
            "Queue driver started"
        );

        while !shutdown.is_cancelled() {
            // Queued Tasks wait for a first credential instead of failing
            if self.dispatcher.pool().is_empty() {
                debug!("No credentials registered, holding the queue");
            } else {
                match self.scheduler.next_run() {
                    Ok(Some(run)) => {
                        self.run_task(run).await;
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Failed to activate next task"),
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.scheduler.notified() => {}
                _ = tokio::time::sleep(self.config.idle_poll_interval) => {}
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("Queue driver stopped");
    }

    async fn run_task(&self, run: RunHandle) {
        let id = run.task_id;
        let task = match self.store.get(id) {
            Ok(task) => task,
            Err(e) => {
                debug!(task_id = %id, error = %e, "Task vanished before its run");
                self.scheduler.finish_run(id);
                return;
            }
        };

        let start = task.next_unresolved_index();
        info!(
            task_id = %id,
            name = %task.name,
            total = task.counts.total,
            resume_from = start,
            character_sync = task.character_sync,
            "Task run started"
        );

        let reference = self.load_reference(&task).await;
        // Local token so a failed append can stop sibling Jobs without
        // touching the scheduler's run token
        let jobs = run.token.child_token();
        if task.character_sync {
            self.run_sequential(&task, start, reference, &jobs).await;
        } else {
            self.run_concurrent(&task, start, reference, &jobs).await;
        }

        self.finish(id);
        self.scheduler.finish_run(id);
    }

    fn finish(&self, id: TaskId) {
        let remaining = match self.store.get(id) {
            Ok(task) => task.counts.remaining(),
            Err(_) => {
                info!(task_id = %id, "Task deleted during its run");
                return;
            }
        };

        if self.scheduler.is_shutdown() && remaining > 0 {
            info!(task_id = %id, remaining, "Run interrupted by shutdown; task left for recovery");
            return;
        }

        match self.store.finalize(id) {
            Ok(status) => {
                self.metrics.record_task_finished(status.as_str());
                info!(task_id = %id, status = %status, "Task finished");
            }
            Err(TaskError::NotFound(_)) => info!(task_id = %id, "Task deleted during its run"),
            Err(e) => warn!(task_id = %id, error = %e, "Failed to finalize task"),
        }
    }

    async fn load_reference(&self, task: &Task) -> Option<ImageInput> {
        let handle = task.reference_image.as_ref()?;
        self.load_image(task.id, handle).await
    }

    async fn load_image(&self, task_id: TaskId, handle: &BlobHandle) -> Option<ImageInput> {
        match self.dispatcher.blobs().get(handle).await {
            Ok(bytes) => {
                let fallback = handle.format().unwrap_or(ImageFormat::Png);
                Some(ImageInput::detect(bytes, fallback))
            }
            Err(e) => {
                warn!(task_id = %task_id, handle = %handle, error = %e, "Image unavailable, continuing without it");
                None
            }
        }
    }

    fn job(&self, task: &Task, index: usize, reference: &Option<ImageInput>) -> JobContext {
        JobContext {
            task_id: task.id,
            prompt_index: index,
            prompt: task.prompts[index].clone(),
            reference_image: reference.clone(),
            context_text: task.character_context.clone(),
            previous_image: None,
        }
    }

    /// Waits out the pacing interval. Returns `false` if cancelled meanwhile.
    async fn pace(interval: Duration, cancel: &CancellationToken) -> bool {
        if interval.is_zero() {
            return !cancel.is_cancelled();
        }
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(interval) => true,
        }
    }

    /// Character-synced Tasks: strictly one Job at a time, in prompt order,
    /// each fed the most recent successful artifact.
    async fn run_sequential(
        &self,
        task: &Task,
        start: usize,
        reference: Option<ImageInput>,
        cancel: &CancellationToken,
    ) {
        let mut last_artifact = task.last_successful_artifact().cloned();

        for index in start..task.prompts.len() {
            if index > start && !Self::pace(self.config.job_interval, cancel).await {
                break;
            }
            if cancel.is_cancelled() {
                break;
            }

            let mut job = self.job(task, index, &reference);
            if let Some(handle) = &last_artifact {
                job.previous_image = self.load_image(task.id, handle).await;
            }

            match self.dispatcher.run_job(&job, cancel).await {
                DispatchOutcome::Completed(result) => {
                    let artifact = result.artifact.clone();
                    if !self.record(task.id, result).await {
                        cancel.cancel();
                        break;
                    }
                    if artifact.is_some() {
                        last_artifact = artifact;
                    }
                }
                DispatchOutcome::Cancelled => break,
            }
        }
    }

    /// Independent prompts: bounded concurrency, Results recorded in order.
    async fn run_concurrent(
        &self,
        task: &Task,
        start: usize,
        reference: Option<ImageInput>,
        cancel: &CancellationToken,
    ) {
        let width = self
            .config
            .max_parallel_jobs
            .min(self.dispatcher.pool().available_count())
            .max(1);
        debug!(task_id = %task.id, width, "Dispatching jobs concurrently");

        let interval = self.config.job_interval;
        let jobs = (start..task.prompts.len()).map(|index| {
            let job = self.job(task, index, &reference);
            async move {
                if index > start && !Self::pace(interval, cancel).await {
                    return DispatchOutcome::Cancelled;
                }
                self.dispatcher.run_job(&job, cancel).await
            }
        });
        let mut outcomes = stream::iter(jobs).buffered(width);

        let mut stopped = false;
        while let Some(outcome) = outcomes.next().await {
            match outcome {
                DispatchOutcome::Completed(result) if !stopped => {
                    if !self.record(task.id, result).await {
                        stopped = true;
                        cancel.cancel();
                    }
                }
                DispatchOutcome::Completed(result) => self.discard(task.id, result).await,
                DispatchOutcome::Cancelled => {
                    stopped = true;
                }
            }
        }
    }

    /// Appends a Result. Returns `false` if the run must stop.
    async fn record(&self, task_id: TaskId, result: TaskResult) -> bool {
        let artifact = result.artifact.clone();
        let prompt_index = result.prompt_index;
        match self.store.append_result(task_id, result) {
            Ok(counts) => {
                debug!(
                    task_id = %task_id,
                    prompt_index,
                    completed = counts.completed,
                    failed = counts.failed,
                    total = counts.total,
                    "Result recorded"
                );
                true
            }
            Err(e) => {
                match e {
                    TaskError::NotFound(_) => debug!(task_id = %task_id, "Task deleted mid-run"),
                    ref other => warn!(task_id = %task_id, error = %other, "Failed to record result"),
                }
                if let Some(handle) = artifact {
                    self.delete_artifact(task_id, &handle).await;
                }
                false
            }
        }
    }

    /// Drops a Result produced after the run stopped.
    async fn discard(&self, task_id: TaskId, result: TaskResult) {
        if let Some(handle) = result.artifact {
            self.delete_artifact(task_id, &handle).await;
        }
    }

    async fn delete_artifact(&self, task_id: TaskId, handle: &BlobHandle) {
        if let Err(e) = self.dispatcher.blobs().delete(handle).await {
            warn!(task_id = %task_id, handle = %handle, error = %e, "Failed to delete orphaned artifact");
        }
    }
}
