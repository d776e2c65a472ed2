//! Runs one Job: acquire a credential, call the generator, store the image.
//!
//! Quota and transient failures are retried exactly once on a freshly
//! acquired credential, preferring one other than the credential that
//! failed. Invalid-credential and rejected-prompt failures are final.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::credentials::{CredentialId, CredentialLease, CredentialOutcome, CredentialPool};
use crate::error::ErrorCode;
use crate::generation::{GenerationError, GenerationRequest, ImageGenerator, ImageInput};
use crate::metrics::MetricsCollector;
use crate::storage::BlobStore;
use crate::tasks::{TaskId, TaskResult};

/// Attempts per Job: the first call plus one retry.
const MAX_ATTEMPTS: usize = 2;

/// Everything a Job needs from its Task.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub task_id: TaskId,
    pub prompt_index: usize,
    pub prompt: String,
    pub reference_image: Option<ImageInput>,
    pub context_text: Option<String>,
    /// Most recent successful artifact of a character-synced Task.
    pub previous_image: Option<ImageInput>,
}

impl JobContext {
    fn request(&self) -> GenerationRequest {
        GenerationRequest::new(self.prompt.clone())
            .with_reference_image(self.reference_image.clone())
            .with_context_text(self.context_text.clone())
            .with_previous_image(self.previous_image.clone())
    }
}

/// How a Job ended.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The Job resolved into a Result.
    Completed(TaskResult),
    /// The run was cancelled before the Job resolved.
    Cancelled,
}

enum Attempt {
    Generated(Vec<u8>),
    Failed(GenerationError),
    Cancelled,
}

/// Drives single Jobs to a Result.
#[derive(Clone)]
pub struct JobDispatcher {
    pool: Arc<CredentialPool>,
    generator: Arc<dyn ImageGenerator>,
    blobs: Arc<dyn BlobStore>,
    metrics: MetricsCollector,
}

impl JobDispatcher {
    pub fn new(
        pool: Arc<CredentialPool>,
        generator: Arc<dyn ImageGenerator>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            pool,
            generator,
            blobs,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    /// Runs one Job. Never fails: every error becomes a failure Result.
    pub async fn run_job(&self, job: &JobContext, cancel: &CancellationToken) -> DispatchOutcome {
        self.metrics.job_started();
        let started = Instant::now();
        let outcome = self.dispatch(job, cancel).await;
        self.metrics.job_finished();

        let label = match &outcome {
            DispatchOutcome::Completed(result) if result.is_success() => "success",
            DispatchOutcome::Completed(_) => "failure",
            DispatchOutcome::Cancelled => "cancelled",
        };
        self.metrics
            .record_job(label, started.elapsed().as_secs_f64());
        outcome
    }

    async fn dispatch(&self, job: &JobContext, cancel: &CancellationToken) -> DispatchOutcome {
        let request = job.request();
        let mut failed: Option<(CredentialId, String, GenerationError)> = None;

        for attempt in 1..=MAX_ATTEMPTS {
            if cancel.is_cancelled() {
                return DispatchOutcome::Cancelled;
            }

            let avoid = failed.as_ref().map(|(id, _, _)| *id);
            let lease = match self.pool.acquire_avoiding(avoid) {
                Ok(lease) => lease,
                Err(e) => {
                    warn!(
                        task_id = %job.task_id,
                        prompt_index = job.prompt_index,
                        attempt,
                        "No credential available"
                    );
                    let message = match &failed {
                        Some((_, _, first)) => format!("{}; retry not possible: {}", first, e),
                        None => e.to_string(),
                    };
                    return DispatchOutcome::Completed(TaskResult::failure(
                        job.prompt_index,
                        &job.prompt,
                        ErrorCode::NoCredentialAvailable,
                        message,
                        failed.map(|(_, suffix, _)| suffix),
                    ));
                }
            };

            debug!(
                task_id = %job.task_id,
                prompt_index = job.prompt_index,
                credential = %lease.suffix,
                attempt,
                "Dispatching job"
            );

            match self.attempt(&lease, &request, cancel).await {
                Attempt::Cancelled => {
                    info!(
                        task_id = %job.task_id,
                        prompt_index = job.prompt_index,
                        "Job abandoned on cancellation"
                    );
                    return DispatchOutcome::Cancelled;
                }
                Attempt::Generated(bytes) => {
                    self.report(&lease, CredentialOutcome::Success);
                    return DispatchOutcome::Completed(self.store_artifact(job, &lease, bytes).await);
                }
                Attempt::Failed(error) => {
                    let class = error.classify();
                    if let Some(outcome) = class.pool_outcome() {
                        self.report(&lease, outcome);
                    }
                    warn!(
                        task_id = %job.task_id,
                        prompt_index = job.prompt_index,
                        credential = %lease.suffix,
                        attempt,
                        error = %error,
                        "Generation failed"
                    );

                    if !class.is_retryable() || attempt == MAX_ATTEMPTS {
                        return DispatchOutcome::Completed(TaskResult::failure(
                            job.prompt_index,
                            &job.prompt,
                            class.into(),
                            error.to_string(),
                            Some(lease.suffix.clone()),
                        ));
                    }
                    failed = Some((lease.id, lease.suffix.clone(), error));
                }
            }
        }

        // Unreachable: the last attempt always returns above
        DispatchOutcome::Cancelled
    }

    async fn attempt(
        &self,
        lease: &CredentialLease,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Attempt {
        tokio::select! {
            _ = cancel.cancelled() => Attempt::Cancelled,
            result = self.generator.generate(lease.secret(), request) => match result {
                Ok(bytes) => Attempt::Generated(bytes),
                Err(e) => Attempt::Failed(e),
            },
        }
    }

    async fn store_artifact(
        &self,
        job: &JobContext,
        lease: &CredentialLease,
        bytes: Vec<u8>,
    ) -> TaskResult {
        match self.blobs.put(&bytes).await {
            Ok(handle) => {
                info!(
                    task_id = %job.task_id,
                    prompt_index = job.prompt_index,
                    credential = %lease.suffix,
                    artifact = %handle,
                    "Job succeeded"
                );
                TaskResult::success(job.prompt_index, &job.prompt, handle, lease.suffix.clone())
            }
            Err(e) => {
                warn!(
                    task_id = %job.task_id,
                    prompt_index = job.prompt_index,
                    error = %e,
                    "Failed to store artifact"
                );
                TaskResult::failure(
                    job.prompt_index,
                    &job.prompt,
                    ErrorCode::StorageFailure,
                    e.to_string(),
                    Some(lease.suffix.clone()),
                )
            }
        }
    }

    fn report(&self, lease: &CredentialLease, outcome: CredentialOutcome) {
        // The credential may have been removed while the call was in flight
        if let Err(e) = self.pool.report_outcome(lease.id, outcome) {
            debug!(credential = %lease.suffix, error = %e, "Outcome not recorded");
        }
    }
}
