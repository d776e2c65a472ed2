//! Orchestration façade consumed by the client layer.
//!
//! [`OrchestrationService`] owns the credential pool, the Task store and the
//! queue scheduler, and wires them to the external collaborators. Queue,
//! status, credential and delete operations act on in-memory state and never
//! wait on a generation call. Character analysis and assisted splitting call
//! the describer or assistant directly, as does `create_task` when it
//! analyses a reference image.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use secrecy::SecretString;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ForgeConfig;
use crate::credentials::{
    CredentialFile, CredentialId, CredentialOutcome, CredentialPool, CredentialView, PoolError,
    PoolHealth, PoolPolicy,
};
use crate::error::{ForgeError, ForgeResult};
use crate::generation::{
    pattern_split, CharacterDescriber, GeminiClient, GenerationError, ImageFormat, ImageGenerator,
    ImageInput, PromptAssistant, SplitOutcome,
};
use crate::scheduler::{
    Driver, DriverConfig, JobDispatcher, QueueScheduler, QueueStatus, ScheduleError,
};
use crate::storage::{
    build_tar_gz, entry_name, ArchiveEntry, BlobHandle, BlobStore, FsBlobStore, StorageError,
};
use crate::tasks::{
    NewTask, SnapshotPersister, StatusCounts, Task, TaskId, TaskSnapshot, TaskStatus, TaskStore,
};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Reference-image extensions accepted on upload.
const ALLOWED_UPLOAD_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];

/// External capabilities the service delegates to.
#[derive(Clone)]
pub struct Collaborators {
    pub generator: Arc<dyn ImageGenerator>,
    pub describer: Arc<dyn CharacterDescriber>,
    pub assistant: Arc<dyn PromptAssistant>,
    pub blobs: Arc<dyn BlobStore>,
}

impl Collaborators {
    /// Gemini for all three capabilities, artifacts on the local filesystem.
    pub fn gemini(config: &ForgeConfig) -> Result<Self, GenerationError> {
        let client = Arc::new(GeminiClient::new(config)?);
        Ok(Self {
            generator: client.clone(),
            describer: client.clone(),
            assistant: client,
            blobs: Arc::new(FsBlobStore::new(config.artifact_dir.clone())),
        })
    }
}

/// Parameters of `create_task`.
#[derive(Debug, Clone, Default)]
pub struct CreateTaskRequest {
    pub name: String,
    pub prompts: Vec<String>,
    pub reference_image: Option<BlobHandle>,
    pub character_sync: bool,
    pub character_context: Option<String>,
    pub auto_start: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateTaskResponse {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub message: String,
}

/// Aggregate view for status polling.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub tasks: StatusCounts,
    pub pool: PoolHealth,
    pub driver_active: bool,
    pub queue: QueueStatus,
}

/// One generated image.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub handle: BlobHandle,
    pub bytes: Vec<u8>,
    pub mime_type: &'static str,
}

/// A Task's successful artifacts as one `.tar.gz`.
#[derive(Debug, Clone)]
pub struct TaskArchive {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub entries: usize,
}

#[derive(Default)]
struct Workers {
    driver: Option<JoinHandle<()>>,
    driver_running: Option<Arc<AtomicBool>>,
    persister: Option<(JoinHandle<()>, CancellationToken)>,
}

/// The façade.
pub struct OrchestrationService {
    config: ForgeConfig,
    pool: Arc<CredentialPool>,
    store: Arc<TaskStore>,
    scheduler: Arc<QueueScheduler>,
    dispatcher: JobDispatcher,
    describer: Arc<dyn CharacterDescriber>,
    assistant: Arc<dyn PromptAssistant>,
    blobs: Arc<dyn BlobStore>,
    workers: Mutex<Workers>,
}

impl OrchestrationService {
    /// Builds the service, restoring Tasks and credentials from the state
    /// files if configured.
    ///
    /// Tasks interrupted mid-run go back to the head of the Queue; queued
    /// Tasks follow in their original order.
    pub fn new(config: ForgeConfig, collaborators: Collaborators) -> ForgeResult<Self> {
        config.validate()?;

        let pool = Arc::new(CredentialPool::new(PoolPolicy::from(&config)));
        if let Some(path) = config.credential_file() {
            if let Some(file) = CredentialFile::read_from(&path)? {
                let restored = pool.restore(file.credentials);
                info!(path = %path.display(), credentials = restored, "Restored credentials");
            }
        }

        let store = match &config.state_file {
            Some(path) => match TaskSnapshot::read_from(path)? {
                Some(snapshot) => {
                    info!(path = %path.display(), tasks = snapshot.tasks.len(), "Restored task snapshot");
                    TaskStore::from_tasks(snapshot.tasks)
                }
                None => TaskStore::new(),
            },
            None => TaskStore::new(),
        };
        let store = Arc::new(store);

        let recovered = store.recover_interrupted();
        let scheduler = Arc::new(QueueScheduler::new(Arc::clone(&store)));
        if !recovered.is_empty() {
            info!(count = recovered.len(), "Re-queued recovered tasks");
            scheduler.restore(recovered);
        }

        let dispatcher = JobDispatcher::new(
            Arc::clone(&pool),
            collaborators.generator,
            Arc::clone(&collaborators.blobs),
        );

        Ok(Self {
            config,
            pool,
            store,
            scheduler,
            dispatcher,
            describer: collaborators.describer,
            assistant: collaborators.assistant,
            blobs: collaborators.blobs,
            workers: Mutex::new(Workers::default()),
        })
    }

    pub fn config(&self) -> &ForgeConfig {
        &self.config
    }

    fn workers(&self) -> std::sync::MutexGuard<'_, Workers> {
        self.workers.lock().expect("workers lock poisoned")
    }

    /// Spawns the driver loop and, with a state file, the snapshot persister.
    pub fn start(&self) -> ForgeResult<()> {
        let mut workers = self.workers();
        if workers.driver.is_some() {
            return Err(ForgeError::InvalidState(
                "service already started".to_string(),
            ));
        }
        if self.scheduler.is_shutdown() {
            return Err(ForgeError::InvalidState("service shut down".to_string()));
        }

        let driver = Driver::new(
            Arc::clone(&self.scheduler),
            self.dispatcher.clone(),
            DriverConfig::from(&self.config),
        );
        workers.driver_running = Some(driver.running_flag());
        workers.driver = Some(tokio::spawn(driver.run()));

        if let Some(path) = &self.config.state_file {
            let token = CancellationToken::new();
            let mut persister = SnapshotPersister::new(
                Arc::clone(&self.store),
                path.clone(),
                self.config.snapshot_interval,
            );
            if let Some(keys) = self.config.credential_file() {
                persister = persister.with_credentials(Arc::clone(&self.pool), keys);
            }
            workers.persister = Some((tokio::spawn(persister.run(token.clone())), token));
        }

        info!("Orchestration service started");
        Ok(())
    }

    /// Stops the driver, then writes the final Task snapshot and credential
    /// file if a state file is set.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown();
        let (driver, persister) = {
            let mut workers = self.workers();
            (workers.driver.take(), workers.persister.take())
        };

        if let Some(handle) = driver {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Driver task panicked during shutdown"),
                Err(_) => warn!(timeout = ?SHUTDOWN_TIMEOUT, "Driver did not stop in time"),
            }
        }
        match (persister, &self.config.state_file) {
            (Some((handle, token)), _) => {
                token.cancel();
                if let Err(e) = handle.await {
                    error!(error = %e, "Snapshot persister panicked during shutdown");
                }
            }
            (None, Some(path)) => {
                if let Err(e) = TaskSnapshot::capture(&self.store).write_to(path).await {
                    warn!(path = %path.display(), error = %e, "Failed to write final snapshot");
                }
                if let Some(keys) = self.config.credential_file() {
                    if let Err(e) = CredentialFile::capture(&self.pool).write_to(&keys).await {
                        warn!(path = %keys.display(), error = %e, "Failed to write credential file");
                    }
                }
            }
            (None, None) => {}
        }
        info!("Orchestration service stopped");
    }

    // Credentials

    pub fn list_credentials(&self) -> Vec<CredentialView> {
        self.pool.views()
    }

    pub fn add_credential(&self, secret: SecretString) -> ForgeResult<CredentialView> {
        let id = self.pool.register(secret)?;
        let view = self
            .pool
            .views()
            .into_iter()
            .find(|v| v.id == id)
            .ok_or_else(|| ForgeError::InvalidState("credential vanished after registration".to_string()))?;
        info!(credential = %view.suffix, "Credential added");
        // Tasks may be waiting for a first key
        self.scheduler.wake();
        Ok(view)
    }

    /// Removes the first credential with this display suffix.
    pub fn remove_credential(&self, suffix: &str) -> ForgeResult<CredentialView> {
        let view = self.pool.remove_by_suffix(suffix)?;
        info!(credential = %view.suffix, "Credential removed");
        Ok(view)
    }

    pub fn pool_health(&self) -> PoolHealth {
        self.pool.health()
    }

    // Tasks

    /// Creates a `pending` Task, optionally starting it right away.
    ///
    /// With `auto_start`, a busy system falls back to enqueueing the Task.
    pub async fn create_task(&self, request: CreateTaskRequest) -> ForgeResult<CreateTaskResponse> {
        let prompts: Vec<String> = request
            .prompts
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        if prompts.is_empty() {
            return Err(ForgeError::InvalidInput(
                "a task needs at least one prompt".to_string(),
            ));
        }
        if self.pool.is_empty() {
            return Err(PoolError::PoolExhausted.into());
        }
        if let Some(handle) = &request.reference_image {
            if !self.blobs.exists(handle).await? {
                return Err(StorageError::NotFound(handle.to_string()).into());
            }
        }

        let mut character_context = request
            .character_context
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        if request.character_sync && character_context.is_none() {
            if let Some(handle) = &request.reference_image {
                match self.analyze_character(handle).await {
                    Ok(description) => character_context = Some(description),
                    Err(e) => warn!(error = %e, "Character analysis failed; creating task without it"),
                }
            }
        }

        let name = match request.name.trim() {
            "" => format!("Batch {}", chrono::Utc::now().format("%Y-%m-%d %H:%M:%S")),
            name => name.to_string(),
        };
        let count = prompts.len();
        let task = Task::new(NewTask {
            name,
            prompts,
            reference_image: request.reference_image,
            character_context,
            character_sync: request.character_sync,
        });
        let id = self.store.insert(task);
        info!(task_id = %id, prompts = count, "Task created");

        if !request.auto_start {
            return Ok(CreateTaskResponse {
                task_id: id,
                status: TaskStatus::Pending,
                message: format!("Created task with {} prompt(s)", count),
            });
        }

        match self.scheduler.start_immediately(id) {
            Ok(()) => Ok(CreateTaskResponse {
                task_id: id,
                status: TaskStatus::Processing,
                message: format!("Created task with {} prompt(s) and started it", count),
            }),
            Err(ScheduleError::Busy { active }) => {
                let position = self.scheduler.enqueue(id)?;
                Ok(CreateTaskResponse {
                    task_id: id,
                    status: TaskStatus::Queued,
                    message: format!(
                        "Created task with {} prompt(s); task {} is running, queued at position {}",
                        count, active, position
                    ),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// All Tasks, newest first.
    pub fn list_tasks(&self) -> Vec<Task> {
        self.store.list()
    }

    pub fn get_task(&self, id: TaskId) -> ForgeResult<Task> {
        Ok(self.store.get(id)?)
    }

    pub fn system_status(&self) -> SystemStatus {
        let driver_active = self
            .workers()
            .driver_running
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst));
        SystemStatus {
            tasks: self.store.status_counts(),
            pool: self.pool.health(),
            driver_active,
            queue: self.scheduler.status(),
        }
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.scheduler.status()
    }

    pub fn start_task(&self, id: TaskId) -> ForgeResult<()> {
        Ok(self.scheduler.start_immediately(id)?)
    }

    /// Returns the Task's 1-based position in the Queue.
    pub fn enqueue_task(&self, id: TaskId) -> ForgeResult<usize> {
        Ok(self.scheduler.enqueue(id)?)
    }

    pub fn dequeue_task(&self, id: TaskId) -> ForgeResult<()> {
        Ok(self.scheduler.dequeue(id)?)
    }

    /// Aborts a `processing` Task. Results produced so far are kept.
    pub fn cancel_task(&self, id: TaskId) -> ForgeResult<()> {
        Ok(self.scheduler.cancel(id)?)
    }

    /// Deletes a Task in any status together with its generated artifacts.
    ///
    /// The reference image is kept since other Tasks may share it.
    pub async fn delete_task(&self, id: TaskId) -> ForgeResult<Task> {
        let task = self.scheduler.forget(id)?;
        let mut deleted = 0usize;
        for (_, _, handle) in task.artifacts() {
            match self.blobs.delete(handle).await {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(e) => warn!(task_id = %id, handle = %handle, error = %e, "Failed to delete artifact"),
            }
        }
        info!(task_id = %id, artifacts = deleted, "Task deleted");
        Ok(task)
    }

    // Images and text

    /// Stores an uploaded reference image after checking its extension.
    pub async fn upload_reference_image(&self, file_name: &str, bytes: &[u8]) -> ForgeResult<BlobHandle> {
        let extension = file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        if !ALLOWED_UPLOAD_EXTENSIONS.contains(&extension.as_str()) {
            return Err(ForgeError::InvalidInput(format!(
                "unsupported image type '{}', expected one of {}",
                file_name,
                ALLOWED_UPLOAD_EXTENSIONS.join(", ")
            )));
        }
        if bytes.is_empty() {
            return Err(ForgeError::InvalidInput("uploaded image is empty".to_string()));
        }

        let handle = self.blobs.put(bytes).await?;
        info!(handle = %handle, size = bytes.len(), "Reference image uploaded");
        Ok(handle)
    }

    /// Describes the character in a stored image with a pooled credential.
    pub async fn analyze_character(&self, handle: &BlobHandle) -> ForgeResult<String> {
        let bytes = self.blobs.get(handle).await?;
        let image = ImageInput::detect(bytes, handle.format().unwrap_or(ImageFormat::Png));

        let lease = self.pool.acquire()?;
        let result = self.describer.describe(lease.secret(), &image).await;
        self.report_call(&lease.id, &result);
        let description = result?;
        info!(handle = %handle, credential = %lease.suffix, "Character analysed");
        Ok(description)
    }

    /// Splits free text into prompts, locally or with the text model.
    pub async fn split_prompts(&self, text: &str, use_assist: bool) -> ForgeResult<SplitOutcome> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ForgeError::InvalidInput("text to split is empty".to_string()));
        }
        if !use_assist {
            return Ok(pattern_split(text));
        }

        let lease = self.pool.acquire()?;
        let result = self.assistant.split_prompts(lease.secret(), text).await;
        self.report_call(&lease.id, &result);
        let outcome = result?;
        if outcome.prompts.is_empty() {
            return Err(ForgeError::InvalidInput(
                "assistant found no prompts in the text".to_string(),
            ));
        }
        Ok(outcome)
    }

    fn report_call<T>(&self, id: &CredentialId, result: &Result<T, GenerationError>) {
        let outcome = match result {
            Ok(_) => Some(CredentialOutcome::Success),
            Err(e) => e.classify().pool_outcome(),
        };
        if let Some(outcome) = outcome {
            if let Err(e) = self.pool.report_outcome(*id, outcome) {
                warn!(error = %e, "Outcome not recorded");
            }
        }
    }

    // Artifacts

    /// Reads one artifact of a Task by prompt index.
    pub async fn fetch_artifact(&self, id: TaskId, prompt_index: usize) -> ForgeResult<Artifact> {
        let task = self.store.get(id)?;
        let handle = task
            .results
            .get(prompt_index)
            .and_then(|r| r.artifact.clone())
            .ok_or_else(|| {
                StorageError::NotFound(format!("task {} prompt {}", id, prompt_index))
            })?;
        let bytes = self.blobs.get(&handle).await?;
        let mime_type = ImageFormat::sniff(&bytes)
            .or_else(|| handle.format())
            .map(|f| f.mime_type())
            .unwrap_or("application/octet-stream");
        Ok(Artifact {
            handle,
            bytes,
            mime_type,
        })
    }

    /// Packs every successful artifact of a Task into one `.tar.gz`.
    pub async fn export_task_archive(&self, id: TaskId) -> ForgeResult<TaskArchive> {
        let task = self.store.get(id)?;
        let mut entries = Vec::new();
        for (index, prompt, handle) in task.artifacts() {
            match self.blobs.get(handle).await {
                Ok(bytes) => entries.push(ArchiveEntry {
                    name: entry_name(index + 1, prompt, handle.extension()),
                    bytes,
                }),
                Err(e) => warn!(task_id = %id, handle = %handle, error = %e, "Skipping missing artifact"),
            }
        }
        if entries.is_empty() {
            return Err(ForgeError::InvalidState(format!(
                "task {} has no generated images",
                id
            )));
        }

        let bytes = build_tar_gz(&entries)?;
        let safe_name: String = task
            .name
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        Ok(TaskArchive {
            file_name: format!("{}_{}.tar.gz", safe_name, id.simple()),
            bytes,
            entries: entries.len(),
        })
    }
}
