//! FIFO Queue of Tasks and the single active-run slot.
//!
//! All queue mutation and every status change that depends on the active
//! slot happens under one mutex, so two concurrent starts cannot both win.
//! Lock order is scheduler state first, then the Task store.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::ErrorCode;
use crate::metrics::MetricsCollector;
use crate::tasks::{Task, TaskError, TaskId, TaskStatus, TaskStore};

/// Errors returned by queue operations.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// Another Task holds the active slot.
    #[error("Another task is already processing: {active}")]
    Busy { active: TaskId },

    /// The Task's status does not allow the operation.
    #[error("Cannot {operation} task {id} while it is {status}")]
    InvalidState {
        id: TaskId,
        status: TaskStatus,
        operation: &'static str,
    },

    #[error(transparent)]
    Task(#[from] TaskError),
}

impl ScheduleError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ScheduleError::Busy { .. } => ErrorCode::Busy,
            ScheduleError::InvalidState { .. } => ErrorCode::InvalidState,
            ScheduleError::Task(e) => e.code(),
        }
    }
}

/// A run handed to the driver: the Task and its cancellation token.
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub task_id: TaskId,
    pub token: CancellationToken,
}

#[derive(Debug)]
struct ActiveRun {
    task_id: TaskId,
    token: CancellationToken,
    /// Set once the driver has picked the run up.
    claimed: bool,
}

#[derive(Debug, Default)]
struct SchedulerState {
    queue: VecDeque<TaskId>,
    active: Option<ActiveRun>,
}

/// Read-only view of the Queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub queue: Vec<TaskId>,
    pub active: Option<TaskId>,
    pub is_processing: bool,
    pub queue_length: usize,
    pub next_task: Option<TaskId>,
}

/// Orders Tasks and enforces the single-active-Task rule.
pub struct QueueScheduler {
    state: Mutex<SchedulerState>,
    store: Arc<TaskStore>,
    wake: Notify,
    root: CancellationToken,
    metrics: MetricsCollector,
}

impl QueueScheduler {
    pub fn new(store: Arc<TaskStore>) -> Self {
        Self::with_root_token(store, CancellationToken::new())
    }

    /// Builds a scheduler whose run tokens are children of `root`.
    pub fn with_root_token(store: Arc<TaskStore>, root: CancellationToken) -> Self {
        Self {
            state: Mutex::new(SchedulerState::default()),
            store,
            wake: Notify::new(),
            root,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.state.lock().expect("scheduler lock poisoned")
    }

    fn require(
        &self,
        id: TaskId,
        expected: &[TaskStatus],
        operation: &'static str,
    ) -> Result<(), ScheduleError> {
        let status = self.store.status(id)?;
        if expected.contains(&status) {
            Ok(())
        } else {
            Err(ScheduleError::InvalidState {
                id,
                status,
                operation,
            })
        }
    }

    /// Appends a `pending` Task to the tail of the Queue.
    pub fn enqueue(&self, id: TaskId) -> Result<usize, ScheduleError> {
        let mut state = self.lock();
        self.require(id, &[TaskStatus::Pending], "enqueue")?;
        self.store.transition(id, TaskStatus::Queued)?;
        state.queue.push_back(id);
        let position = state.queue.len();
        self.metrics.set_queue_depth(position);
        drop(state);

        info!(task_id = %id, position, "Task enqueued");
        self.wake.notify_one();
        Ok(position)
    }

    /// Removes a `queued` Task from the Queue and reverts it to `pending`.
    pub fn dequeue(&self, id: TaskId) -> Result<(), ScheduleError> {
        let mut state = self.lock();
        self.require(id, &[TaskStatus::Queued], "dequeue")?;
        self.store.transition(id, TaskStatus::Pending)?;
        state.queue.retain(|queued| *queued != id);
        self.metrics.set_queue_depth(state.queue.len());

        info!(task_id = %id, "Task dequeued");
        Ok(())
    }

    /// Moves a `pending` or `queued` Task straight into the active slot.
    pub fn start_immediately(&self, id: TaskId) -> Result<(), ScheduleError> {
        let mut state = self.lock();
        self.require(id, &[TaskStatus::Pending, TaskStatus::Queued], "start")?;
        if let Some(active) = &state.active {
            return Err(ScheduleError::Busy {
                active: active.task_id,
            });
        }

        self.store.transition(id, TaskStatus::Processing)?;
        state.queue.retain(|queued| *queued != id);
        state.active = Some(ActiveRun {
            task_id: id,
            token: self.root.child_token(),
            claimed: false,
        });
        self.metrics.set_queue_depth(state.queue.len());
        drop(state);

        info!(task_id = %id, "Task started immediately");
        self.wake.notify_one();
        Ok(())
    }

    /// Hands the driver its next run, if any.
    ///
    /// A manually started Task waiting in the active slot takes precedence.
    /// Otherwise the Queue head becomes active, provided the slot is free.
    pub fn next_run(&self) -> Result<Option<RunHandle>, ScheduleError> {
        let mut state = self.lock();
        if let Some(active) = state.active.as_mut() {
            if active.claimed {
                return Ok(None);
            }
            active.claimed = true;
            return Ok(Some(RunHandle {
                task_id: active.task_id,
                token: active.token.clone(),
            }));
        }

        while let Some(id) = state.queue.pop_front() {
            match self.store.transition(id, TaskStatus::Processing) {
                Ok(_) => {
                    let token = self.root.child_token();
                    state.active = Some(ActiveRun {
                        task_id: id,
                        token: token.clone(),
                        claimed: true,
                    });
                    self.metrics.set_queue_depth(state.queue.len());
                    debug!(task_id = %id, "Dequeued head of queue");
                    return Ok(Some(RunHandle { task_id: id, token }));
                }
                Err(TaskError::NotFound(_)) => continue,
                Err(e) => {
                    self.metrics.set_queue_depth(state.queue.len());
                    return Err(e.into());
                }
            }
        }
        self.metrics.set_queue_depth(0);
        Ok(None)
    }

    /// Releases the active slot held by `id`.
    pub fn finish_run(&self, id: TaskId) {
        let mut state = self.lock();
        if state.active.as_ref().is_some_and(|a| a.task_id == id) {
            state.active = None;
        }
        drop(state);
        self.wake.notify_one();
    }

    /// Signals cancellation to the run of a `processing` Task.
    pub fn cancel(&self, id: TaskId) -> Result<(), ScheduleError> {
        let state = self.lock();
        match &state.active {
            Some(active) if active.task_id == id => {
                active.token.cancel();
                info!(task_id = %id, "Cancellation requested");
                Ok(())
            }
            _ => {
                let status = self.store.status(id)?;
                Err(ScheduleError::InvalidState {
                    id,
                    status,
                    operation: "cancel",
                })
            }
        }
    }

    /// Removes a Task in any status, cancelling its run if it is active.
    ///
    /// The active slot stays held until the driver observes the cancellation
    /// and calls [`finish_run`](Self::finish_run).
    pub fn forget(&self, id: TaskId) -> Result<Task, ScheduleError> {
        let mut state = self.lock();
        let removed = self.store.remove(id)?;
        state.queue.retain(|queued| *queued != id);
        if let Some(active) = state.active.as_ref().filter(|a| a.task_id == id) {
            active.token.cancel();
        }
        self.metrics.set_queue_depth(state.queue.len());
        Ok(removed)
    }

    /// Re-queues recovered Tasks in the given order.
    pub fn restore(&self, ids: Vec<TaskId>) {
        if ids.is_empty() {
            return;
        }
        let mut state = self.lock();
        for id in ids {
            if !state.queue.contains(&id) {
                state.queue.push_back(id);
            }
        }
        self.metrics.set_queue_depth(state.queue.len());
        drop(state);
        self.wake.notify_one();
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.lock();
        let queue: Vec<TaskId> = state.queue.iter().copied().collect();
        QueueStatus {
            active: state.active.as_ref().map(|a| a.task_id),
            is_processing: state.active.is_some(),
            queue_length: queue.len(),
            next_task: queue.first().copied(),
            queue,
        }
    }

    pub fn active(&self) -> Option<TaskId> {
        self.lock().active.as_ref().map(|a| a.task_id)
    }

    /// Completes when the scheduler has new work or a run finished.
    pub async fn notified(&self) {
        self.wake.notified().await
    }

    /// Wakes the driver without touching the Queue.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// Cancels every run and stops the driver.
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.root.is_cancelled()
    }
}
