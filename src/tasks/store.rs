//! In-memory Task store and the Task state machine.
//!
//! Status and counters change only through [`TaskStore::transition`],
//! [`TaskStore::append_result`] and [`TaskStore::finalize`]. The scheduler is
//! the sole caller of these, and counter updates come only from the driver
//! loop, so each Task has a single writer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::model::{Task, TaskCounts, TaskId, TaskResult, TaskStatus};
use crate::error::ErrorCode;

/// Errors returned by Task store operations.
#[derive(Debug, Error)]
pub enum TaskError {
    /// No Task with this id.
    #[error("Task not found: {0}")]
    NotFound(TaskId),

    /// The state machine does not allow this transition.
    #[error("Task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// Results can only be recorded while the Task is processing.
    #[error("Task {id} is {status}, not processing")]
    NotProcessing { id: TaskId, status: TaskStatus },

    /// A Result arrived for the wrong prompt index.
    #[error("Task {id} expected result for prompt {expected}, got {got}")]
    ResultOutOfOrder {
        id: TaskId,
        expected: usize,
        got: usize,
    },

    /// Every prompt already has a Result.
    #[error("Task {0} has no unresolved prompts left")]
    CountsExceeded(TaskId),

    /// Snapshot IO failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot (de)serialization failed.
    #[error("Snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TaskError {
    pub fn code(&self) -> ErrorCode {
        match self {
            TaskError::NotFound(_) => ErrorCode::NotFound,
            TaskError::InvalidTransition { .. } | TaskError::NotProcessing { .. } => {
                ErrorCode::InvalidState
            }
            TaskError::ResultOutOfOrder { .. } | TaskError::CountsExceeded(_) => {
                ErrorCode::Internal
            }
            TaskError::Io(_) | TaskError::Serialization(_) => ErrorCode::StorageFailure,
        }
    }
}

/// Number of Tasks in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub total: usize,
    pub pending: usize,
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub partial: usize,
}

impl StatusCounts {
    fn add(&mut self, status: TaskStatus) {
        self.total += 1;
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Queued => self.queued += 1,
            TaskStatus::Processing => self.processing += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Partial => self.partial += 1,
        }
    }
}

/// Owns every Task and its Results.
#[derive(Debug, Default)]
pub struct TaskStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
    /// Bumped on every mutation; the persister compares it to skip idle writes.
    revision: AtomicU64,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store holding the given Tasks.
    pub fn from_tasks(tasks: Vec<Task>) -> Self {
        let store = Self::new();
        {
            let mut map = store.tasks.write().expect("task store lock poisoned");
            for task in tasks {
                map.insert(task.id, task);
            }
        }
        store
    }

    fn bump(&self) {
        self.revision.fetch_add(1, Ordering::SeqCst);
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    pub fn insert(&self, task: Task) -> TaskId {
        let id = task.id;
        self.tasks
            .write()
            .expect("task store lock poisoned")
            .insert(id, task);
        self.bump();
        id
    }

    /// Returns a copy of the Task.
    pub fn get(&self, id: TaskId) -> Result<Task, TaskError> {
        self.tasks
            .read()
            .expect("task store lock poisoned")
            .get(&id)
            .cloned()
            .ok_or(TaskError::NotFound(id))
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.tasks
            .read()
            .expect("task store lock poisoned")
            .contains_key(&id)
    }

    pub fn status(&self, id: TaskId) -> Result<TaskStatus, TaskError> {
        self.tasks
            .read()
            .expect("task store lock poisoned")
            .get(&id)
            .map(|t| t.status)
            .ok_or(TaskError::NotFound(id))
    }

    /// All Tasks, newest first.
    pub fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .expect("task store lock poisoned")
            .values()
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.read().expect("task store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes a Task with its Results.
    pub fn remove(&self, id: TaskId) -> Result<Task, TaskError> {
        let removed = self
            .tasks
            .write()
            .expect("task store lock poisoned")
            .remove(&id)
            .ok_or(TaskError::NotFound(id))?;
        self.bump();
        Ok(removed)
    }

    /// Applies a state machine transition.
    pub fn transition(&self, id: TaskId, to: TaskStatus) -> Result<Task, TaskError> {
        let mut tasks = self.tasks.write().expect("task store lock poisoned");
        let task = tasks.get_mut(&id).ok_or(TaskError::NotFound(id))?;
        if !task.status.can_transition_to(to) {
            return Err(TaskError::InvalidTransition {
                id,
                from: task.status,
                to,
            });
        }

        let now = Utc::now();
        task.status = to;
        task.updated_at = now;
        if to == TaskStatus::Processing {
            task.started_at = Some(now);
        }
        let snapshot = task.clone();
        drop(tasks);
        self.bump();
        Ok(snapshot)
    }

    /// Records the Result of the next unresolved prompt and updates counters.
    pub fn append_result(&self, id: TaskId, result: TaskResult) -> Result<TaskCounts, TaskError> {
        let mut tasks = self.tasks.write().expect("task store lock poisoned");
        let task = tasks.get_mut(&id).ok_or(TaskError::NotFound(id))?;
        if task.status != TaskStatus::Processing {
            return Err(TaskError::NotProcessing {
                id,
                status: task.status,
            });
        }
        if task.counts.attempted() >= task.counts.total {
            return Err(TaskError::CountsExceeded(id));
        }
        let expected = task.next_unresolved_index();
        if result.prompt_index != expected {
            return Err(TaskError::ResultOutOfOrder {
                id,
                expected,
                got: result.prompt_index,
            });
        }

        if result.is_success() {
            task.counts.completed += 1;
        } else {
            task.counts.failed += 1;
        }
        task.results.push(result);
        task.updated_at = Utc::now();
        let counts = task.counts;
        drop(tasks);
        self.bump();
        Ok(counts)
    }

    /// Moves a processing Task to its terminal status.
    pub fn finalize(&self, id: TaskId) -> Result<TaskStatus, TaskError> {
        let mut tasks = self.tasks.write().expect("task store lock poisoned");
        let task = tasks.get_mut(&id).ok_or(TaskError::NotFound(id))?;
        let to = task.counts.final_status();
        if !task.status.can_transition_to(to) {
            return Err(TaskError::InvalidTransition {
                id,
                from: task.status,
                to,
            });
        }
        let now = Utc::now();
        task.status = to;
        task.updated_at = now;
        task.finished_at = Some(now);
        drop(tasks);
        self.bump();
        Ok(to)
    }

    /// Number of Tasks per status.
    pub fn status_counts(&self) -> StatusCounts {
        let tasks = self.tasks.read().expect("task store lock poisoned");
        let mut counts = StatusCounts::default();
        for task in tasks.values() {
            counts.add(task.status);
        }
        counts
    }

    /// Prepares Tasks loaded from a snapshot for re-queueing.
    ///
    /// Tasks left `processing` by an interrupted run become `queued` again.
    /// Returns the queue order: interrupted Tasks first, then the previously
    /// queued ones, each group ordered by `updated_at`.
    pub fn recover_interrupted(&self) -> Vec<TaskId> {
        let mut tasks = self.tasks.write().expect("task store lock poisoned");

        let mut interrupted: Vec<&mut Task> = Vec::new();
        let mut queued: Vec<&Task> = Vec::new();
        for task in tasks.values_mut() {
            let status = task.status;
            match status {
                TaskStatus::Processing => interrupted.push(task),
                TaskStatus::Queued => queued.push(task),
                _ => {}
            }
        }

        interrupted.sort_by_key(|t| (t.updated_at, t.id));
        queued.sort_by_key(|t| (t.updated_at, t.id));

        let mut order: Vec<TaskId> = Vec::with_capacity(interrupted.len() + queued.len());
        for task in interrupted {
            // Outside the state machine: the run that owned this Task is gone
            task.status = TaskStatus::Queued;
            order.push(task.id);
        }
        order.extend(queued.into_iter().map(|t| t.id));
        drop(tasks);

        if !order.is_empty() {
            self.bump();
        }
        order
    }
}
