//! Task, Result and status types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::storage::BlobHandle;

/// Task identifier.
pub type TaskId = Uuid;

/// Lifecycle status of a Task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Processing,
    Completed,
    Failed,
    Partial,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Queued,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Partial,
    ];

    /// Completed, failed and partial admit no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Partial
        )
    }

    /// The Task state machine.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Processing)
                | (Queued, Processing)
                | (Queued, Pending)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Partial)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Partial => "partial",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress counters. `completed + failed <= total` always holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

impl TaskCounts {
    /// Jobs resolved so far.
    pub fn attempted(&self) -> usize {
        self.completed + self.failed
    }

    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.attempted())
    }

    /// Terminal status from the Jobs attempted.
    pub fn final_status(&self) -> TaskStatus {
        if self.total > 0 && self.completed == self.total {
            TaskStatus::Completed
        } else if self.completed == 0 {
            TaskStatus::Failed
        } else {
            TaskStatus::Partial
        }
    }
}

/// Outcome of one Job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failure,
}

/// Record of one resolved Job. Results are appended in prompt order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub prompt_index: usize,
    pub prompt: String,
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<BlobHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    /// Display suffix of the credential that served the Job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_suffix: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TaskResult {
    pub fn success(
        prompt_index: usize,
        prompt: impl Into<String>,
        artifact: BlobHandle,
        credential_suffix: impl Into<String>,
    ) -> Self {
        Self {
            prompt_index,
            prompt: prompt.into(),
            status: ResultStatus::Success,
            artifact: Some(artifact),
            error: None,
            error_code: None,
            credential_suffix: Some(credential_suffix.into()),
            timestamp: Utc::now(),
        }
    }

    pub fn failure(
        prompt_index: usize,
        prompt: impl Into<String>,
        code: ErrorCode,
        message: impl Into<String>,
        credential_suffix: Option<String>,
    ) -> Self {
        Self {
            prompt_index,
            prompt: prompt.into(),
            status: ResultStatus::Failure,
            artifact: None,
            error: Some(message.into()),
            error_code: Some(code),
            credential_suffix,
            timestamp: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }
}

/// Parameters of a Task submission.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub name: String,
    pub prompts: Vec<String>,
    pub reference_image: Option<BlobHandle>,
    pub character_context: Option<String>,
    pub character_sync: bool,
}

/// A named batch of prompts tracked as one unit of progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub prompts: Vec<String>,
    #[serde(default)]
    pub reference_image: Option<BlobHandle>,
    #[serde(default)]
    pub character_context: Option<String>,
    #[serde(default)]
    pub character_sync: bool,
    pub status: TaskStatus,
    pub counts: TaskCounts,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub results: Vec<TaskResult>,
}

impl Task {
    /// Creates a `pending` Task.
    pub fn new(request: NewTask) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: request.name,
            counts: TaskCounts {
                total: request.prompts.len(),
                ..TaskCounts::default()
            },
            prompts: request.prompts,
            reference_image: request.reference_image,
            character_context: request.character_context,
            character_sync: request.character_sync,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            results: Vec::new(),
        }
    }

    /// Index of the first prompt without a Result.
    pub fn next_unresolved_index(&self) -> usize {
        self.results.len()
    }

    /// Artifact of the most recent successful Result.
    pub fn last_successful_artifact(&self) -> Option<&BlobHandle> {
        self.results
            .iter()
            .rev()
            .find(|r| r.is_success())
            .and_then(|r| r.artifact.as_ref())
    }

    /// Artifacts of all successful Results, with their prompt index and text.
    pub fn artifacts(&self) -> impl Iterator<Item = (usize, &str, &BlobHandle)> {
        self.results
            .iter()
            .filter_map(|r| r.artifact.as_ref().map(|a| (r.prompt_index, r.prompt.as_str(), a)))
    }
}
