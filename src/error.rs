//! Error taxonomy for image-forge operations.
//!
//! Every component owns a narrow `thiserror` enum; this module folds them into
//! [`ForgeError`], which is what the orchestration façade returns. Each error
//! maps onto a stable [`ErrorCode`] so that the client layer can present or
//! localise it without parsing messages:
//!
//! - Credential pool: `NoCredentialAvailable`, `DuplicateCredential`, `NotFound`
//! - External service: `CredentialInvalid`, `QuotaExhausted`,
//!   `TransientServiceError`, `InvalidPrompt`
//! - Task and queue state: `InvalidState`, `Busy`, `NotFound`, `InvalidInput`
//! - Blob storage: `StorageFailure`

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::credentials::PoolError;
use crate::generation::{ErrorClass, GenerationError};
use crate::scheduler::ScheduleError;
use crate::storage::StorageError;
use crate::tasks::TaskError;

/// Stable error codes surfaced to the client layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// No credential could be acquired from the pool.
    NoCredentialAvailable,
    /// The external service rejected the credential (auth or permission).
    CredentialInvalid,
    /// The credential ran out of quota.
    QuotaExhausted,
    /// Network failure or service unavailability.
    TransientServiceError,
    /// The external service rejected the prompt content.
    InvalidPrompt,
    /// The operation does not apply to the Task or Queue in its current state.
    InvalidState,
    /// Another Task is already processing.
    Busy,
    /// The referenced entity does not exist.
    NotFound,
    /// The secret is already registered.
    DuplicateCredential,
    /// The request itself is malformed (empty prompt list, bad upload, ...).
    InvalidInput,
    /// Reading or writing artifacts failed.
    StorageFailure,
    /// Anything else.
    Internal,
}

impl ErrorCode {
    /// Returns the wire representation of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NoCredentialAvailable => "NO_CREDENTIAL_AVAILABLE",
            ErrorCode::CredentialInvalid => "CREDENTIAL_INVALID",
            ErrorCode::QuotaExhausted => "QUOTA_EXHAUSTED",
            ErrorCode::TransientServiceError => "TRANSIENT_SERVICE_ERROR",
            ErrorCode::InvalidPrompt => "INVALID_PROMPT",
            ErrorCode::InvalidState => "INVALID_STATE",
            ErrorCode::Busy => "BUSY",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::DuplicateCredential => "DUPLICATE_CREDENTIAL",
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::StorageFailure => "STORAGE_FAILURE",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ErrorClass> for ErrorCode {
    fn from(class: ErrorClass) -> Self {
        match class {
            ErrorClass::QuotaExhausted => ErrorCode::QuotaExhausted,
            ErrorClass::Invalid => ErrorCode::CredentialInvalid,
            ErrorClass::Transient => ErrorCode::TransientServiceError,
            ErrorClass::PermanentPrompt => ErrorCode::InvalidPrompt,
        }
    }
}

/// Structured `(code, message)` pair handed to the client layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

/// Top-level error returned by the orchestration façade.
#[derive(Debug, Error)]
pub enum ForgeError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl ForgeError {
    /// Maps the error onto the public taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            ForgeError::Pool(e) => e.code(),
            ForgeError::Task(e) => e.code(),
            ForgeError::Schedule(e) => e.code(),
            ForgeError::Storage(e) => e.code(),
            ForgeError::Generation(e) => e.classify().into(),
            ForgeError::Config(_) => ErrorCode::InvalidInput,
            ForgeError::InvalidInput(_) => ErrorCode::InvalidInput,
            ForgeError::InvalidState(_) => ErrorCode::InvalidState,
        }
    }

    /// Builds the structured pair for the client layer.
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

/// Convenience alias used throughout the façade.
pub type ForgeResult<T> = Result<T, ForgeError>;
