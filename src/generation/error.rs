//! External-service errors and their classification.

use thiserror::Error;

use crate::credentials::CredentialOutcome;

/// How a failed external call affects the credential and the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Credential ran out of quota; cool it down and retry elsewhere.
    QuotaExhausted,
    /// Credential rejected; pull it from rotation, no retry.
    Invalid,
    /// Network or service trouble; retry once elsewhere.
    Transient,
    /// Prompt content rejected; no retry, credential unaffected.
    PermanentPrompt,
}

impl ErrorClass {
    /// Whether the dispatcher should retry with another credential.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::QuotaExhausted | ErrorClass::Transient)
    }

    /// Outcome to feed back to the pool, if any.
    pub fn pool_outcome(&self) -> Option<CredentialOutcome> {
        match self {
            ErrorClass::QuotaExhausted => Some(CredentialOutcome::QuotaExhausted),
            ErrorClass::Invalid => Some(CredentialOutcome::Invalid),
            ErrorClass::Transient => Some(CredentialOutcome::TransientError),
            ErrorClass::PermanentPrompt => None,
        }
    }
}

/// Error reported by an external capability: a service code, an optional
/// HTTP status and a human-readable message.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct GenerationError {
    pub code: String,
    pub http_status: Option<u16>,
    pub message: String,
}

impl GenerationError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            http_status: None,
            message: message.into(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    /// Network-level failure (timeout, connection reset, ...).
    pub fn network(message: impl Into<String>) -> Self {
        Self::new("NETWORK_ERROR", message)
    }

    /// The service answered but produced no image and did not refuse.
    pub fn no_image(message: impl Into<String>) -> Self {
        Self::new("NO_IMAGE", message)
    }

    /// The service explicitly declined to render the prompt.
    pub fn refused(message: impl Into<String>) -> Self {
        Self::new("CONTENT_REFUSED", message)
    }

    /// Classifies by service code first, then by HTTP status.
    /// Anything unrecognised is transient.
    pub fn classify(&self) -> ErrorClass {
        let code = self.code.to_ascii_uppercase();
        match code.as_str() {
            "RESOURCE_EXHAUSTED" | "QUOTA_EXHAUSTED" | "RATE_LIMITED" => {
                return ErrorClass::QuotaExhausted
            }
            "PERMISSION_DENIED" | "UNAUTHENTICATED" | "API_KEY_INVALID" | "CREDENTIAL_INVALID" => {
                return ErrorClass::Invalid
            }
            "INVALID_ARGUMENT" | "INVALID_PROMPT" | "SAFETY" | "BLOCKED" | "CONTENT_REFUSED" => {
                return ErrorClass::PermanentPrompt
            }
            _ => {}
        }

        if self.message.contains("RESOURCE_EXHAUSTED") {
            return ErrorClass::QuotaExhausted;
        }

        match self.http_status {
            Some(429) => ErrorClass::QuotaExhausted,
            Some(401) | Some(403) => ErrorClass::Invalid,
            Some(400) | Some(404) | Some(413) | Some(422) => ErrorClass::PermanentPrompt,
            _ => ErrorClass::Transient,
        }
    }
}
