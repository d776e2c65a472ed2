//! image-forge: unattended bulk image generation over a rotating pool of
//! rate-limited API keys.
//!
//! The library is organised around five cooperating parts:
//!
//! - [`credentials`]: the credential pool with health tracking and cooldowns
//! - [`scheduler`]: the Task queue, the driver loop and the per-Job dispatcher
//! - [`tasks`]: Tasks, Results and their state machine
//! - [`service`]: the façade consumed by client layers and the CLI
//! - [`generation`] / [`storage`]: the external image service and blob store

pub mod cli;
pub mod config;
pub mod credentials;
pub mod error;
pub mod generation;
pub mod metrics;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod tasks;
pub mod utils;

pub use config::{ConfigError, ForgeConfig};
pub use error::{ErrorBody, ErrorCode, ForgeError, ForgeResult};
pub use service::{
    Collaborators, CreateTaskRequest, CreateTaskResponse, OrchestrationService, SystemStatus,
};
