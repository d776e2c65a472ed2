//! Command-line interface for image-forge.
//!
//! Runs prompt batches unattended, splits prompt files and describes
//! characters in reference images.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
