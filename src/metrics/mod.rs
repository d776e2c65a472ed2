//! Prometheus-based monitoring for jobs, credentials, tasks and the queue.
//!
//! ```ignore
//! use image_forge::metrics::{export_metrics, init_metrics};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! let text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};
