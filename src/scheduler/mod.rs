//! Queue scheduling and Job execution.
//!
//! - [`QueueScheduler`]: FIFO Queue plus the single active-run slot
//! - [`JobDispatcher`]: one Job with bounded retry and credential failover
//! - [`Driver`]: background loop that activates Tasks and records Results
//!
//! ```text
//!   enqueue / start_immediately
//!              │
//!      ┌───────▼────────┐   next_run    ┌──────────┐   run_job   ┌───────────────┐
//!      │ QueueScheduler │──────────────▶│  Driver  │────────────▶│ JobDispatcher │
//!      └───────┬────────┘               └────┬─────┘             └───────┬───────┘
//!              │ transitions                 │ append_result / finalize  │ acquire / report
//!        ┌─────▼─────┐◀────────────────────────┘                  ┌──────▼─────────┐
//!        │ TaskStore │                                            │ CredentialPool │
//!        └───────────┘                                            └────────────────┘
//! ```

pub mod dispatcher;
pub mod driver;
pub mod queue;

pub use dispatcher::{DispatchOutcome, JobContext, JobDispatcher};
pub use driver::{Driver, DriverConfig};
pub use queue::{QueueScheduler, QueueStatus, RunHandle, ScheduleError};
