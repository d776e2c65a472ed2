//! Tasks, their Results, and the store that owns them.

mod model;
mod snapshot;
mod store;

pub use model::{NewTask, ResultStatus, Task, TaskCounts, TaskId, TaskResult, TaskStatus};
pub use snapshot::{SnapshotPersister, TaskSnapshot};
pub use store::{StatusCounts, TaskError, TaskStore};
