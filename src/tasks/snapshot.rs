//! JSON snapshots of the Task store.
//!
//! A [`SnapshotPersister`] runs in the background and rewrites the state file
//! whenever the store revision moves, and the credential file whenever the
//! pool's revision moves. Writes go through a temp file in the same directory
//! followed by a rename, so a crash never leaves a torn file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::model::Task;
use super::store::{TaskError, TaskStore};
use crate::credentials::{CredentialFile, CredentialPool};
use crate::utils::write_atomic;

const SNAPSHOT_VERSION: u32 = 1;

/// Serialized form of the Task store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub tasks: Vec<Task>,
}

impl TaskSnapshot {
    pub fn capture(store: &TaskStore) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            tasks: store.list(),
        }
    }

    /// Writes the snapshot atomically on the blocking pool.
    pub async fn write_to(&self, path: &Path) -> Result<(), TaskError> {
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(path, json).await?;
        Ok(())
    }

    /// Reads a snapshot. A missing file yields `None`.
    pub fn read_from(path: &Path) -> Result<Option<Self>, TaskError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

/// Background writer that keeps the state files in step with the store and,
/// optionally, the credential pool.
pub struct SnapshotPersister {
    store: Arc<TaskStore>,
    path: PathBuf,
    credentials: Option<(Arc<CredentialPool>, PathBuf)>,
    interval: Duration,
}

impl SnapshotPersister {
    pub fn new(store: Arc<TaskStore>, path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            store,
            path: path.into(),
            credentials: None,
            interval,
        }
    }

    /// Also persists `pool` to `path` whenever its revision moves.
    pub fn with_credentials(mut self, pool: Arc<CredentialPool>, path: impl Into<PathBuf>) -> Self {
        self.credentials = Some((pool, path.into()));
        self
    }

    /// Writes the Task snapshot if the revision differs from `last`; returns the revision written.
    async fn flush_tasks(&self, last: Option<u64>) -> Option<u64> {
        let revision = self.store.revision();
        if last == Some(revision) {
            return last;
        }
        match TaskSnapshot::capture(&self.store).write_to(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), revision, "Snapshot written");
                Some(revision)
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to write snapshot");
                last
            }
        }
    }

    async fn flush_credentials(&self, last: Option<u64>) -> Option<u64> {
        let Some((pool, path)) = &self.credentials else {
            return last;
        };
        let revision = pool.revision();
        if last == Some(revision) {
            return last;
        }
        match CredentialFile::capture(pool).write_to(path).await {
            Ok(()) => {
                debug!(path = %path.display(), revision, "Credential file written");
                Some(revision)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to write credential file");
                last
            }
        }
    }

    /// Runs until `shutdown` fires, then writes one final snapshot.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(path = %self.path.display(), "Snapshot persister started");
        let mut last_tasks = None;
        let mut last_credentials = None;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    last_tasks = self.flush_tasks(last_tasks).await;
                    last_credentials = self.flush_credentials(last_credentials).await;
                }
            }
        }

        self.flush_tasks(last_tasks).await;
        self.flush_credentials(last_credentials).await;
        info!("Snapshot persister stopped");
    }
}
