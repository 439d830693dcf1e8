use crate::role::RoleName;
use crate::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Identity of a worker slot, e.g. `implementer-2`.
///
/// Claims are held by identities, not by processes: a slot keeps its
/// identity across worker restarts, which is what lets the store refuse a
/// second claim while a completion is still unobserved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Slot identity for the `n`th worker of a role (1-based).
    pub fn slot(role: &RoleName, n: usize) -> Self {
        Self(format!("{role}-{n}"))
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tracks the lifecycle of a single worker process run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSession {
    pub worker: WorkerId,
    pub task_id: TaskId,
    pub role: RoleName,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Working copy the worker was pointed at.
    pub work_dir: PathBuf,
}

impl WorkerSession {
    pub fn new(worker: WorkerId, task_id: TaskId, role: RoleName, work_dir: PathBuf) -> Self {
        Self {
            worker,
            task_id,
            role,
            started_at: Utc::now(),
            finished_at: None,
            work_dir,
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn elapsed_secs(&self) -> f64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}
