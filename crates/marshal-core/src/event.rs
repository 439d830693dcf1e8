//! Pipeline event types for real-time observability.
//!
//! Events are emitted by the scheduler and flow engine as tasks move. These
//! are pure data types; the broadcast bus lives in `marshal-runner`.

use crate::agent::WorkerId;
use crate::flow::StepName;
use crate::task::{Queue, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A timestamped pipeline event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

impl PipelineEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventKind {
    /// Task moved between queues.
    TaskStateChange {
        task_id: TaskId,
        from: Queue,
        to: Queue,
        version: u64,
    },

    /// Task claimed by a worker slot.
    TaskClaimed {
        task_id: TaskId,
        worker: WorkerId,
        queue: Queue,
    },

    WorkerStarted {
        worker: WorkerId,
        task_id: TaskId,
        pid: Option<u32>,
    },

    WorkerFinished {
        worker: WorkerId,
        task_id: TaskId,
        exit_code: Option<i32>,
        has_result: bool,
        elapsed_secs: f64,
    },

    StepFinished {
        task_id: TaskId,
        step: StepName,
        success: bool,
        detail: String,
    },

    /// A claim was lost to another writer.
    ClaimConflict { task_id: TaskId, worker: WorkerId },

    /// Task forced to its failure queue.
    TaskEscalated { task_id: TaskId, reason: String },

    WorkspacePrepared {
        task_id: TaskId,
        path: PathBuf,
        branch: String,
    },

    WorkspaceRetired { task_id: TaskId, path: PathBuf },

    SweepCompleted {
        archived: usize,
        removed: usize,
        branches_deleted: usize,
    },

    /// Engine-level log message.
    EngineLog { level: LogLevel, message: String },
}

/// Severity level for engine log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for PipelineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ts = self.timestamp.format("%H:%M:%S%.3f");
        match &self.kind {
            EventKind::TaskStateChange {
                task_id,
                from,
                to,
                version,
            } => write!(f, "[{ts}] {task_id}: {from} -> {to} (v{version})"),

            EventKind::TaskClaimed {
                task_id,
                worker,
                queue,
            } => write!(f, "[{ts}] {worker} claimed {task_id} ({queue})"),

            EventKind::WorkerStarted {
                worker, task_id, ..
            } => write!(f, "[{ts}] {worker} started on {task_id}"),

            EventKind::WorkerFinished {
                worker,
                exit_code,
                has_result,
                elapsed_secs,
                ..
            } => {
                let code = exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string());
                let result = if *has_result { "result" } else { "no result" };
                write!(
                    f,
                    "[{ts}] {worker} exited ({code}, {result}, {elapsed_secs:.1}s)"
                )
            }

            EventKind::StepFinished {
                task_id,
                step,
                success,
                detail,
            } => {
                let status = if *success { "ok" } else { "FAILED" };
                write!(f, "[{ts}] {task_id}: {step} {status} {detail}")
            }

            EventKind::ClaimConflict { task_id, worker } => {
                write!(f, "[{ts}] {worker} lost the claim on {task_id}")
            }

            EventKind::TaskEscalated { task_id, reason } => {
                write!(f, "[{ts}] {task_id} ESCALATED: {reason}")
            }

            EventKind::WorkspacePrepared {
                task_id,
                path,
                branch,
            } => write!(
                f,
                "[{ts}] {task_id}: workspace {} on {branch}",
                path.display()
            ),

            EventKind::WorkspaceRetired { task_id, path } => {
                write!(f, "[{ts}] {task_id}: retired {}", path.display())
            }

            EventKind::SweepCompleted {
                archived,
                removed,
                branches_deleted,
            } => write!(
                f,
                "[{ts}] sweep: {archived} archived, {removed} removed, {branches_deleted} branches deleted"
            ),

            EventKind::EngineLog { level, message } => {
                let lvl = match level {
                    LogLevel::Info => "INFO",
                    LogLevel::Warn => "WARN",
                    LogLevel::Error => "ERROR",
                };
                write!(f, "[{ts}] {lvl} {message}")
            }
        }
    }
}
