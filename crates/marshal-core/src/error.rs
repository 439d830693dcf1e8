//! Typed errors for the store contract, the control plane and config loading.

use crate::agent::WorkerId;
use crate::flow::StepName;
use crate::project::ProjectId;
use crate::task::{Queue, TaskId};
use std::path::PathBuf;

/// Errors returned by a [`TaskStore`](crate::store::TaskStore).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{id}: version conflict (expected {expected}, found {actual})")]
    VersionConflict { id: TaskId, expected: u64, actual: u64 },

    #[error("{0} not found")]
    NotFound(TaskId),

    #[error("{0} not found")]
    ProjectNotFound(ProjectId),

    #[error("worker {worker} already holds {task}")]
    DuplicateClaim { worker: WorkerId, task: TaskId },

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    /// Short machine-readable name, used in HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::VersionConflict { .. } => "version_conflict",
            StoreError::NotFound(_) => "not_found",
            StoreError::ProjectNotFound(_) => "project_not_found",
            StoreError::DuplicateClaim { .. } => "duplicate_claim",
            StoreError::Invalid(_) => "invalid",
            StoreError::Backend(_) => "backend",
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::VersionConflict { .. } | StoreError::DuplicateClaim { .. }
        )
    }
}

/// Incidents the control plane recognises and records on tasks.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("{task}: claim lost to a concurrent writer")]
    ClaimConflict { task: TaskId },

    #[error("{task}: lease held by {holder} expired with no live worker")]
    LeaseExpired { task: TaskId, holder: WorkerId },

    #[error("branch {branch} is checked out in {path}")]
    BranchConflict { branch: String, path: PathBuf },

    #[error("{task}: step {step} failed: {reason}")]
    StepFailure {
        task: TaskId,
        step: StepName,
        reason: String,
    },

    #[error("{task}: worker exited without a result ({detail})")]
    WorkerCrash { task: TaskId, detail: String },

    #[error("{task}: rejected {count} times, giving up")]
    RejectionLoop { task: TaskId, count: u32 },

    #[error("{task}: claimed by {holder} but no worker is tracking it")]
    OrphanClaim { task: TaskId, holder: WorkerId },

    #[error("{task}: {from} -> {to} is not an edge of flow {flow}")]
    OutOfGraph {
        task: TaskId,
        flow: String,
        from: Queue,
        to: Queue,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ControlError {
    /// Name recorded in audit entries.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlError::ClaimConflict { .. } => "ClaimConflict",
            ControlError::LeaseExpired { .. } => "LeaseExpired",
            ControlError::BranchConflict { .. } => "BranchConflict",
            ControlError::StepFailure { .. } => "StepFailure",
            ControlError::WorkerCrash { .. } => "WorkerCrash",
            ControlError::RejectionLoop { .. } => "RejectionLoop",
            ControlError::OrphanClaim { .. } => "OrphanClaim",
            ControlError::OutOfGraph { .. } => "OutOfGraph",
            ControlError::Config(_) => "Config",
            ControlError::Store(_) => "Store",
        }
    }
}

/// Problems found while loading or validating the pipeline config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("transition key `{0}` must look like `from -> to`")]
    BadTransitionKey(String),

    #[error("unknown step `{0}`")]
    UnknownStep(String),

    #[error("unknown flow `{0}`")]
    UnknownFlow(String),

    #[error("flow `{flow}`: unknown role `{role}`")]
    UnknownRole { flow: String, role: String },

    #[error("flow `{flow}`: queue `{queue}` has more than one outgoing transition")]
    DuplicateTransition { flow: String, queue: String },

    #[error("flow `{flow}`: on_fail target `{queue}` is not a queue of the flow")]
    UnknownQueue { flow: String, queue: String },

    #[error("flow `{flow}`: delegated condition `{condition}` names no role")]
    MissingConditionRole { flow: String, condition: String },

    #[error("flow `{flow}`: nothing claims from initial queue `{queue}`")]
    NoInitialClaim { flow: String, queue: String },

    #[error("flow `{flow}`: terminal queue `{queue}` has an outgoing transition")]
    TerminalHasExit { flow: String, queue: String },

    #[error("flow `{flow}`: queue `{queue}` is entered by a claim but has no transition out")]
    DeadEnd { flow: String, queue: String },

    #[error(
        "flow `{flow}`: gate `{condition}` on `{queue}` is unreachable, `{queue}` is held by the claiming worker"
    )]
    UnreachableGate {
        flow: String,
        queue: String,
        condition: String,
    },

    #[error("role `{0}` must allow at least one concurrent worker")]
    ZeroConcurrency(String),

    #[error("scheduler.{0} must be greater than zero")]
    ZeroInterval(&'static str),
}
