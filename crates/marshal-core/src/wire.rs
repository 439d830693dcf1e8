//! JSON bodies of the HTTP task-store API, shared by server and client.

use crate::agent::WorkerId;
use crate::error::StoreError;
use crate::project::ProjectId;
use crate::store::TaskPatch;
use crate::task::TaskId;
use serde::{Deserialize, Serialize};

pub const API_PREFIX: &str = "/api/v1";

/// Body of submit, accept and update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationBody {
    pub expected_version: u64,
    #[serde(default)]
    pub patch: TaskPatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectBody {
    pub expected_version: u64,
    pub feedback: String,
    #[serde(default)]
    pub patch: TaskPatch,
}

/// Error body. The optional fields carry what a client needs to rebuild the
/// typed [`StoreError`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<ProjectId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerId>,
}

impl ErrorBody {
    pub fn new(kind: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            kind: kind.into(),
            ..Self::default()
        }
    }

    /// Rebuild the store error. Bodies missing their detail fields degrade
    /// to [`StoreError::Backend`].
    pub fn into_store_error(self) -> StoreError {
        match (self.kind.as_str(), self.task, self.project) {
            ("version_conflict", Some(id), _) => StoreError::VersionConflict {
                id,
                expected: self.expected.unwrap_or_default(),
                actual: self.actual.unwrap_or_default(),
            },
            ("not_found", Some(id), _) => StoreError::NotFound(id),
            ("project_not_found", _, Some(id)) => StoreError::ProjectNotFound(id),
            ("duplicate_claim", Some(task), _) => match self.worker {
                Some(worker) => StoreError::DuplicateClaim { worker, task },
                None => StoreError::Backend(anyhow::anyhow!(self.error)),
            },
            ("invalid", _, _) => StoreError::Invalid(self.error),
            _ => StoreError::Backend(anyhow::anyhow!("{} ({})", self.error, self.kind)),
        }
    }
}

impl From<&StoreError> for ErrorBody {
    fn from(e: &StoreError) -> Self {
        let mut body = ErrorBody::new(e.kind(), e.to_string());
        match e {
            StoreError::VersionConflict {
                id,
                expected,
                actual,
            } => {
                body.task = Some(*id);
                body.expected = Some(*expected);
                body.actual = Some(*actual);
            }
            StoreError::NotFound(id) => body.task = Some(*id),
            StoreError::ProjectNotFound(id) => body.project = Some(*id),
            StoreError::DuplicateClaim { worker, task } => {
                body.worker = Some(worker.clone());
                body.task = Some(*task);
            }
            StoreError::Invalid(msg) => body.error = msg.clone(),
            StoreError::Backend(_) => {}
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_survives_the_wire() {
        let err = StoreError::VersionConflict {
            id: TaskId(7),
            expected: 5,
            actual: 6,
        };
        let json = serde_json::to_string(&ErrorBody::from(&err)).unwrap();
        let body: ErrorBody = serde_json::from_str(&json).unwrap();
        assert_eq!(body.kind, "version_conflict");
        match body.into_store_error() {
            StoreError::VersionConflict {
                id,
                expected,
                actual,
            } => assert_eq!((id, expected, actual), (TaskId(7), 5, 6)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn duplicate_claim_keeps_worker() {
        let err = StoreError::DuplicateClaim {
            worker: WorkerId::new("implementer-1"),
            task: TaskId(3),
        };
        let rebuilt = ErrorBody::from(&err).into_store_error();
        assert!(rebuilt.is_conflict());
        assert_eq!(rebuilt.to_string(), err.to_string());
    }

    #[test]
    fn unknown_kind_is_backend() {
        let body = ErrorBody::new("internal", "disk on fire");
        let err = body.into_store_error();
        assert_eq!(err.kind(), "backend");
        assert!(err.to_string().contains("disk on fire"));
    }
}
