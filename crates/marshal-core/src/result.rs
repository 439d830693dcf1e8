use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    /// The worker ran out of turns and wants to pick up where it left off.
    NeedsContinuation,
}

/// A gating role's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

/// The structured result a worker writes when it finishes.
///
/// Keys other than `outcome`, `decision` and `comment` are kept in `extra`
/// as role-specific fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResult {
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl WorkerResult {
    pub fn success() -> Self {
        Self::with_outcome(Outcome::Success)
    }

    pub fn failure(comment: impl Into<String>) -> Self {
        Self::with_outcome(Outcome::Failure).with_comment(comment)
    }

    pub fn needs_continuation() -> Self {
        Self::with_outcome(Outcome::NeedsContinuation)
    }

    pub fn approve() -> Self {
        Self {
            decision: Some(Decision::Approve),
            ..Self::success()
        }
    }

    pub fn reject(comment: impl Into<String>) -> Self {
        Self {
            decision: Some(Decision::Reject),
            ..Self::success()
        }
        .with_comment(comment)
    }

    fn with_outcome(outcome: Outcome) -> Self {
        Self {
            outcome,
            decision: None,
            comment: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn is_rejection(&self) -> bool {
        self.outcome == Outcome::Success && self.decision == Some(Decision::Reject)
    }

    /// Read a result file written by a worker.
    ///
    /// Returns `Ok(None)` when the file does not exist.
    pub fn read(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)
            .context(format!("failed to read worker result {}", path.display()))?;
        let result = serde_json::from_str(&content)
            .context(format!("malformed worker result {}", path.display()))?;
        Ok(Some(result))
    }
}
