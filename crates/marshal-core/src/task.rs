use crate::agent::WorkerId;
use crate::flow::{FlowName, StepName};
use crate::project::ProjectId;
use crate::role::RoleName;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub i64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TASK-{:04}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = std::num::ParseIntError;

    /// Accepts both `TASK-0042` and a bare `42`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix("TASK-")
            .or_else(|| s.strip_prefix("task-"))
            .unwrap_or(s);
        digits.parse().map(TaskId)
    }
}

/// A lifecycle position. Queue names are declared by flows; the handful of
/// built-in names below exist in every flow.
///
/// Stored and compared in lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Queue(String);

impl<'de> Deserialize<'de> for Queue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Queue::new(s))
    }
}

impl Queue {
    pub const INCOMING: &'static str = "incoming";
    pub const CLAIMED: &'static str = "claimed";
    pub const PROVISIONAL: &'static str = "provisional";
    pub const DONE: &'static str = "done";
    pub const FAILED: &'static str = "failed";
    pub const NEEDS_CONTINUATION: &'static str = "needs_continuation";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into().trim().to_lowercase())
    }

    pub fn incoming() -> Self {
        Self::new(Self::INCOMING)
    }

    pub fn claimed() -> Self {
        Self::new(Self::CLAIMED)
    }

    pub fn provisional() -> Self {
        Self::new(Self::PROVISIONAL)
    }

    pub fn done() -> Self {
        Self::new(Self::DONE)
    }

    pub fn failed() -> Self {
        Self::new(Self::FAILED)
    }

    /// Holding queue for workers that ran out of turns mid-task.
    pub fn needs_continuation() -> Self {
        Self::new(Self::NEEDS_CONTINUATION)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Terminal queues are never left except by manual reset.
    pub fn is_terminal(&self) -> bool {
        self.0 == Self::DONE || self.0 == Self::FAILED
    }

    pub fn is_holding(&self) -> bool {
        self.0 == Self::NEEDS_CONTINUATION
    }
}

impl fmt::Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Queue {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Queue::new(s))
    }
}

/// A time-bounded exclusive claim on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: WorkerId,
    pub claimed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Reference to a review request opened for the task's branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRequestRef {
    pub number: u64,
    pub url: String,
}

/// The step that last failed while the engine tried to advance the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub step: StepName,
    pub reason: String,
    /// How many consecutive attempts have failed so far.
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

/// Category of an audit trail entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Created,
    Claimed,
    Released,
    Transition,
    StepSucceeded,
    StepFailed,
    Rejected,
    Continuation,
    WorkerCrash,
    LeaseExpired,
    OrphanClaim,
    Escalated,
    Reset,
}

/// One entry in the task's append-only audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub kind: AuditKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub context: serde_json::Value,
}

impl AuditEntry {
    pub fn new(kind: AuditKind, message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            kind,
            message: message.into(),
            context: serde_json::Value::Null,
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

/// A unit of work tracked through a queue lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub queue: Queue,
    /// Role that works the task (the claimant of the flow's claim edge).
    pub role: RoleName,
    #[serde(default)]
    pub flow: Option<FlowName>,
    #[serde(default)]
    pub project: Option<ProjectId>,
    /// Explicit working branch. `None` means a private per-task branch.
    #[serde(default)]
    pub branch: Option<String>,
    pub base_branch: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub lease: Option<Lease>,
    /// Concurrency token, incremented on every mutation.
    pub version: u64,
    #[serde(default)]
    pub rejection_count: u32,
    #[serde(default)]
    pub last_feedback: Option<String>,
    #[serde(default)]
    pub blocked_by: Option<TaskId>,
    #[serde(default)]
    pub review_request: Option<ReviewRequestRef>,
    /// Queue to return to when a held (continued) task is resumed.
    #[serde(default)]
    pub resume_queue: Option<Queue>,
    #[serde(default)]
    pub step_failure: Option<StepFailure>,
    #[serde(default)]
    pub audit: Vec<AuditEntry>,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Branch name for this task's work.
    pub fn branch_name(&self) -> String {
        if let Some(branch) = &self.branch {
            return branch.clone();
        }
        format!("marshal/{}/{}", self.id, slugify(&self.title))
    }

    /// Flow governing this task, falling back to the default flow.
    pub fn flow_name(&self) -> FlowName {
        self.flow.clone().unwrap_or_default()
    }

    pub fn lease_holder(&self) -> Option<&WorkerId> {
        self.lease.as_ref().map(|l| &l.holder)
    }

    /// Whether some worker holds a lease that has not expired yet.
    pub fn has_live_lease(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().is_some_and(|l| !l.is_expired(now))
    }

    /// Whether the task is held by `worker` (expired or not).
    pub fn is_held_by(&self, worker: &WorkerId) -> bool {
        self.lease_holder() == Some(worker)
    }

    pub fn is_terminal(&self) -> bool {
        self.queue.is_terminal()
    }
}

/// Lowercase, dash-separated slug used in derived branch names.
pub fn slugify(title: &str) -> String {
    let mut result = String::new();
    let mut prev_dash = true;
    for c in title.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            result.push(c);
            prev_dash = false;
        } else if !prev_dash {
            result.push('-');
            prev_dash = true;
        }
    }
    let trimmed = result.trim_end_matches('-');
    let mut slug: String = trimmed.chars().take(48).collect();
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        "task".to_string()
    } else {
        slug
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn task(title: &str) -> Task {
        let now = Utc::now();
        Task {
            id: TaskId(42),
            title: title.into(),
            description: String::new(),
            queue: Queue::incoming(),
            role: RoleName::new("implementer"),
            flow: None,
            project: None,
            branch: None,
            base_branch: "main".into(),
            priority: 0,
            lease: None,
            version: 1,
            rejection_count: 0,
            last_feedback: None,
            blocked_by: None,
            review_request: None,
            resume_queue: None,
            step_failure: None,
            audit: Vec::new(),
            submitted_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn derived_branch_name() {
        let t = task("Add i32.popcnt to ISLE pipeline");
        assert_eq!(
            t.branch_name(),
            "marshal/TASK-0042/add-i32-popcnt-to-isle-pipeline"
        );
    }

    #[test]
    fn explicit_branch_wins() {
        let mut t = task("anything");
        t.branch = Some("proj/x".into());
        assert_eq!(t.branch_name(), "proj/x");
    }

    #[test]
    fn terminal_queues() {
        assert!(Queue::done().is_terminal());
        assert!(Queue::failed().is_terminal());
        assert!(!Queue::provisional().is_terminal());
        assert!(Queue::needs_continuation().is_holding());
    }

    #[test]
    fn lease_expiry() {
        let now = Utc::now();
        let mut t = task("leased");
        t.lease = Some(Lease {
            holder: WorkerId::new("implementer-1"),
            claimed_at: now,
            expires_at: now + chrono::Duration::seconds(60),
        });
        assert!(t.has_live_lease(now));
        assert!(!t.has_live_lease(now + chrono::Duration::seconds(61)));
        assert!(t.is_held_by(&WorkerId::new("implementer-1")));
    }

    #[test]
    fn task_id_parse_forms() {
        assert_eq!("TASK-0007".parse::<TaskId>().unwrap(), TaskId(7));
        assert_eq!("7".parse::<TaskId>().unwrap(), TaskId(7));
        assert!("TASK-x".parse::<TaskId>().is_err());
    }
}
