//! The task-store contract.
//!
//! Every mutating call carries the version the caller last observed; a
//! mismatch aborts the write with [`StoreError::VersionConflict`]. The
//! helpers at the bottom of this module hold the claim and mutation rules so
//! that every backend applies them identically.

use crate::agent::WorkerId;
use crate::error::StoreError;
use crate::flow::FlowName;
use crate::project::{NewProject, Project, ProjectId};
use crate::role::RoleName;
use crate::task::{AuditEntry, AuditKind, Lease, Queue, ReviewRequestRef, StepFailure, Task, TaskId};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Fields for a new task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub role: RoleName,
    #[serde(default)]
    pub flow: Option<FlowName>,
    #[serde(default)]
    pub project: Option<ProjectId>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub blocked_by: Option<TaskId>,
    /// Starting queue; defaults to `incoming`.
    #[serde(default)]
    pub queue: Option<Queue>,
}

impl NewTask {
    pub fn new(title: impl Into<String>, role: RoleName) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            role,
            flow: None,
            project: None,
            branch: None,
            base_branch: None,
            priority: 0,
            blocked_by: None,
            queue: None,
        }
    }
}

/// Query over stored tasks. Empty fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    #[serde(default)]
    pub queues: Vec<Queue>,
    #[serde(default)]
    pub role: Option<RoleName>,
    #[serde(default)]
    pub project: Option<ProjectId>,
    #[serde(default)]
    pub claimed_by: Option<WorkerId>,
    /// `Some(false)` keeps only tasks whose blocker is terminal (or absent).
    #[serde(default)]
    pub blocked: Option<bool>,
}

impl TaskFilter {
    pub fn in_queue(queue: Queue) -> Self {
        Self {
            queues: vec![queue],
            ..Self::default()
        }
    }

    pub fn claimed_by(worker: WorkerId) -> Self {
        Self {
            claimed_by: Some(worker),
            ..Self::default()
        }
    }

    /// Match everything except the blocked status, which needs the blocker.
    pub fn matches_fields(&self, task: &Task) -> bool {
        (self.queues.is_empty() || self.queues.contains(&task.queue))
            && self.role.as_ref().is_none_or(|r| r == &task.role)
            && self.project.is_none_or(|p| task.project == Some(p))
            && self
                .claimed_by
                .as_ref()
                .is_none_or(|w| task.lease_holder() == Some(w))
    }
}

/// Pin a claim to one task at the version the caller read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimTarget {
    pub id: TaskId,
    pub expected_version: u64,
}

/// An atomic claim along one claim route of a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub role: RoleName,
    pub worker: WorkerId,
    pub flow: FlowName,
    /// Queue to claim from.
    pub from: Queue,
    /// Queue the claim moves the task to; `None` leaves it in place.
    #[serde(default)]
    pub to: Option<Queue>,
    /// Require the task's role to equal `role`.
    #[serde(default = "default_true")]
    pub match_task_role: bool,
    pub lease_secs: i64,
    #[serde(default)]
    pub project: Option<ProjectId>,
    #[serde(default)]
    pub target: Option<ClaimTarget>,
}

fn default_true() -> bool {
    true
}

/// What to do with the lease during a mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum LeaseChange {
    #[default]
    Keep,
    Release,
    Renew { holder: WorkerId, secs: i64 },
}

/// Partial update applied by submit/accept/reject/update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<Queue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_request: Option<ReviewRequestRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_queue: Option<Queue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_failure: Option<StepFailure>,
    #[serde(default)]
    pub lease: LeaseChange,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audit: Vec<AuditEntry>,
}

impl TaskPatch {
    pub fn to_queue(queue: Queue) -> Self {
        Self {
            queue: Some(queue),
            ..Self::default()
        }
    }

    pub fn release(mut self) -> Self {
        self.lease = LeaseChange::Release;
        self
    }

    pub fn with_audit(mut self, entry: AuditEntry) -> Self {
        self.audit.push(entry);
        self
    }
}

/// Which contract operation a mutation is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Hand work on to the next stage; stamps `submitted_at`.
    Submit,
    /// Finish the task; stamps `completed_at`.
    Accept,
    /// Record a gate's rejection and its feedback.
    Reject { feedback: String },
    /// Plain field update.
    Update,
}

/// The durable task store.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create(&self, new: NewTask) -> Result<Task, StoreError>;

    async fn get(&self, id: TaskId) -> Result<Task, StoreError>;

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError>;

    /// Atomically claim the best candidate, or `None` if nothing is claimable.
    async fn claim(&self, req: &ClaimRequest) -> Result<Option<Task>, StoreError>;

    async fn submit(
        &self,
        id: TaskId,
        expected_version: u64,
        patch: TaskPatch,
    ) -> Result<Task, StoreError>;

    async fn accept(
        &self,
        id: TaskId,
        expected_version: u64,
        patch: TaskPatch,
    ) -> Result<Task, StoreError>;

    async fn reject(
        &self,
        id: TaskId,
        expected_version: u64,
        feedback: String,
        patch: TaskPatch,
    ) -> Result<Task, StoreError>;

    async fn update(
        &self,
        id: TaskId,
        expected_version: u64,
        patch: TaskPatch,
    ) -> Result<Task, StoreError>;

    async fn create_project(&self, new: NewProject) -> Result<Project, StoreError>;

    async fn get_project(&self, id: ProjectId) -> Result<Project, StoreError>;

    async fn list_projects(&self) -> Result<Vec<Project>, StoreError>;
}

// ─── Shared rules ───────────────────────────────────────────────────────

/// Build a task from creation fields, applying project inheritance.
///
/// `chain_after` is the project's latest non-terminal task, used as the
/// blocker when the project shares a branch and no blocker was given.
pub fn build_task(
    id: TaskId,
    new: NewTask,
    project: Option<&Project>,
    chain_after: Option<TaskId>,
    now: DateTime<Utc>,
) -> Task {
    let shared = project.and_then(|p| p.shared_branch.clone());
    let blocked_by = match (new.blocked_by, &shared) {
        (Some(b), _) => Some(b),
        (None, Some(_)) => chain_after,
        (None, None) => None,
    };
    let base_branch = new
        .base_branch
        .or_else(|| project.map(|p| p.base_branch.clone()))
        .unwrap_or_else(|| "main".to_string());
    Task {
        id,
        title: new.title,
        description: new.description,
        queue: new.queue.unwrap_or_else(Queue::incoming),
        role: new.role,
        flow: new.flow,
        project: new.project,
        branch: new.branch.or(shared),
        base_branch,
        priority: new.priority,
        lease: None,
        version: 1,
        rejection_count: 0,
        last_feedback: None,
        blocked_by,
        review_request: None,
        resume_queue: None,
        step_failure: None,
        audit: vec![AuditEntry::new(AuditKind::Created, "task created")],
        submitted_at: None,
        completed_at: None,
        created_at: now,
        updated_at: now,
    }
}

/// Whether pointing `id` at `blocker` would close a cycle.
///
/// `blocker_of` returns the current blocker of a task.
pub fn would_cycle(
    id: TaskId,
    blocker: TaskId,
    blocker_of: impl Fn(TaskId) -> Option<TaskId>,
) -> bool {
    let mut cursor = Some(blocker);
    let mut hops = 0usize;
    while let Some(current) = cursor {
        if current == id {
            return true;
        }
        hops += 1;
        if hops > 100_000 {
            return true;
        }
        cursor = blocker_of(current);
    }
    false
}

/// The non-terminal task `worker` already holds, if any.
pub fn existing_claim<'a>(tasks: &'a [Task], worker: &WorkerId) -> Option<&'a Task> {
    tasks
        .iter()
        .find(|t| !t.is_terminal() && t.is_held_by(worker))
}

/// Whether `task` can be claimed by `req` right now.
///
/// `blocker_done` reports whether a blocker has reached a terminal queue.
pub fn is_claimable(
    task: &Task,
    req: &ClaimRequest,
    now: DateTime<Utc>,
    blocker_done: impl Fn(TaskId) -> bool,
) -> bool {
    task.queue == req.from
        && task.flow_name() == req.flow
        && (!req.match_task_role || task.role == req.role)
        && req.project.is_none_or(|p| task.project == Some(p))
        && !task.has_live_lease(now)
        && task.blocked_by.is_none_or(&blocker_done)
}

/// Pick the claim candidate: priority descending, then oldest first.
pub fn pick_candidate<'a>(
    tasks: &'a [Task],
    req: &ClaimRequest,
    now: DateTime<Utc>,
    blocker_done: impl Fn(TaskId) -> bool,
) -> Option<&'a Task> {
    tasks
        .iter()
        .filter(|t| is_claimable(t, req, now, &blocker_done))
        .min_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        })
}

/// Take the claim on `task` for `req`.
pub fn apply_claim(task: &mut Task, req: &ClaimRequest, now: DateTime<Utc>) {
    let from = task.queue.clone();
    if let Some(to) = &req.to {
        task.queue = to.clone();
    }
    task.lease = Some(Lease {
        holder: req.worker.clone(),
        claimed_at: now,
        expires_at: now + Duration::seconds(req.lease_secs),
    });
    task.version += 1;
    task.updated_at = now;
    task.audit.push(
        AuditEntry::new(AuditKind::Claimed, format!("claimed by {}", req.worker)).with_context(
            serde_json::json!({ "from": from, "to": task.queue, "role": req.role }),
        ),
    );
}

/// Apply a versioned mutation in place.
pub fn apply_mutation(
    task: &mut Task,
    expected_version: u64,
    mutation: Mutation,
    patch: TaskPatch,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    if task.version != expected_version {
        return Err(StoreError::VersionConflict {
            id: task.id,
            expected: expected_version,
            actual: task.version,
        });
    }

    match mutation {
        Mutation::Submit => {
            task.submitted_at = Some(now);
            task.lease = None;
        }
        Mutation::Accept => {
            task.completed_at = Some(now);
            task.lease = None;
        }
        Mutation::Reject { feedback } => {
            task.rejection_count += 1;
            task.last_feedback = Some(feedback);
            task.lease = None;
        }
        Mutation::Update => {}
    }

    let TaskPatch {
        queue,
        description,
        branch,
        base_branch,
        priority,
        blocked_by,
        review_request,
        resume_queue,
        step_failure,
        lease,
        audit,
    } = patch;

    if let Some(queue) = queue
        && queue != task.queue
    {
        task.queue = queue;
        task.step_failure = None;
        if !task.queue.is_holding() {
            task.resume_queue = None;
        }
    }
    if let Some(d) = description {
        task.description = d;
    }
    if let Some(b) = branch {
        task.branch = Some(b);
    }
    if let Some(b) = base_branch {
        task.base_branch = b;
    }
    if let Some(p) = priority {
        task.priority = p;
    }
    if let Some(b) = blocked_by {
        task.blocked_by = Some(b);
    }
    if let Some(r) = review_request {
        task.review_request = Some(r);
    }
    if let Some(q) = resume_queue {
        task.resume_queue = Some(q);
    }
    if let Some(f) = step_failure {
        task.step_failure = Some(f);
    }
    match lease {
        LeaseChange::Keep => {}
        LeaseChange::Release => task.lease = None,
        LeaseChange::Renew { holder, secs } => {
            task.lease = Some(Lease {
                holder,
                claimed_at: now,
                expires_at: now + Duration::seconds(secs),
            });
        }
    }
    task.audit.extend(audit);
    task.version += 1;
    task.updated_at = now;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::ProjectStatus;

    fn req(worker: &str) -> ClaimRequest {
        ClaimRequest {
            role: RoleName::new("implementer"),
            worker: WorkerId::new(worker),
            flow: FlowName::default(),
            from: Queue::incoming(),
            to: Some(Queue::claimed()),
            match_task_role: true,
            lease_secs: 60,
            project: None,
            target: None,
        }
    }

    fn task(id: i64, priority: i32, age_secs: i64) -> Task {
        let mut new = NewTask::new(format!("task {id}"), RoleName::new("implementer"));
        new.priority = priority;
        build_task(
            TaskId(id),
            new,
            None,
            None,
            Utc::now() - Duration::seconds(age_secs),
        )
    }

    #[test]
    fn candidate_order_priority_then_age() {
        let tasks = vec![task(1, 0, 100), task(2, 5, 10), task(3, 5, 50)];
        let pick = pick_candidate(&tasks, &req("implementer-1"), Utc::now(), |_| true).unwrap();
        assert_eq!(pick.id, TaskId(3));
    }

    #[test]
    fn blocked_and_leased_tasks_are_skipped() {
        let now = Utc::now();
        let mut blocked = task(1, 10, 100);
        blocked.blocked_by = Some(TaskId(9));
        let mut leased = task(2, 10, 100);
        apply_claim(&mut leased, &req("implementer-2"), now);
        leased.queue = Queue::incoming();
        let free = task(3, 0, 0);
        let tasks = vec![blocked, leased, free];
        let pick = pick_candidate(&tasks, &req("implementer-1"), now, |_| false).unwrap();
        assert_eq!(pick.id, TaskId(3));

        // An expired lease is reclaimable.
        let later = now + Duration::seconds(61);
        let pick = pick_candidate(&tasks, &req("implementer-1"), later, |_| false).unwrap();
        assert_eq!(pick.id, TaskId(2));
    }

    #[test]
    fn gate_claim_ignores_task_role_and_keeps_queue() {
        let mut t = task(1, 0, 0);
        t.queue = Queue::provisional();
        let gate = ClaimRequest {
            role: RoleName::new("gatekeeper"),
            from: Queue::provisional(),
            to: None,
            match_task_role: false,
            ..req("gatekeeper-1")
        };
        assert!(is_claimable(&t, &gate, Utc::now(), |_| true));
        apply_claim(&mut t, &gate, Utc::now());
        assert_eq!(t.queue, Queue::provisional());
        assert_eq!(t.version, 2);
        assert!(t.is_held_by(&WorkerId::new("gatekeeper-1")));
    }

    #[test]
    fn reject_records_feedback_and_releases() {
        let now = Utc::now();
        let mut t = task(1, 0, 0);
        apply_claim(&mut t, &req("implementer-1"), now);
        apply_mutation(
            &mut t,
            2,
            Mutation::Reject {
                feedback: "tests fail".into(),
            },
            TaskPatch::to_queue(Queue::incoming()),
            now,
        )
        .unwrap();
        assert_eq!(t.queue, Queue::incoming());
        assert_eq!(t.rejection_count, 1);
        assert_eq!(t.last_feedback.as_deref(), Some("tests fail"));
        assert!(t.lease.is_none());
        assert_eq!(t.version, 3);
    }

    #[test]
    fn queue_change_clears_step_failure_and_resume_queue() {
        let now = Utc::now();
        let mut t = task(1, 0, 0);
        t.queue = Queue::needs_continuation();
        t.resume_queue = Some(Queue::claimed());
        t.step_failure = Some(StepFailure {
            step: crate::flow::StepName::PushBranch,
            reason: "offline".into(),
            attempts: 1,
            failed_at: now,
        });
        apply_mutation(&mut t, 1, Mutation::Update, TaskPatch::to_queue(Queue::claimed()), now)
            .unwrap();
        assert!(t.resume_queue.is_none());
        assert!(t.step_failure.is_none());
    }

    #[test]
    fn shared_branch_project_chains_and_inherits() {
        let project = Project {
            id: ProjectId(1),
            name: "p".into(),
            shared_branch: Some("proj/x".into()),
            base_branch: "develop".into(),
            status: ProjectStatus::Active,
            created_at: Utc::now(),
        };
        let mut new = NewTask::new("b", RoleName::new("implementer"));
        new.project = Some(ProjectId(1));
        let t = build_task(TaskId(2), new, Some(&project), Some(TaskId(1)), Utc::now());
        assert_eq!(t.blocked_by, Some(TaskId(1)));
        assert_eq!(t.branch.as_deref(), Some("proj/x"));
        assert_eq!(t.base_branch, "develop");
    }

    #[test]
    fn cycle_detection() {
        // 3 -> 2 -> 1
        let blockers = |id: TaskId| match id.0 {
            3 => Some(TaskId(2)),
            2 => Some(TaskId(1)),
            _ => None,
        };
        assert!(would_cycle(TaskId(1), TaskId(3), blockers));
        assert!(!would_cycle(TaskId(4), TaskId(3), blockers));
        assert!(would_cycle(TaskId(5), TaskId(5), blockers));
    }

    #[test]
    fn existing_claim_ignores_terminal_tasks() {
        let now = Utc::now();
        let mut a = task(1, 0, 0);
        apply_claim(&mut a, &req("implementer-1"), now);
        a.queue = Queue::done();
        let tasks = vec![a];
        assert!(existing_claim(&tasks, &WorkerId::new("implementer-1")).is_none());
    }
}
