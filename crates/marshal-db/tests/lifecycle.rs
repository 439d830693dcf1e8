//! End-to-end task lifecycles through the store layer: the same versioned
//! writes the flow engine performs, without running any workers.

use marshal_core::agent::WorkerId;
use marshal_core::error::StoreError;
use marshal_core::flow::FlowName;
use marshal_core::project::NewProject;
use marshal_core::role::RoleName;
use marshal_core::store::{ClaimRequest, LeaseChange, Mutation, NewTask, TaskFilter, TaskPatch};
use marshal_core::task::{AuditEntry, AuditKind, Queue};
use marshal_db::project_store::ProjectStore;
use marshal_db::task_store::TaskStore;

fn test_db() -> (tempfile::TempDir, redb::Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = marshal_db::open_db(&dir.path().join("lifecycle.redb")).unwrap();
    (dir, db)
}

fn implementer_claim(worker: &str) -> ClaimRequest {
    ClaimRequest {
        role: RoleName::new("implementer"),
        worker: WorkerId::new(worker),
        flow: FlowName::default(),
        from: Queue::incoming(),
        to: Some(Queue::claimed()),
        match_task_role: true,
        lease_secs: 600,
        project: None,
        target: None,
    }
}

fn gatekeeper_claim(worker: &str) -> ClaimRequest {
    ClaimRequest {
        role: RoleName::new("gatekeeper"),
        from: Queue::provisional(),
        to: None,
        match_task_role: false,
        ..implementer_claim(worker)
    }
}

/// incoming → claimed → provisional → (gate claim) → done.
#[test]
fn happy_path_lifecycle() {
    let (_dir, db) = test_db();
    let tasks = TaskStore::new(&db);

    let task = tasks
        .insert(NewTask::new(
            "Add i32.popcnt support",
            RoleName::new("implementer"),
        ))
        .unwrap();
    assert_eq!(task.queue, Queue::incoming());
    assert_eq!(
        task.branch_name(),
        "marshal/TASK-0001/add-i32-popcnt-support"
    );

    let claimed = tasks.claim(&implementer_claim("implementer-1")).unwrap().unwrap();
    assert_eq!(claimed.queue, Queue::claimed());

    let submitted = tasks
        .mutate(
            claimed.id,
            claimed.version,
            Mutation::Submit,
            TaskPatch::to_queue(Queue::provisional()),
        )
        .unwrap();
    assert!(submitted.submitted_at.is_some());
    assert!(submitted.lease.is_none());

    // The implementer's slot is free again; the gate claims in place.
    let gated = tasks.claim(&gatekeeper_claim("gatekeeper-1")).unwrap().unwrap();
    assert_eq!(gated.queue, Queue::provisional());
    assert!(gated.is_held_by(&WorkerId::new("gatekeeper-1")));

    let done = tasks
        .mutate(
            gated.id,
            gated.version,
            Mutation::Accept,
            TaskPatch::to_queue(Queue::done()),
        )
        .unwrap();
    assert!(done.is_terminal());
    assert!(done.completed_at.is_some());
    assert_eq!(done.version, 5);

    let kinds: Vec<AuditKind> = done.audit.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![AuditKind::Created, AuditKind::Claimed, AuditKind::Claimed]
    );
}

/// Rejection feedback survives claim churn and is visible to the next claimant.
#[test]
fn rejection_feedback_round_trip() {
    let (_dir, db) = test_db();
    let tasks = TaskStore::new(&db);
    tasks
        .insert(NewTask::new("fix parser", RoleName::new("implementer")))
        .unwrap();

    let t = tasks.claim(&implementer_claim("implementer-1")).unwrap().unwrap();
    let t = tasks
        .mutate(t.id, t.version, Mutation::Submit, TaskPatch::to_queue(Queue::provisional()))
        .unwrap();
    let t = tasks.claim(&gatekeeper_claim("gatekeeper-1")).unwrap().unwrap();
    let t = tasks
        .mutate(
            t.id,
            t.version,
            Mutation::Reject {
                feedback: "tests fail".into(),
            },
            TaskPatch::to_queue(Queue::incoming())
                .with_audit(AuditEntry::new(AuditKind::Rejected, "tests fail")),
        )
        .unwrap();
    assert_eq!(t.rejection_count, 1);

    let next = tasks.claim(&implementer_claim("implementer-2")).unwrap().unwrap();
    assert_eq!(next.id, t.id);
    assert_eq!(next.last_feedback.as_deref(), Some("tests fail"));
}

/// A continued task keeps its holder; the holder cannot take new work until
/// it resumes and finishes.
#[test]
fn continuation_holds_the_slot() {
    let (_dir, db) = test_db();
    let tasks = TaskStore::new(&db);
    tasks
        .insert(NewTask::new("long job", RoleName::new("implementer")))
        .unwrap();
    tasks
        .insert(NewTask::new("other", RoleName::new("implementer")))
        .unwrap();

    let t = tasks.claim(&implementer_claim("implementer-1")).unwrap().unwrap();
    let held = tasks
        .mutate(
            t.id,
            t.version,
            Mutation::Update,
            TaskPatch {
                queue: Some(Queue::needs_continuation()),
                resume_queue: Some(Queue::claimed()),
                ..TaskPatch::default()
            },
        )
        .unwrap();
    assert!(held.is_held_by(&WorkerId::new("implementer-1")));

    let err = tasks
        .claim(&implementer_claim("implementer-1"))
        .unwrap_err()
        .downcast::<StoreError>()
        .unwrap();
    assert!(matches!(err, StoreError::DuplicateClaim { .. }));

    let resumed = tasks
        .mutate(
            held.id,
            held.version,
            Mutation::Update,
            TaskPatch {
                queue: Some(Queue::claimed()),
                lease: LeaseChange::Renew {
                    holder: WorkerId::new("implementer-1"),
                    secs: 600,
                },
                ..TaskPatch::default()
            },
        )
        .unwrap();
    assert_eq!(resumed.queue, Queue::claimed());
    assert!(resumed.resume_queue.is_none());
}

/// Shared-branch project tasks run strictly one after another.
#[test]
fn shared_branch_project_serializes() {
    let (_dir, db) = test_db();
    let project = ProjectStore::new(&db)
        .insert(NewProject {
            name: "proj".into(),
            shared_branch: Some("proj/x".into()),
            base_branch: "main".into(),
        })
        .unwrap();
    let tasks = TaskStore::new(&db);
    for title in ["A", "B"] {
        let mut new = NewTask::new(title, RoleName::new("implementer"));
        new.project = Some(project.id);
        tasks.insert(new).unwrap();
    }

    let a = tasks.claim(&implementer_claim("implementer-1")).unwrap().unwrap();
    assert_eq!(a.title, "A");
    assert!(tasks.claim(&implementer_claim("implementer-2")).unwrap().is_none());

    let unblocked = tasks
        .list(&TaskFilter {
            blocked: Some(false),
            queues: vec![Queue::incoming()],
            ..TaskFilter::default()
        })
        .unwrap();
    assert!(unblocked.is_empty());

    tasks
        .mutate(a.id, a.version, Mutation::Accept, TaskPatch::to_queue(Queue::done()))
        .unwrap();
    let b = tasks.claim(&implementer_claim("implementer-2")).unwrap().unwrap();
    assert_eq!(b.title, "B");
    assert_eq!(b.branch_name(), "proj/x");
}
