//! Concurrency tests for atomic task claiming.
//!
//! Validates that claims never double-dispatch, and that a claim pinned to a
//! version loses cleanly when another writer gets there first.

use marshal_core::agent::WorkerId;
use marshal_core::error::StoreError;
use marshal_core::flow::FlowName;
use marshal_core::role::RoleName;
use marshal_core::store::{ClaimRequest, ClaimTarget, Mutation, NewTask, TaskPatch};
use marshal_core::task::{Queue, TaskId};
use marshal_db::task_store::TaskStore;
use std::collections::HashSet;
use std::sync::{Arc, Barrier};

fn test_db() -> redb::Database {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("parallel.redb");
    let db = marshal_db::open_db(&path).unwrap();
    // Leak the tempdir so the file outlives the test
    std::mem::forget(dir);
    db
}

fn claim_req(worker: String) -> ClaimRequest {
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

/// 10 threads each claim from a pool of 10 tasks using a shared
/// Arc<Database>. Each worker identity can hold one claim, so every task is
/// claimed exactly once by a distinct worker.
#[test]
fn concurrent_claims_no_double_dispatch() {
    let db = Arc::new(test_db());
    {
        let store = TaskStore::new(&db);
        for i in 0..10 {
            store
                .insert(NewTask::new(format!("Task {i}"), RoleName::new("implementer")))
                .unwrap();
        }
    }

    let barrier = Arc::new(Barrier::new(10));
    let mut handles = Vec::new();
    for thread_id in 0..10 {
        let db = Arc::clone(&db);
        let barrier = Arc::clone(&barrier);
        handles.push(std::thread::spawn(move || {
            let store = TaskStore::new(&db);
            barrier.wait();
            store
                .claim(&claim_req(format!("implementer-{thread_id}")))
                .unwrap()
                .map(|t| t.id.0)
        }));
    }

    let claimed: Vec<i64> = handles
        .into_iter()
        .filter_map(|h| h.join().unwrap())
        .collect();
    let unique: HashSet<i64> = claimed.iter().copied().collect();
    assert_eq!(
        unique.len(),
        claimed.len(),
        "duplicate task claims detected: {claimed:?}"
    );
    assert_eq!(unique.len(), 10, "not all tasks were claimed");
}

/// Two ticks race to claim the same task at version 5: exactly one wins and
/// sees version 6; the loser gets a conflict and moves to the next candidate.
#[test]
fn racing_targeted_claims_have_one_winner() {
    let db = Arc::new(test_db());
    let target = {
        let store = TaskStore::new(&db);
        let task = store
            .insert(NewTask::new("contended", RoleName::new("implementer")))
            .unwrap();
        store
            .insert(NewTask::new("spare", RoleName::new("implementer")))
            .unwrap();
        let mut version = task.version;
        while version < 5 {
            version = store
                .mutate(task.id, version, Mutation::Update, TaskPatch::default())
                .unwrap()
                .version;
        }
        assert_eq!(version, 5);
        ClaimTarget {
            id: task.id,
            expected_version: 5,
        }
    };

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (1..=2)
        .map(|n| {
            let db = Arc::clone(&db);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                let store = TaskStore::new(&db);
                let mut req = claim_req(format!("implementer-{n}"));
                req.target = Some(target);
                barrier.wait();
                match store.claim(&req) {
                    Ok(claimed) => Ok(claimed),
                    Err(err) => {
                        let err = err.downcast::<StoreError>().unwrap();
                        assert!(matches!(err, StoreError::VersionConflict { .. }));
                        // Lost the race: try the next candidate.
                        req.target = None;
                        Err(store.claim(&req).unwrap())
                    }
                }
            })
        })
        .collect();

    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners: Vec<_> = outcomes
        .iter()
        .filter_map(|o| o.as_ref().ok())
        .flatten()
        .collect();
    assert_eq!(winners.len(), 1, "exactly one targeted claim succeeds");
    assert_eq!(winners[0].id, target.id);
    assert_eq!(winners[0].version, 6);

    let fallback: Vec<_> = outcomes
        .iter()
        .filter_map(|o| o.as_ref().err())
        .flatten()
        .collect();
    assert_eq!(fallback.len(), 1);
    assert_eq!(fallback[0].id, TaskId(2));
}

/// Concurrent mutations at the same expected version: one commits, the rest
/// see a conflict and leave the task untouched.
#[test]
fn concurrent_updates_one_commit_per_version() {
    let db = Arc::new(test_db());
    let id = TaskStore::new(&db)
        .insert(NewTask::new("t", RoleName::new("implementer")))
        .unwrap()
        .id;

    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let db = Arc::clone(&db);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                let store = TaskStore::new(&db);
                let patch = TaskPatch {
                    priority: Some(i),
                    ..TaskPatch::default()
                };
                barrier.wait();
                store.mutate(id, 1, Mutation::Update, patch).is_ok()
            })
        })
        .collect();

    let successes = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|ok| *ok)
        .count();
    assert_eq!(successes, 1);
    assert_eq!(TaskStore::new(&db).get(id).unwrap().unwrap().version, 2);
}
