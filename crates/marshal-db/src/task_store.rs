use crate::project_store::PROJECTS_TABLE;
use anyhow::{Context, Result};
use chrono::Utc;
use marshal_core::error::StoreError;
use marshal_core::project::{Project, ProjectId};
use marshal_core::store::{
    ClaimRequest, Mutation, NewTask, TaskFilter, TaskPatch, apply_claim, apply_mutation,
    build_task, existing_claim, is_claimable, pick_candidate, would_cycle,
};
use marshal_core::task::{Task, TaskId};
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::HashMap;

/// Tasks table: i64 task ID -> JSON-serialized Task.
pub const TASKS_TABLE: TableDefinition<i64, &str> = TableDefinition::new("tasks");

/// Auto-increment counter table: "next_task_id" / "next_project_id" -> i64.
pub const COUNTER_TABLE: TableDefinition<&str, i64> = TableDefinition::new("counters");

const NEXT_ID_KEY: &str = "next_task_id";

pub struct TaskStore<'a> {
    db: &'a Database,
}

impl<'a> TaskStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert a new task, assigning it an auto-incremented ID.
    ///
    /// Tasks in a shared-branch project are chained behind the project's
    /// latest unfinished task unless a blocker is given.
    pub fn insert(&self, new: NewTask) -> Result<Task> {
        let write_txn = self.db.begin_write()?;
        let task = {
            let mut tasks = write_txn.open_table(TASKS_TABLE)?;

            if let Some(blocker) = new.blocked_by
                && tasks.get(blocker.0)?.is_none()
            {
                return Err(StoreError::Invalid(format!("unknown blocker {blocker}")).into());
            }

            let project = match new.project {
                Some(pid) => {
                    let projects = write_txn.open_table(PROJECTS_TABLE)?;
                    let json = projects
                        .get(pid.0)?
                        .ok_or_else(|| StoreError::Invalid(format!("unknown project {pid}")))?;
                    Some(serde_json::from_str::<Project>(json.value())?)
                }
                None => None,
            };
            let chain_after = match &project {
                Some(p) if p.is_serialized() && new.blocked_by.is_none() => {
                    latest_open_in_project(&tasks, p.id)?
                }
                _ => None,
            };

            let mut counter = write_txn.open_table(COUNTER_TABLE)?;
            let next_id = counter.get(NEXT_ID_KEY)?.map(|v| v.value()).unwrap_or(1);
            counter.insert(NEXT_ID_KEY, next_id + 1)?;

            let task = build_task(TaskId(next_id), new, project.as_ref(), chain_after, Utc::now());
            let json = serde_json::to_string(&task)?;
            tasks.insert(next_id, json.as_str())?;
            task
        };
        write_txn.commit()?;
        tracing::debug!(task = %task.id, queue = %task.queue, "task created");
        Ok(task)
    }

    /// Get a task by ID.
    pub fn get(&self, id: TaskId) -> Result<Option<Task>> {
        let read_txn = self.db.begin_read()?;
        let tasks = read_txn.open_table(TASKS_TABLE)?;
        match tasks.get(id.0)? {
            Some(guard) => {
                let task: Task = serde_json::from_str(guard.value())?;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    /// List tasks matching `filter`, in ID order.
    pub fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TASKS_TABLE)?;
        let all = load_all(&table)?;
        let terminal: HashMap<TaskId, bool> =
            all.iter().map(|t| (t.id, t.is_terminal())).collect();

        Ok(all
            .into_iter()
            .filter(|t| filter.matches_fields(t))
            .filter(|t| match filter.blocked {
                None => true,
                Some(want) => {
                    let blocked = t
                        .blocked_by
                        .is_some_and(|b| !terminal.get(&b).copied().unwrap_or(true));
                    blocked == want
                }
            })
            .collect())
    }

    /// Atomically claim a task along one claim route.
    ///
    /// Uses a single write transaction to scan, pick and update; redb's
    /// single-writer lock prevents double-dispatch across threads/processes.
    /// A targeted claim whose expected version is stale fails with a version
    /// conflict and writes nothing.
    pub fn claim(&self, req: &ClaimRequest) -> Result<Option<Task>> {
        let now = Utc::now();
        let write_txn = self.db.begin_write()?;
        let result = {
            let mut tasks = write_txn.open_table(TASKS_TABLE)?;
            let all = load_all(&tasks)?;

            if let Some(held) = existing_claim(&all, &req.worker) {
                return Err(StoreError::DuplicateClaim {
                    worker: req.worker.clone(),
                    task: held.id,
                }
                .into());
            }

            let terminal: HashMap<TaskId, bool> =
                all.iter().map(|t| (t.id, t.is_terminal())).collect();
            let blocker_done = |id: TaskId| terminal.get(&id).copied().unwrap_or(true);

            let candidate = match req.target {
                Some(target) => {
                    let task = all
                        .iter()
                        .find(|t| t.id == target.id)
                        .ok_or(StoreError::NotFound(target.id))?;
                    if task.version != target.expected_version {
                        return Err(StoreError::VersionConflict {
                            id: task.id,
                            expected: target.expected_version,
                            actual: task.version,
                        }
                        .into());
                    }
                    is_claimable(task, req, now, blocker_done).then_some(task)
                }
                None => pick_candidate(&all, req, now, blocker_done),
            };

            match candidate.cloned() {
                Some(mut task) => {
                    apply_claim(&mut task, req, now);
                    let json = serde_json::to_string(&task)?;
                    tasks.insert(task.id.0, json.as_str())?;
                    Some(task)
                }
                None => None,
            }
        };
        write_txn.commit()?;
        if let Some(task) = &result {
            tracing::debug!(task = %task.id, worker = %req.worker, version = task.version, "claimed");
        }
        Ok(result)
    }

    /// Apply a versioned mutation (submit, accept, reject or update).
    pub fn mutate(
        &self,
        id: TaskId,
        expected_version: u64,
        mutation: Mutation,
        patch: TaskPatch,
    ) -> Result<Task> {
        let write_txn = self.db.begin_write()?;
        let task = {
            let mut tasks = write_txn.open_table(TASKS_TABLE)?;
            let mut task: Task = {
                let guard = tasks.get(id.0)?.ok_or(StoreError::NotFound(id))?;
                serde_json::from_str(guard.value())?
            };

            if let Some(blocker) = patch.blocked_by {
                let all = load_all(&tasks)?;
                let blockers: HashMap<TaskId, Option<TaskId>> =
                    all.iter().map(|t| (t.id, t.blocked_by)).collect();
                if !blockers.contains_key(&blocker) {
                    return Err(StoreError::Invalid(format!("unknown blocker {blocker}")).into());
                }
                if would_cycle(id, blocker, |t| blockers.get(&t).copied().flatten()) {
                    return Err(StoreError::Invalid(format!(
                        "blocking {id} on {blocker} would create a dependency cycle"
                    ))
                    .into());
                }
            }

            apply_mutation(&mut task, expected_version, mutation, patch, Utc::now())?;
            let json = serde_json::to_string(&task)?;
            tasks.insert(id.0, json.as_str())?;
            task
        };
        write_txn.commit()?;
        Ok(task)
    }

    /// Count tasks per queue.
    pub fn queue_counts(&self) -> Result<HashMap<String, usize>> {
        let mut counts = HashMap::new();
        for task in self.list(&TaskFilter::default())? {
            *counts.entry(task.queue.to_string()).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

fn load_all(table: &impl ReadableTable<i64, &'static str>) -> Result<Vec<Task>> {
    let mut result = Vec::new();
    for entry in table.iter()? {
        let (_, value) = entry?;
        let task: Task =
            serde_json::from_str(value.value()).context("corrupt task record in store")?;
        result.push(task);
    }
    Ok(result)
}

fn latest_open_in_project(
    tasks: &impl ReadableTable<i64, &'static str>,
    project: ProjectId,
) -> Result<Option<TaskId>> {
    Ok(load_all(tasks)?
        .into_iter()
        .filter(|t| t.project == Some(project) && !t.is_terminal())
        .max_by_key(|t| (t.created_at, t.id))
        .map(|t| t.id))
}
