//! Timer-driven background jobs, kept out of the scheduling tick.
//!
//! Both jobs are idempotent and take `now` explicitly, so a test can run
//! them "a day later" without waiting.

use crate::engine::FlowEngine;
use crate::event_bus::EventBus;
use crate::git::GitRepo;
use crate::worktree::{WorkspaceOwner, WorktreeManager};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use marshal_core::config::WorkspaceConfig;
use marshal_core::error::ControlError;
use marshal_core::event::EventKind;
use marshal_core::project::{Project, ProjectId};
use marshal_core::store::{TaskFilter, TaskStore};
use marshal_core::task::{AuditKind, Queue, Task, TaskId};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub archived: usize,
    pub removed: usize,
    pub branches_deleted: usize,
}

/// Archives logs, removes retired workspaces and discards pushed private
/// branches of terminal tasks older than the grace window.
pub struct Sweeper {
    store: Arc<dyn TaskStore>,
    worktrees: WorktreeManager,
    runtime_dir: PathBuf,
    archive_dir: PathBuf,
    grace: Duration,
    events: EventBus,
}

impl Sweeper {
    pub fn new(
        store: Arc<dyn TaskStore>,
        worktrees: WorktreeManager,
        config: &WorkspaceConfig,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            worktrees,
            runtime_dir: config.runtime_dir.clone(),
            archive_dir: config.archive_dir.clone(),
            grace: Duration::seconds(config.sweep_grace_secs),
            events,
        }
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let terminal = self
            .store
            .list(&TaskFilter {
                queues: vec![Queue::done(), Queue::failed()],
                ..TaskFilter::default()
            })
            .await?;
        let mut report = SweepReport::default();
        let mut projects: BTreeMap<ProjectId, Option<Project>> = BTreeMap::new();
        let mut shared = HashSet::new();

        for task in terminal.iter().filter(|t| t.updated_at + self.grace <= now) {
            if self.archive_logs(task.id)? {
                report.archived += 1;
            }

            let project = match task.project {
                Some(id) => self.project(&mut projects, id).await,
                None => None,
            };
            match WorkspaceOwner::for_task(task, project.as_ref()) {
                owner @ WorkspaceOwner::Task(_) => {
                    if self.remove_workspace(owner)? {
                        report.removed += 1;
                    }
                    if self.discard_private_branch(task) {
                        report.branches_deleted += 1;
                    }
                }
                WorkspaceOwner::Project(id) => {
                    shared.insert(id);
                }
            }
        }

        // A shared workspace goes once none of its project's tasks is live.
        for id in shared {
            let live = self
                .store
                .list(&TaskFilter {
                    project: Some(id),
                    ..TaskFilter::default()
                })
                .await?
                .iter()
                .any(|t| !t.is_terminal() || t.updated_at + self.grace > now);
            if !live && self.remove_workspace(WorkspaceOwner::Project(id))? {
                report.removed += 1;
            }
        }

        tracing::info!(
            archived = report.archived,
            removed = report.removed,
            branches_deleted = report.branches_deleted,
            "sweep completed"
        );
        self.events.emit(EventKind::SweepCompleted {
            archived: report.archived,
            removed: report.removed,
            branches_deleted: report.branches_deleted,
        });
        Ok(report)
    }

    async fn project(
        &self,
        cache: &mut BTreeMap<ProjectId, Option<Project>>,
        id: ProjectId,
    ) -> Option<Project> {
        if let Some(cached) = cache.get(&id) {
            return cached.clone();
        }
        let project = match self.store.get_project(id).await {
            Ok(p) => Some(p),
            Err(e) => {
                tracing::warn!(project = %id, error = %e, "project lookup failed during sweep");
                None
            }
        };
        cache.insert(id, project.clone());
        project
    }

    /// Move `<runtime>/tasks/TASK-NNNN` under the archive directory.
    fn archive_logs(&self, id: TaskId) -> Result<bool> {
        let src = self.runtime_dir.join("tasks").join(id.to_string());
        if !src.exists() {
            return Ok(false);
        }
        std::fs::create_dir_all(&self.archive_dir)
            .context(format!("failed to create {}", self.archive_dir.display()))?;
        let dst = self.archive_dir.join(id.to_string());
        if dst.exists() {
            // Left over from an earlier run of the same task.
            std::fs::remove_dir_all(&dst)
                .context(format!("failed to replace archive {}", dst.display()))?;
        }
        std::fs::rename(&src, &dst).context(format!(
            "failed to archive {} to {}",
            src.display(),
            dst.display()
        ))?;
        tracing::debug!(task = %id, archive = %dst.display(), "archived task logs");
        Ok(true)
    }

    fn remove_workspace(&self, owner: WorkspaceOwner) -> Result<bool> {
        let bound = self.worktrees.mark_pending_removal(owner)?.is_some();
        if !bound && !self.worktrees.path_for(owner).exists() {
            return Ok(false);
        }
        self.worktrees.remove(owner)?;
        Ok(true)
    }

    /// Delete the task's private branch locally once it is safely pushed.
    fn discard_private_branch(&self, task: &Task) -> bool {
        let branch = task.branch_name();
        let exists = GitRepo::open(self.worktrees.repo_dir())
            .and_then(|repo| repo.branch_tip(&branch))
            .map(|tip| tip.is_some())
            .unwrap_or(false);
        if !exists {
            return false;
        }
        match self.worktrees.discard_branch(&branch) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(task = %task.id, branch, error = ?e, "keeping branch");
                false
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Claims whose lease ran out.
    pub expired: Vec<TaskId>,
    /// Live-leased claims nobody is working on.
    pub orphaned: Vec<TaskId>,
}

/// Requeues claims that no tracked worker backs.
pub struct Reconciler {
    engine: Arc<FlowEngine>,
    /// How long an untracked claim may go without a write before it counts
    /// as orphaned.
    orphan_after: Duration,
}

impl Reconciler {
    pub fn new(engine: Arc<FlowEngine>, orphan_after: Duration) -> Self {
        Self {
            engine,
            orphan_after,
        }
    }

    pub async fn run(&self, tracked: &HashSet<TaskId>, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let tasks = self.engine.store().list(&TaskFilter::default()).await?;
        let mut report = ReconcileReport::default();

        for task in tasks.iter().filter(|t| !t.is_terminal()) {
            let Some(lease) = &task.lease else {
                continue;
            };
            if tracked.contains(&task.id) {
                continue;
            }
            let (incident, kind) = if lease.is_expired(now) {
                (
                    ControlError::LeaseExpired {
                        task: task.id,
                        holder: lease.holder.clone(),
                    },
                    AuditKind::LeaseExpired,
                )
            } else if !task.queue.is_holding() && task.updated_at + self.orphan_after <= now {
                (
                    ControlError::OrphanClaim {
                        task: task.id,
                        holder: lease.holder.clone(),
                    },
                    AuditKind::OrphanClaim,
                )
            } else {
                continue;
            };

            tracing::warn!(task = %task.id, incident = incident.kind(), "{incident}; requeueing");
            match self.engine.release(task, kind, &incident.to_string()).await {
                Ok(_) if kind == AuditKind::LeaseExpired => report.expired.push(task.id),
                Ok(_) => report.orphaned.push(task.id),
                Err(ControlError::Store(e)) if e.is_conflict() => {
                    tracing::debug!(task = %task.id, "task moved during reconciliation, skipping");
                }
                Err(e) => {
                    tracing::error!(task = %task.id, error = %e, "failed to requeue claim");
                }
            }
        }
        Ok(report)
    }
}
