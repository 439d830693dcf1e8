//! The scheduling loop.
//!
//! Every tick:
//! - probes tracked workers and feeds finished ones to the flow engine,
//!   dropping a tracking entry only after the resulting write is durable;
//! - advances tasks sitting on transitions no role works (no claim into the
//!   queue and no delegated gate);
//! - fills idle worker slots, resuming held tasks first and otherwise
//!   claiming along the flow's claim routes.
//!
//! Reconciliation and sweeping run on their own timers.

use crate::engine::{EngineOutcome, FlowEngine};
use crate::housekeeping::{Reconciler, Sweeper};
use crate::worker::{self, Completion, ResultSource, WorkerHandle, WorkerLaunch};
use crate::worktree::{Workspace, WorkspaceOwner, WorktreeManager};
use anyhow::Result;
use chrono::Utc;
use marshal_core::agent::WorkerId;
use marshal_core::config::{PipelineConfig, SchedulerConfig, WorkspaceConfig};
use marshal_core::error::{ControlError, StoreError};
use marshal_core::event::{EventKind, LogLevel};
use marshal_core::flow::ClaimRoute;
use marshal_core::project::Project;
use marshal_core::result::{Outcome, WorkerResult};
use marshal_core::role::{RoleConfig, RoleName, RolesConfig};
use marshal_core::store::{ClaimRequest, ClaimTarget, TaskFilter, TaskPatch, TaskStore};
use marshal_core::task::{AuditEntry, AuditKind, Task, TaskId};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub started: Vec<TaskId>,
    pub resumed: Vec<TaskId>,
    pub finished: Vec<TaskId>,
    pub resolved: Vec<(TaskId, EngineOutcome)>,
}

enum RunState {
    Running(WorkerHandle),
    /// Exited; waiting for its transition to be written.
    Finished {
        completion: Box<Completion>,
        crash_recorded: bool,
    },
}

impl RunState {
    fn task_id(&self) -> TaskId {
        match self {
            RunState::Running(handle) => handle.session.task_id,
            RunState::Finished { completion, .. } => completion.session.task_id,
        }
    }
}

enum Settle {
    Done(EngineOutcome),
    Retry {
        completion: Box<Completion>,
        crash_recorded: bool,
        outcome: Option<EngineOutcome>,
    },
    /// The claim belongs to someone else now.
    Dropped,
}

pub struct Scheduler {
    engine: Arc<FlowEngine>,
    worktrees: WorktreeManager,
    roles: RolesConfig,
    config: SchedulerConfig,
    workspace: WorkspaceConfig,
    reconciler: Reconciler,
    sweeper: Sweeper,
    tracked: HashMap<WorkerId, RunState>,
}

impl Scheduler {
    pub fn new(engine: Arc<FlowEngine>, worktrees: WorktreeManager, config: &PipelineConfig) -> Self {
        let reconciler = Reconciler::new(
            Arc::clone(&engine),
            chrono::Duration::seconds(config.scheduler.orphan_secs),
        );
        let sweeper = Sweeper::new(
            Arc::clone(engine.store()),
            worktrees.clone(),
            &config.workspace,
            engine.events().clone(),
        );
        Self {
            engine,
            worktrees,
            roles: config.roles.clone(),
            config: config.scheduler.clone(),
            workspace: config.workspace.clone(),
            reconciler,
            sweeper,
            tracked: HashMap::new(),
        }
    }

    fn store(&self) -> &Arc<dyn TaskStore> {
        self.engine.store()
    }

    /// Number of slots with a tracked worker (running or awaiting its write).
    pub fn live_workers(&self) -> usize {
        self.tracked.len()
    }

    pub fn tracked_tasks(&self) -> HashSet<TaskId> {
        self.tracked.values().map(RunState::task_id).collect()
    }

    /// Drive the three timers until `shutdown` fires.
    ///
    /// Live workers are external processes; they are left running with
    /// their leases on shutdown.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let mut tick = tokio::time::interval(Duration::from_secs(self.config.tick_secs.max(1)));
        let mut reconcile =
            tokio::time::interval(Duration::from_secs(self.config.reconcile_secs.max(1)));
        let mut sweep = tokio::time::interval(Duration::from_secs(self.config.sweep_secs.max(1)));
        for timer in [&mut tick, &mut reconcile, &mut sweep] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        tracing::info!(
            roles = self.roles.roles.len(),
            slots = self.roles.total_slots(),
            max_workers = self.config.max_workers,
            "scheduler started"
        );
        self.engine.events().emit(EventKind::EngineLog {
            level: LogLevel::Info,
            message: format!(
                "scheduler started ({} slots, max_workers={})",
                self.roles.total_slots(),
                self.config.max_workers
            ),
        });

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("shutdown requested");
                    break;
                }
                _ = tick.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = ?e, "scheduler tick failed");
                    }
                }
                _ = reconcile.tick() => {
                    let tracked = self.tracked_tasks();
                    if let Err(e) = self.reconciler.run(&tracked, Utc::now()).await {
                        tracing::error!(error = ?e, "reconciliation failed");
                    }
                }
                _ = sweep.tick() => {
                    if let Err(e) = self.sweeper.run(Utc::now()).await {
                        tracing::error!(error = ?e, "sweep failed");
                    }
                }
            }
        }

        tracing::info!(live = self.tracked.len(), "scheduler stopped");
        self.engine.events().emit(EventKind::EngineLog {
            level: LogLevel::Info,
            message: format!("scheduler stopped with {} live worker(s)", self.tracked.len()),
        });
        Ok(())
    }

    pub async fn tick(&mut self) -> Result<TickReport> {
        let mut report = TickReport::default();
        self.observe(&mut report).await;
        self.advance_unattended(&mut report).await?;
        self.dispatch(&mut report).await?;
        Ok(report)
    }

    // ─── Completion ─────────────────────────────────────────────────────

    async fn observe(&mut self, report: &mut TickReport) {
        let workers: Vec<WorkerId> = self.tracked.keys().cloned().collect();
        for worker in workers {
            let Some(state) = self.tracked.remove(&worker) else {
                continue;
            };
            let (completion, crash_recorded) = match state {
                RunState::Running(mut handle) => match handle.poll() {
                    Ok(None) => {
                        self.tracked.insert(worker, RunState::Running(handle));
                        continue;
                    }
                    Ok(Some(exit)) => {
                        let completion = handle.collect(exit);
                        self.finished(&completion);
                        report.finished.push(completion.session.task_id);
                        (Box::new(completion), false)
                    }
                    Err(e) => {
                        tracing::warn!(worker = %worker, error = ?e, "liveness probe failed");
                        self.tracked.insert(worker, RunState::Running(handle));
                        continue;
                    }
                },
                RunState::Finished {
                    completion,
                    crash_recorded,
                } => (completion, crash_recorded),
            };

            let task_id = completion.session.task_id;
            match self.settle(&worker, completion, crash_recorded).await {
                Settle::Done(outcome) => report.resolved.push((task_id, outcome)),
                Settle::Retry {
                    completion,
                    crash_recorded,
                    outcome,
                } => {
                    if let Some(outcome) = outcome {
                        report.resolved.push((task_id, outcome));
                    }
                    self.tracked.insert(
                        worker,
                        RunState::Finished {
                            completion,
                            crash_recorded,
                        },
                    );
                }
                Settle::Dropped => {}
            }
        }
    }

    fn finished(&self, completion: &Completion) {
        let session = &completion.session;
        tracing::info!(
            worker = %session.worker,
            task = %session.task_id,
            exit_code = ?completion.exit.exit_code,
            timed_out = completion.exit.timed_out,
            elapsed_secs = session.elapsed_secs(),
            "worker finished"
        );
        self.engine.events().emit(EventKind::WorkerFinished {
            worker: session.worker.clone(),
            task_id: session.task_id,
            exit_code: completion.exit.exit_code,
            has_result: completion.source == ResultSource::Reported,
            elapsed_secs: session.elapsed_secs(),
        });
    }

    /// Apply a finished worker's result. Tracking survives anything short
    /// of a durable transition or a lost claim.
    async fn settle(
        &self,
        worker: &WorkerId,
        completion: Box<Completion>,
        mut crash_recorded: bool,
    ) -> Settle {
        let task_id = completion.session.task_id;
        let mut task = match self.store().get(task_id).await {
            Ok(task) => task,
            Err(e) => {
                tracing::warn!(task = %task_id, error = %e, "failed to load finished task");
                return Settle::Retry {
                    completion,
                    crash_recorded,
                    outcome: None,
                };
            }
        };
        if !task.is_held_by(worker) {
            tracing::warn!(
                worker = %worker,
                task = %task_id,
                holder = ?task.lease_holder(),
                "claim lost before the result was applied, dropping it"
            );
            return Settle::Dropped;
        }

        if let ResultSource::Synthesized { detail, new_commits } = &completion.source
            && !crash_recorded
        {
            let incident = ControlError::WorkerCrash {
                task: task_id,
                detail: detail.clone(),
            };
            let patch = TaskPatch::default().with_audit(
                AuditEntry::new(AuditKind::WorkerCrash, incident.to_string()).with_context(json!({
                    "kind": incident.kind(),
                    "exit_code": completion.exit.exit_code,
                    "timed_out": completion.exit.timed_out,
                    "new_commits": new_commits,
                })),
            );
            match self.store().update(task.id, task.version, patch).await {
                Ok(updated) => {
                    task = updated;
                    crash_recorded = true;
                }
                Err(e) => {
                    tracing::warn!(task = %task_id, error = %e, "failed to record worker crash");
                    return Settle::Retry {
                        completion,
                        crash_recorded,
                        outcome: None,
                    };
                }
            }
        }

        match self
            .engine
            .resolve_and_advance(&task, &completion.result, Some(&completion.workspace))
            .await
        {
            Ok(resolution) => match resolution.outcome {
                outcome @ EngineOutcome::StepFailed { .. } => Settle::Retry {
                    completion,
                    crash_recorded,
                    outcome: Some(outcome),
                },
                EngineOutcome::Held => Settle::Done(EngineOutcome::Held),
                outcome => {
                    let success = completion.result.outcome == Outcome::Success
                        && !completion.result.is_rejection()
                        && matches!(outcome, EngineOutcome::Advanced { .. });
                    self.retire(&completion.workspace, success);
                    Settle::Done(outcome)
                }
            },
            Err(ControlError::Store(e)) if e.is_conflict() => {
                match self.store().get(task_id).await {
                    Ok(current) if !current.is_held_by(worker) => {
                        tracing::warn!(worker = %worker, task = %task_id, "lost the race for this task");
                        Settle::Dropped
                    }
                    _ => Settle::Retry {
                        completion,
                        crash_recorded,
                        outcome: None,
                    },
                }
            }
            Err(e) => {
                tracing::error!(task = %task_id, error = %e, "failed to apply worker result");
                Settle::Retry {
                    completion,
                    crash_recorded,
                    outcome: None,
                }
            }
        }
    }

    fn retire(&self, workspace: &Workspace, success: bool) {
        if let Err(e) = self.worktrees.retire(workspace, success) {
            tracing::warn!(path = %workspace.path.display(), error = ?e, "failed to retire workspace");
        }
    }

    // ─── Unattended transitions ─────────────────────────────────────────

    /// Advance tasks waiting on work edges that no worker role ever claims.
    async fn advance_unattended(&self, report: &mut TickReport) -> Result<()> {
        let now = Utc::now();
        let mut edges = Vec::new();
        for flow in self.engine.flows().iter() {
            for t in &flow.transitions {
                let claimed_into = flow
                    .transitions
                    .iter()
                    .any(|c| c.is_claim_edge() && c.to == t.from);
                if !t.is_claim_edge() && t.delegated_to().next().is_none() && !claimed_into {
                    edges.push((flow.name.clone(), t.from.clone()));
                }
            }
        }

        let result = WorkerResult::success();
        for (flow, queue) in edges {
            let waiting = self.store().list(&TaskFilter::in_queue(queue)).await?;
            for task in waiting
                .iter()
                .filter(|t| t.flow_name() == flow && !t.has_live_lease(now))
            {
                let workspace = self.binding_for(task).await;
                match self
                    .engine
                    .resolve_and_advance(task, &result, workspace.as_ref())
                    .await
                {
                    Ok(resolution) => report.resolved.push((task.id, resolution.outcome)),
                    Err(ControlError::Store(e)) if e.is_conflict() => {
                        tracing::debug!(task = %task.id, "task moved underneath, skipping");
                    }
                    Err(e) => tracing::error!(task = %task.id, error = %e, "unattended advance failed"),
                }
            }
        }
        Ok(())
    }

    async fn binding_for(&self, task: &Task) -> Option<Workspace> {
        let project = self.project_of(task).await;
        let owner = WorkspaceOwner::for_task(task, project.as_ref());
        self.worktrees.binding(owner).ok().flatten()
    }

    async fn project_of(&self, task: &Task) -> Option<Project> {
        let id = task.project?;
        match self.store().get_project(id).await {
            Ok(project) => Some(project),
            Err(e) => {
                tracing::warn!(task = %task.id, project = %id, error = %e, "project lookup failed");
                None
            }
        }
    }

    // ─── Dispatch ───────────────────────────────────────────────────────

    async fn dispatch(&mut self, report: &mut TickReport) -> Result<()> {
        let roles: Vec<(RoleName, RoleConfig)> = self
            .roles
            .iter()
            .map(|(name, config)| (name.clone(), config.clone()))
            .collect();

        for (role, config) in &roles {
            let mut exhausted = false;
            for n in 1..=config.max_concurrent {
                if self.tracked.len() >= self.config.max_workers {
                    tracing::debug!(max_workers = self.config.max_workers, "global ceiling reached");
                    return Ok(());
                }
                let worker = WorkerId::slot(role, n);
                if self.tracked.contains_key(&worker) {
                    continue;
                }

                let held = self
                    .store()
                    .list(&TaskFilter::claimed_by(worker.clone()))
                    .await?;
                if let Some(task) = held.into_iter().find(|t| !t.is_terminal()) {
                    if task.queue.is_holding() {
                        self.resume(task, &worker, role, config, report).await;
                    } else {
                        tracing::debug!(
                            worker = %worker,
                            task = %task.id,
                            "slot holds an untracked claim, leaving it to reconciliation"
                        );
                    }
                    continue;
                }

                if exhausted {
                    continue;
                }
                match self.claim_for(role, &worker).await? {
                    Some(task) => self.start(task, &worker, role, config, report).await,
                    None => exhausted = true,
                }
            }
        }
        Ok(())
    }

    /// Claim the best candidate along the role's claim routes.
    ///
    /// Each claim is pinned to the version we listed; losing that race is a
    /// benign `ClaimConflict` and we move to the next candidate.
    async fn claim_for(&self, role: &RoleName, worker: &WorkerId) -> Result<Option<Task>> {
        let now = Utc::now();
        for route in self.engine.flows().claim_routes_for(role) {
            let mut candidates: Vec<Task> = self
                .store()
                .list(&TaskFilter {
                    queues: vec![route.from.clone()],
                    role: route.match_task_role.then(|| role.clone()),
                    blocked: Some(false),
                    ..TaskFilter::default()
                })
                .await?
                .into_iter()
                .filter(|t| t.flow_name() == route.flow && !t.has_live_lease(now))
                .collect();
            candidates.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.cmp(&b.id))
            });

            for candidate in candidates {
                let req = self.claim_request(&route, worker, &candidate);
                match self.store().claim(&req).await {
                    Ok(Some(task)) => {
                        tracing::info!(worker = %worker, task = %task.id, queue = %task.queue, "claimed task");
                        self.engine.events().emit(EventKind::TaskClaimed {
                            task_id: task.id,
                            worker: worker.clone(),
                            queue: task.queue.clone(),
                        });
                        return Ok(Some(task));
                    }
                    Ok(None) => continue,
                    Err(StoreError::VersionConflict { .. }) => {
                        let incident = ControlError::ClaimConflict { task: candidate.id };
                        tracing::debug!(worker = %worker, incident = incident.kind(), "{incident}");
                        self.engine.events().emit(EventKind::ClaimConflict {
                            task_id: candidate.id,
                            worker: worker.clone(),
                        });
                    }
                    Err(StoreError::DuplicateClaim { task, .. }) => {
                        tracing::debug!(worker = %worker, task = %task, "slot already holds a claim");
                        return Ok(None);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(None)
    }

    fn claim_request(&self, route: &ClaimRoute, worker: &WorkerId, candidate: &Task) -> ClaimRequest {
        ClaimRequest {
            role: route.role.clone(),
            worker: worker.clone(),
            flow: route.flow.clone(),
            from: route.from.clone(),
            to: route.to.clone(),
            match_task_role: route.match_task_role,
            lease_secs: self.config.lease_secs,
            project: None,
            target: Some(ClaimTarget {
                id: candidate.id,
                expected_version: candidate.version,
            }),
        }
    }

    async fn start(
        &mut self,
        task: Task,
        worker: &WorkerId,
        role: &RoleName,
        config: &RoleConfig,
        report: &mut TickReport,
    ) {
        let project = self.project_of(&task).await;
        let prepared = self
            .worktrees
            .prepare(&task, project.as_ref())
            .and_then(|ws| self.worktrees.begin_claim(ws));
        let workspace = match prepared {
            Ok(ws) => ws,
            Err(e) => {
                self.release(&task, format!("workspace setup failed: {e:#}")).await;
                return;
            }
        };
        self.engine.events().emit(EventKind::WorkspacePrepared {
            task_id: task.id,
            path: workspace.path.clone(),
            branch: workspace.branch.clone(),
        });
        if self.launch(&task, worker, role, config, &workspace).await {
            report.started.push(task.id);
        }
    }

    /// Continue a held task in its preserved workspace.
    async fn resume(
        &mut self,
        task: Task,
        worker: &WorkerId,
        role: &RoleName,
        config: &RoleConfig,
        report: &mut TickReport,
    ) {
        let task = match self.engine.resume(&task, worker).await {
            Ok(task) => task,
            Err(e) => {
                tracing::warn!(worker = %worker, task = %task.id, error = %e, "failed to resume held task");
                return;
            }
        };
        let project = self.project_of(&task).await;
        let workspace = match self.worktrees.prepare(&task, project.as_ref()) {
            Ok(ws) => ws,
            Err(e) => {
                self.release(&task, format!("workspace setup failed on resume: {e:#}"))
                    .await;
                return;
            }
        };
        if self.launch(&task, worker, role, config, &workspace).await {
            tracing::info!(worker = %worker, task = %task.id, "resumed held task");
            report.resumed.push(task.id);
        }
    }

    async fn launch(
        &mut self,
        task: &Task,
        worker: &WorkerId,
        role: &RoleName,
        config: &RoleConfig,
        workspace: &Workspace,
    ) -> bool {
        let runtime_dir = self.workspace.task_runtime_dir(task.id);
        let timeout = Duration::from_secs(
            config
                .timeout_secs
                .unwrap_or(self.config.worker_timeout_secs),
        );
        let spawned = worker::spawn(WorkerLaunch {
            worker,
            role,
            config,
            task,
            workspace,
            runtime_dir: &runtime_dir,
            timeout,
        });
        match spawned {
            Ok(handle) => {
                self.engine.events().emit(EventKind::WorkerStarted {
                    worker: worker.clone(),
                    task_id: task.id,
                    pid: handle.pid(),
                });
                self.tracked.insert(worker.clone(), RunState::Running(handle));
                true
            }
            Err(e) => {
                self.release(task, format!("worker spawn failed: {e:#}")).await;
                false
            }
        }
    }

    async fn release(&self, task: &Task, reason: String) {
        tracing::warn!(task = %task.id, reason = %reason, "releasing claim");
        if let Err(e) = self.engine.release(task, AuditKind::Released, &reason).await {
            tracing::error!(task = %task.id, error = %e, "failed to release claim");
        }
    }
}
