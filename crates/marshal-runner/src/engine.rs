//! The flow engine: turns a worker's result into exactly one state
//! transition.
//!
//! Steps run before the transition and never move the task themselves; only
//! the engine writes the queue, and every write is checked against the
//! task's flow first.

use crate::event_bus::EventBus;
use crate::steps::{StepContext, StepOutput, StepRegistry};
use crate::worktree::Workspace;
use chrono::Utc;
use marshal_core::agent::WorkerId;
use marshal_core::config::SchedulerConfig;
use marshal_core::error::ControlError;
use marshal_core::event::EventKind;
use marshal_core::flow::{ConditionKind, Flow, FlowSet, StepName, Transition};
use marshal_core::result::{Outcome, WorkerResult};
use marshal_core::store::{LeaseChange, TaskPatch, TaskStore};
use marshal_core::task::{AuditEntry, AuditKind, Queue, StepFailure, Task};
use serde_json::json;
use std::sync::Arc;

/// Ceilings the engine enforces.
#[derive(Debug, Clone, Copy)]
pub struct EngineLimits {
    /// Consecutive failed attempts at a transition's steps before escalating.
    pub step_retry_limit: u32,
    /// Rejections tolerated before a task is failed.
    pub rejection_limit: u32,
    /// Lease renewal while a held or retried task keeps its claim.
    pub lease_secs: i64,
}

impl From<&SchedulerConfig> for EngineLimits {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            step_retry_limit: config.step_retry_limit,
            rejection_limit: config.rejection_limit,
            lease_secs: config.lease_secs,
        }
    }
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOutcome {
    Advanced { from: Queue, to: Queue },
    /// A step failed; the task stays put and keeps its claim.
    StepFailed {
        step: StepName,
        reason: String,
        attempt: u32,
    },
    /// Forced into the failure queue.
    Escalated { reason: String },
    /// Parked in the holding queue for the same worker to resume.
    Held,
}

/// The task as written, and what happened to it.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub task: Task,
    pub outcome: EngineOutcome,
}

enum Write {
    /// `accept` into terminal queues, `submit` otherwise.
    Advance,
    Reject(String),
    Update,
}

pub struct FlowEngine {
    store: Arc<dyn TaskStore>,
    flows: Arc<FlowSet>,
    steps: Arc<StepRegistry>,
    events: EventBus,
    limits: EngineLimits,
}

impl FlowEngine {
    pub fn new(
        store: Arc<dyn TaskStore>,
        flows: Arc<FlowSet>,
        steps: Arc<StepRegistry>,
        events: EventBus,
        limits: EngineLimits,
    ) -> Self {
        Self {
            store,
            flows,
            steps,
            events,
            limits,
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn flows(&self) -> &FlowSet {
        &self.flows
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Resolve `result` against the task's flow and apply the transition.
    pub async fn resolve_and_advance(
        &self,
        task: &Task,
        result: &WorkerResult,
        workspace: Option<&Workspace>,
    ) -> Result<Resolution, ControlError> {
        let flow = self.flows.resolve(task.flow.as_ref())?;
        let transition = flow.transition_from(&task.queue);
        tracing::debug!(
            task = %task.id,
            queue = %task.queue,
            outcome = ?result.outcome,
            decision = ?result.decision,
            "resolving worker result"
        );

        match result.outcome {
            Outcome::Failure => {
                let to = transition
                    .and_then(Transition::on_fail)
                    .cloned()
                    .unwrap_or_else(|| flow.failure_queue());
                let reason = result
                    .comment
                    .clone()
                    .unwrap_or_else(|| "worker reported failure".into());
                let patch = TaskPatch::to_queue(to.clone()).release().with_audit(
                    AuditEntry::new(AuditKind::Transition, format!("worker failure: {reason}"))
                        .with_context(json!({ "from": task.queue, "to": to })),
                );
                let updated = self.write(task, flow, &to, Write::Advance, patch).await?;
                Ok(Resolution {
                    task: updated,
                    outcome: EngineOutcome::Advanced {
                        from: task.queue.clone(),
                        to,
                    },
                })
            }
            Outcome::NeedsContinuation => self.hold(task, flow).await,
            Outcome::Success => {
                let Some(transition) = transition else {
                    let reason = format!("no transition out of {}", task.queue);
                    return self.escalate(task, flow, reason, Vec::new()).await;
                };

                if result.is_rejection() {
                    let gate = transition
                        .conditions
                        .iter()
                        .find(|c| c.kind == ConditionKind::Delegated);
                    let on_fail = gate
                        .and_then(|c| c.on_fail.clone())
                        .or_else(|| transition.on_fail().cloned());
                    let feedback = result
                        .comment
                        .clone()
                        .unwrap_or_else(|| "rejected without comment".into());
                    let steps = transition.rejection_steps();
                    return self
                        .reject(task, flow, feedback, on_fail, &steps, result, workspace)
                        .await;
                }

                for condition in transition
                    .conditions
                    .iter()
                    .filter(|c| c.kind == ConditionKind::Automatic)
                {
                    let check = condition.check_step();
                    if let Err(reason) = self.run_step(check, task, result, workspace).await {
                        let feedback = format!("{} failed: {reason}", condition.name);
                        let on_fail = condition
                            .on_fail
                            .clone()
                            .or_else(|| transition.on_fail().cloned());
                        return self
                            .reject(
                                task,
                                flow,
                                feedback,
                                on_fail,
                                &condition.on_fail_steps,
                                result,
                                workspace,
                            )
                            .await;
                    }
                }

                self.run_transition(task, flow, transition, result, workspace)
                    .await
            }
        }
    }

    async fn run_transition(
        &self,
        task: &Task,
        flow: &Flow,
        transition: &Transition,
        result: &WorkerResult,
        workspace: Option<&Workspace>,
    ) -> Result<Resolution, ControlError> {
        let mut working = task.clone();
        let mut audit = Vec::new();
        for &name in &transition.steps {
            match self.run_step(name, &working, result, workspace).await {
                Ok(output) => absorb(&mut working, &mut audit, name, output),
                Err(reason) => return self.step_failed(task, flow, name, reason, audit).await,
            }
        }

        let to = transition.to.clone();
        let mut patch = changed_fields(task, working);
        patch.queue = Some(to.clone());
        patch.lease = LeaseChange::Release;
        patch.audit = audit;
        patch.audit.push(
            AuditEntry::new(AuditKind::Transition, format!("{} -> {to}", task.queue))
                .with_context(json!({ "steps": transition.steps })),
        );
        let updated = self.write(task, flow, &to, Write::Advance, patch).await?;
        Ok(Resolution {
            task: updated,
            outcome: EngineOutcome::Advanced {
                from: task.queue.clone(),
                to,
            },
        })
    }

    /// Run one step, reporting its failure reason as a string.
    async fn run_step(
        &self,
        name: StepName,
        task: &Task,
        result: &WorkerResult,
        workspace: Option<&Workspace>,
    ) -> Result<StepOutput, String> {
        let Some(step) = self.steps.get(name) else {
            return Err(format!("step {name} is not registered"));
        };
        let ctx = StepContext {
            task,
            result,
            workspace,
        };
        let outcome = step.run(&ctx).await.map_err(|e| format!("{e:#}"));
        let (success, detail) = match &outcome {
            Ok(out) => (true, out.summary.clone()),
            Err(reason) => (false, reason.clone()),
        };
        tracing::info!(task = %task.id, step = %name, success, detail = %detail, "step finished");
        self.events.emit(EventKind::StepFinished {
            task_id: task.id,
            step: name,
            success,
            detail,
        });
        outcome
    }

    async fn step_failed(
        &self,
        task: &Task,
        flow: &Flow,
        step: StepName,
        reason: String,
        mut audit: Vec<AuditEntry>,
    ) -> Result<Resolution, ControlError> {
        let attempt = task.step_failure.as_ref().map_or(0, |f| f.attempts) + 1;
        let incident = ControlError::StepFailure {
            task: task.id,
            step,
            reason: reason.clone(),
        };
        tracing::warn!(task = %task.id, step = %step, attempt, error = %incident, "step failed");
        audit.push(
            AuditEntry::new(AuditKind::StepFailed, incident.to_string())
                .with_context(json!({ "kind": incident.kind(), "step": step, "attempt": attempt })),
        );

        if attempt >= self.limits.step_retry_limit {
            let reason = format!("step {step} failed {attempt} time(s): {reason}");
            return self.escalate(task, flow, reason, audit).await;
        }

        let mut patch = TaskPatch {
            step_failure: Some(StepFailure {
                step,
                reason: reason.clone(),
                attempts: attempt,
                failed_at: Utc::now(),
            }),
            audit,
            ..TaskPatch::default()
        };
        if let Some(holder) = task.lease_holder() {
            patch.lease = LeaseChange::Renew {
                holder: holder.clone(),
                secs: self.limits.lease_secs,
            };
        }
        let updated = self
            .write(task, flow, &task.queue, Write::Update, patch)
            .await?;
        Ok(Resolution {
            task: updated,
            outcome: EngineOutcome::StepFailed {
                step,
                reason,
                attempt,
            },
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn reject(
        &self,
        task: &Task,
        flow: &Flow,
        feedback: String,
        on_fail: Option<Queue>,
        steps: &[StepName],
        result: &WorkerResult,
        workspace: Option<&Workspace>,
    ) -> Result<Resolution, ControlError> {
        let verdict = WorkerResult {
            extra: result.extra.clone(),
            ..WorkerResult::reject(feedback.clone())
        };
        let mut working = task.clone();
        let mut audit = Vec::new();
        for &name in steps {
            match self.run_step(name, &working, &verdict, workspace).await {
                Ok(output) => absorb(&mut working, &mut audit, name, output),
                Err(reason) => {
                    let reason = format!("on rejection: {reason}");
                    return self.step_failed(task, flow, name, reason, audit).await;
                }
            }
        }

        let count = task.rejection_count + 1;
        let mut patch = changed_fields(task, working);
        patch.lease = LeaseChange::Release;

        if count > self.limits.rejection_limit {
            let incident = ControlError::RejectionLoop {
                task: task.id,
                count,
            };
            let reason = incident.to_string();
            tracing::warn!(task = %task.id, count, "rejection ceiling reached");
            let to = flow.failure_queue();
            audit.push(
                AuditEntry::new(AuditKind::Escalated, reason.clone()).with_context(json!({
                    "kind": incident.kind(),
                    "feedback": feedback,
                    "flagged_for_review": true,
                })),
            );
            patch.queue = Some(to.clone());
            patch.audit = audit;
            let updated = self
                .write(task, flow, &to, Write::Reject(feedback), patch)
                .await?;
            self.events.emit(EventKind::TaskEscalated {
                task_id: task.id,
                reason: reason.clone(),
            });
            return Ok(Resolution {
                task: updated,
                outcome: EngineOutcome::Escalated { reason },
            });
        }

        let to = on_fail.unwrap_or_else(|| retry_queue(flow, task));
        audit.push(
            AuditEntry::new(AuditKind::Rejected, feedback.clone())
                .with_context(json!({ "from": task.queue, "to": to, "round": count })),
        );
        patch.queue = Some(to.clone());
        patch.audit = audit;
        let updated = self
            .write(task, flow, &to, Write::Reject(feedback), patch)
            .await?;
        Ok(Resolution {
            task: updated,
            outcome: EngineOutcome::Advanced {
                from: task.queue.clone(),
                to,
            },
        })
    }

    async fn hold(&self, task: &Task, flow: &Flow) -> Result<Resolution, ControlError> {
        let to = flow.holding_queue();
        let patch = TaskPatch {
            queue: Some(to.clone()),
            resume_queue: Some(task.queue.clone()),
            audit: vec![AuditEntry::new(
                AuditKind::Continuation,
                format!("worker needs another run in {}", task.queue),
            )],
            ..TaskPatch::default()
        };
        let updated = self.write(task, flow, &to, Write::Update, patch).await?;
        Ok(Resolution {
            task: updated,
            outcome: EngineOutcome::Held,
        })
    }

    async fn escalate(
        &self,
        task: &Task,
        flow: &Flow,
        reason: String,
        mut audit: Vec<AuditEntry>,
    ) -> Result<Resolution, ControlError> {
        let to = flow.failure_queue();
        audit.push(AuditEntry::new(AuditKind::Escalated, reason.clone()));
        let patch = TaskPatch {
            audit,
            ..TaskPatch::to_queue(to.clone()).release()
        };
        let updated = self.write(task, flow, &to, Write::Advance, patch).await?;
        tracing::warn!(task = %task.id, reason = %reason, "task escalated");
        self.events.emit(EventKind::TaskEscalated {
            task_id: task.id,
            reason: reason.clone(),
        });
        Ok(Resolution {
            task: updated,
            outcome: EngineOutcome::Escalated { reason },
        })
    }

    /// Move a held task back to the queue it was continued from, renewing
    /// the lease for `worker`.
    pub async fn resume(&self, task: &Task, worker: &WorkerId) -> Result<Task, ControlError> {
        let flow = self.flows.resolve(task.flow.as_ref())?;
        let to = task
            .resume_queue
            .clone()
            .or_else(|| flow.claim_source(&task.queue))
            .unwrap_or_else(|| flow.initial.clone());
        let patch = TaskPatch {
            queue: Some(to.clone()),
            lease: LeaseChange::Renew {
                holder: worker.clone(),
                secs: self.limits.lease_secs,
            },
            audit: vec![AuditEntry::new(
                AuditKind::Claimed,
                format!("resumed by {worker}"),
            )],
            ..TaskPatch::default()
        };
        self.write(task, flow, &to, Write::Update, patch).await
    }

    /// Give up a claim, returning the task to the queue it was claimed from.
    pub async fn release(
        &self,
        task: &Task,
        kind: AuditKind,
        reason: &str,
    ) -> Result<Task, ControlError> {
        let flow = self.flows.resolve(task.flow.as_ref())?;
        let current = if task.queue.is_holding() {
            task.resume_queue.clone().unwrap_or_else(|| task.queue.clone())
        } else {
            task.queue.clone()
        };
        let to = flow
            .claim_source(&current)
            .unwrap_or_else(|| flow.initial.clone());
        let patch = TaskPatch::to_queue(to.clone())
            .release()
            .with_audit(AuditEntry::new(kind, reason).with_context(json!({
                "from": task.queue,
                "to": to,
                "holder": task.lease_holder(),
            })));
        tracing::info!(task = %task.id, to = %to, reason, "releasing claim");
        self.write(task, flow, &to, Write::Update, patch).await
    }

    /// Manual reset to the flow's initial queue.
    pub async fn reset(&self, task: &Task, reason: &str) -> Result<Task, ControlError> {
        let flow = self.flows.resolve(task.flow.as_ref())?;
        let to = flow.initial.clone();
        let patch = TaskPatch::to_queue(to.clone())
            .release()
            .with_audit(AuditEntry::new(AuditKind::Reset, reason));
        self.write(task, flow, &to, Write::Update, patch).await
    }

    async fn write(
        &self,
        task: &Task,
        flow: &Flow,
        to: &Queue,
        write: Write,
        patch: TaskPatch,
    ) -> Result<Task, ControlError> {
        // Terminal tasks only leave through a reset.
        let allowed = if task.is_terminal() {
            to == &flow.initial
        } else {
            flow.permits(&task.queue, to)
        };
        if !allowed {
            return Err(ControlError::OutOfGraph {
                task: task.id,
                flow: flow.name.to_string(),
                from: task.queue.clone(),
                to: to.clone(),
            });
        }
        let updated = match write {
            Write::Advance if to.is_terminal() => {
                self.store.accept(task.id, task.version, patch).await?
            }
            Write::Advance => self.store.submit(task.id, task.version, patch).await?,
            Write::Reject(feedback) => {
                self.store
                    .reject(task.id, task.version, feedback, patch)
                    .await?
            }
            Write::Update => self.store.update(task.id, task.version, patch).await?,
        };
        if updated.queue != task.queue {
            tracing::info!(
                task = %task.id,
                from = %task.queue,
                to = %updated.queue,
                version = updated.version,
                "task transitioned"
            );
            self.events.emit(EventKind::TaskStateChange {
                task_id: task.id,
                from: task.queue.clone(),
                to: updated.queue.clone(),
                version: updated.version,
            });
        }
        Ok(updated)
    }
}

/// Fold a step's output into the working copy and audit trail.
fn absorb(working: &mut Task, audit: &mut Vec<AuditEntry>, name: StepName, output: StepOutput) {
    if let Some(request) = output.review_request {
        working.review_request = Some(request);
    }
    if let Some(description) = output.description {
        working.description = description;
    }
    audit.push(
        AuditEntry::new(AuditKind::StepSucceeded, format!("{name}: {}", output.summary))
            .with_context(output.context),
    );
}

/// Patch carrying the fields steps changed on the working copy.
fn changed_fields(original: &Task, working: Task) -> TaskPatch {
    let mut patch = TaskPatch::default();
    if working.review_request != original.review_request {
        patch.review_request = working.review_request;
    }
    if working.description != original.description {
        patch.description = Some(working.description);
    }
    patch
}

/// The queue that makes a rejected task claimable by its own role again.
fn retry_queue(flow: &Flow, task: &Task) -> Queue {
    flow.transitions
        .iter()
        .find(|t| t.claim.as_ref() == Some(&task.role))
        .map(|t| t.from.clone())
        .unwrap_or_else(|| flow.initial.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::fake::FakeReviews;
    use crate::steps::Step;
    use crate::worktree::WorktreeManager;
    use anyhow::Result;
    use async_trait::async_trait;
    use marshal_core::config::{ChecksConfig, ReviewConfig};
    use marshal_core::error::StoreError;
    use marshal_core::flow::{FlowDef, FlowName};
    use marshal_core::role::RoleName;
    use marshal_core::store::{ClaimRequest, NewTask};
    use marshal_db::RedbStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// A step that fails its first `failures` runs.
    struct Scripted {
        name: StepName,
        failures: AtomicU32,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(name: StepName, failures: u32) -> Arc<Self> {
            Arc::new(Self {
                name,
                failures: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Step for Scripted {
        fn name(&self) -> StepName {
            self.name
        }

        async fn run(&self, _: &StepContext<'_>) -> Result<StepOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                anyhow::bail!("{} unavailable", self.name);
            }
            Ok(StepOutput::new("ok"))
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<dyn TaskStore>,
        engine: FlowEngine,
    }

    fn flow(toml: &str) -> Flow {
        let def: FlowDef = toml::from_str(toml).unwrap();
        Flow::from_def(FlowName::default(), def).unwrap()
    }

    const REVIEWED: &str = r#"
        [transitions."incoming -> claimed"]
        claim = "implementer"

        [transitions."claimed -> provisional"]
        steps = ["push-branch", "open-review-request"]

        [transitions."provisional -> done"]
        conditions = [{ name = "review", kind = "delegated", role = "gatekeeper", on_fail = "incoming", on_fail_steps = ["rewrite-task-with-feedback"] }]
        steps = ["merge-review-request"]
    "#;

    fn harness(flow: Flow, registry: StepRegistry, limits: EngineLimits) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn TaskStore> =
            Arc::new(RedbStore::open(&dir.path().join("engine.redb")).unwrap());
        let engine = FlowEngine::new(
            Arc::clone(&store),
            Arc::new(FlowSet::from_flows([flow])),
            Arc::new(registry),
            EventBus::new(),
            limits,
        );
        Harness {
            _dir: dir,
            store,
            engine,
        }
    }

    fn builtin(reviews: Arc<FakeReviews>) -> StepRegistry {
        let tmp = std::env::temp_dir();
        StepRegistry::builtin(
            WorktreeManager::new(&tmp, tmp.join("unused"), "origin"),
            reviews,
            &ChecksConfig::default(),
            &ReviewConfig::default(),
        )
    }

    fn claim(role: &str, from: Queue, to: Option<Queue>) -> ClaimRequest {
        ClaimRequest {
            role: RoleName::new(role),
            worker: WorkerId::new(format!("{role}-1")),
            flow: FlowName::default(),
            match_task_role: to.is_some(),
            from,
            to,
            lease_secs: 600,
            project: None,
            target: None,
        }
    }

    async fn claimed_task(h: &Harness) -> Task {
        h.store
            .create(NewTask::new("Add popcnt", RoleName::new("implementer")))
            .await
            .unwrap();
        h.store
            .claim(&claim("implementer", Queue::incoming(), Some(Queue::claimed())))
            .await
            .unwrap()
            .unwrap()
    }

    /// open-review-request fails once: the task stays claimed with the
    /// failure recorded, the next run retries from the first step, and the
    /// task advances exactly once.
    #[tokio::test]
    async fn step_failure_is_retried_in_place() {
        let reviews = Arc::new(FakeReviews::default());
        *reviews.fail_opens.lock().unwrap() = 1;
        let push = Scripted::new(StepName::PushBranch, 0);
        let mut registry = builtin(Arc::clone(&reviews));
        registry.register(push.clone());
        let h = harness(flow(REVIEWED), registry, EngineLimits::default());
        let task = claimed_task(&h).await;
        let result = WorkerResult::success();

        let first = h.engine.resolve_and_advance(&task, &result, None).await.unwrap();
        match &first.outcome {
            EngineOutcome::StepFailed { step, attempt, .. } => {
                assert_eq!(*step, StepName::OpenReviewRequest);
                assert_eq!(*attempt, 1);
            }
            other => panic!("expected a step failure, got {other:?}"),
        }
        assert_eq!(first.task.queue, Queue::claimed());
        assert_eq!(first.task.step_failure.as_ref().unwrap().attempts, 1);
        assert!(first.task.is_held_by(&WorkerId::new("implementer-1")));

        let second = h
            .engine
            .resolve_and_advance(&first.task, &result, None)
            .await
            .unwrap();
        assert_eq!(
            second.outcome,
            EngineOutcome::Advanced {
                from: Queue::claimed(),
                to: Queue::provisional()
            }
        );
        assert_eq!(push.calls(), 2, "retry starts from the first step");
        assert_eq!(reviews.opened(), 1);
        assert_eq!(second.task.review_request.as_ref().unwrap().number, 1);
        assert!(second.task.step_failure.is_none());
        assert!(second.task.lease.is_none());
        assert!(second.task.submitted_at.is_some());

        // A stale replay cannot advance the task a second time.
        let err = h
            .engine
            .resolve_and_advance(&first.task, &result, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ControlError::Store(StoreError::VersionConflict { .. })
        ));
    }

    #[tokio::test]
    async fn step_failures_escalate_at_the_ceiling() {
        let mut registry = StepRegistry::empty();
        registry.register(Scripted::new(StepName::PushBranch, u32::MAX));
        let limits = EngineLimits {
            step_retry_limit: 2,
            ..EngineLimits::default()
        };
        let h = harness(Flow::default_flow(), registry, limits);
        let task = claimed_task(&h).await;
        let result = WorkerResult::success();

        let first = h.engine.resolve_and_advance(&task, &result, None).await.unwrap();
        assert!(matches!(first.outcome, EngineOutcome::StepFailed { attempt: 1, .. }));
        let second = h
            .engine
            .resolve_and_advance(&first.task, &result, None)
            .await
            .unwrap();
        assert!(matches!(second.outcome, EngineOutcome::Escalated { .. }));
        assert_eq!(second.task.queue, Queue::failed());
        assert!(second.task.lease.is_none());
        assert!(second.task.audit.iter().any(|e| e.kind == AuditKind::Escalated));
    }

    /// A gate rejection with `on_fail = incoming` sends the task back with its
    /// feedback, which the next claimant sees.
    #[tokio::test]
    async fn rejection_returns_task_with_feedback() {
        let mut registry = builtin(Arc::new(FakeReviews::default()));
        registry.register(Scripted::new(StepName::PushBranch, 0));
        registry.register(Scripted::new(StepName::OpenReviewRequest, 0));
        let h = harness(flow(REVIEWED), registry, EngineLimits::default());
        let task = claimed_task(&h).await;
        h.engine
            .resolve_and_advance(&task, &WorkerResult::success(), None)
            .await
            .unwrap();

        let gated = h
            .store
            .claim(&claim("gatekeeper", Queue::provisional(), None))
            .await
            .unwrap()
            .unwrap();
        let verdict = WorkerResult::reject("tests fail");
        let rejected = h
            .engine
            .resolve_and_advance(&gated, &verdict, None)
            .await
            .unwrap();
        assert_eq!(
            rejected.outcome,
            EngineOutcome::Advanced {
                from: Queue::provisional(),
                to: Queue::incoming()
            }
        );
        assert_eq!(rejected.task.rejection_count, 1);
        assert!(rejected.task.lease.is_none());
        assert!(
            rejected
                .task
                .description
                .contains("## Review feedback (round 1)\n\ntests fail")
        );

        let next = h
            .store
            .claim(&claim("implementer", Queue::incoming(), Some(Queue::claimed())))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.id, task.id);
        assert_eq!(next.last_feedback.as_deref(), Some("tests fail"));
        let text = crate::instructions::render(
            &next,
            &next.role,
            std::path::Path::new("/w"),
            std::path::Path::new("/r.json"),
        );
        assert!(text.contains("tests fail"));
    }

    /// The feedback rewrite fails once: the rejection is not applied until
    /// the step succeeds on the retry.
    #[tokio::test]
    async fn failed_rejection_step_is_retried() {
        let rewrite = Scripted::new(StepName::RewriteTaskWithFeedback, 1);
        let mut registry = StepRegistry::empty();
        registry.register(Scripted::new(StepName::PushBranch, 0));
        registry.register(Scripted::new(StepName::OpenReviewRequest, 0));
        registry.register(rewrite.clone());
        let h = harness(flow(REVIEWED), registry, EngineLimits::default());
        let task = claimed_task(&h).await;
        h.engine
            .resolve_and_advance(&task, &WorkerResult::success(), None)
            .await
            .unwrap();
        let gated = h
            .store
            .claim(&claim("gatekeeper", Queue::provisional(), None))
            .await
            .unwrap()
            .unwrap();
        let verdict = WorkerResult::reject("tests fail");

        let first = h
            .engine
            .resolve_and_advance(&gated, &verdict, None)
            .await
            .unwrap();
        assert!(matches!(
            first.outcome,
            EngineOutcome::StepFailed {
                step: StepName::RewriteTaskWithFeedback,
                attempt: 1,
                ..
            }
        ));
        assert_eq!(first.task.queue, Queue::provisional());
        assert_eq!(first.task.rejection_count, 0);
        assert!(first.task.is_held_by(&WorkerId::new("gatekeeper-1")));
        let failure = first.task.step_failure.as_ref().unwrap();
        assert_eq!(failure.step, StepName::RewriteTaskWithFeedback);

        let second = h
            .engine
            .resolve_and_advance(&first.task, &verdict, None)
            .await
            .unwrap();
        assert_eq!(
            second.outcome,
            EngineOutcome::Advanced {
                from: Queue::provisional(),
                to: Queue::incoming()
            }
        );
        assert_eq!(rewrite.calls(), 2);
        assert_eq!(second.task.rejection_count, 1);
        assert!(second.task.step_failure.is_none());
        assert!(second.task.lease.is_none());
    }

    #[tokio::test]
    async fn rejection_loop_escalates() {
        let mut registry = builtin(Arc::new(FakeReviews::default()));
        registry.register(Scripted::new(StepName::PushBranch, 0));
        registry.register(Scripted::new(StepName::OpenReviewRequest, 0));
        let limits = EngineLimits {
            rejection_limit: 1,
            ..EngineLimits::default()
        };
        let h = harness(flow(REVIEWED), registry, limits);
        let mut task = claimed_task(&h).await;
        let mut outcomes = Vec::new();
        for round in 0..2 {
            if round > 0 {
                task = h
                    .store
                    .claim(&claim("implementer", Queue::incoming(), Some(Queue::claimed())))
                    .await
                    .unwrap()
                    .unwrap();
            }
            h.engine
                .resolve_and_advance(&task, &WorkerResult::success(), None)
                .await
                .unwrap();
            let gated = h
                .store
                .claim(&claim("gatekeeper", Queue::provisional(), None))
                .await
                .unwrap()
                .unwrap();
            let r = h
                .engine
                .resolve_and_advance(&gated, &WorkerResult::reject("still broken"), None)
                .await
                .unwrap();
            outcomes.push(r);
        }
        assert_eq!(outcomes[0].task.queue, Queue::incoming());
        let last = &outcomes[1];
        assert!(matches!(last.outcome, EngineOutcome::Escalated { .. }));
        assert_eq!(last.task.queue, Queue::failed());
        assert_eq!(last.task.rejection_count, 2);
        let entry = last
            .task
            .audit
            .iter()
            .find(|e| e.kind == AuditKind::Escalated)
            .unwrap();
        assert_eq!(entry.context["kind"], "RejectionLoop");
        assert_eq!(entry.context["flagged_for_review"], true);
    }

    #[tokio::test]
    async fn failing_automatic_check_rejects() {
        let mut registry = StepRegistry::empty();
        registry.register(Scripted::new(StepName::RunChecks, 1));
        let h = harness(
            flow(
                r#"
                [transitions."incoming -> claimed"]
                claim = "implementer"

                [transitions."claimed -> provisional"]
                conditions = [{ name = "checks", kind = "automatic", on_fail = "incoming" }]

                [transitions."provisional -> done"]
                "#,
            ),
            registry,
            EngineLimits::default(),
        );
        let task = claimed_task(&h).await;
        let r = h
            .engine
            .resolve_and_advance(&task, &WorkerResult::success(), None)
            .await
            .unwrap();
        assert_eq!(r.task.queue, Queue::incoming());
        assert_eq!(r.task.rejection_count, 1);
        assert!(
            r.task
                .last_feedback
                .as_deref()
                .unwrap()
                .starts_with("checks failed")
        );
    }

    #[tokio::test]
    async fn worker_failure_goes_to_failure_queue() {
        let h = harness(Flow::default_flow(), StepRegistry::empty(), EngineLimits::default());
        let task = claimed_task(&h).await;
        let r = h
            .engine
            .resolve_and_advance(&task, &WorkerResult::failure("boom"), None)
            .await
            .unwrap();
        assert_eq!(
            r.outcome,
            EngineOutcome::Advanced {
                from: Queue::claimed(),
                to: Queue::failed()
            }
        );
        assert!(r.task.completed_at.is_some());
    }

    #[tokio::test]
    async fn continuation_holds_then_resumes() {
        let h = harness(Flow::default_flow(), StepRegistry::empty(), EngineLimits::default());
        let task = claimed_task(&h).await;
        let worker = WorkerId::new("implementer-1");
        let held = h
            .engine
            .resolve_and_advance(&task, &WorkerResult::needs_continuation(), None)
            .await
            .unwrap();
        assert_eq!(held.outcome, EngineOutcome::Held);
        assert_eq!(held.task.queue, Queue::needs_continuation());
        assert_eq!(held.task.resume_queue, Some(Queue::claimed()));
        assert!(held.task.is_held_by(&worker));

        let resumed = h.engine.resume(&held.task, &worker).await.unwrap();
        assert_eq!(resumed.queue, Queue::claimed());
        assert!(resumed.is_held_by(&worker));
        assert!(resumed.resume_queue.is_none());
    }

    #[tokio::test]
    async fn release_returns_claim_to_its_source() {
        let h = harness(Flow::default_flow(), StepRegistry::empty(), EngineLimits::default());
        let task = claimed_task(&h).await;
        let released = h
            .engine
            .release(&task, AuditKind::Released, "workspace setup failed")
            .await
            .unwrap();
        assert_eq!(released.queue, Queue::incoming());
        assert!(released.lease.is_none());
        assert_eq!(released.audit.last().unwrap().kind, AuditKind::Released);
    }

    #[tokio::test]
    async fn terminal_tasks_cannot_move() {
        let h = harness(Flow::default_flow(), StepRegistry::empty(), EngineLimits::default());
        let task = claimed_task(&h).await;
        let failed = h
            .engine
            .resolve_and_advance(&task, &WorkerResult::failure("boom"), None)
            .await
            .unwrap()
            .task;
        let err = h
            .engine
            .resolve_and_advance(&failed, &WorkerResult::success(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::OutOfGraph { .. }));

        let reset = h.engine.reset(&failed, "retry by hand").await.unwrap();
        assert_eq!(reset.queue, Queue::incoming());
    }

    #[tokio::test]
    async fn transitions_are_broadcast() {
        let h = harness(Flow::default_flow(), StepRegistry::empty(), EngineLimits::default());
        let mut rx = h.engine.events().subscribe();
        let task = claimed_task(&h).await;
        h.engine
            .resolve_and_advance(&task, &WorkerResult::failure("boom"), None)
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event.kind,
            EventKind::TaskStateChange { ref to, .. } if *to == Queue::failed()
        ));
    }
}
