//! The step registry and the built-in steps.
//!
//! A step is a side effect a transition runs before the engine advances the
//! task. Steps never write to the task store: they touch their own external
//! system and return a [`StepOutput`], which the engine persists. Each
//! built-in checks before it acts, so re-running a step after a partial
//! failure produces its effect at most once.

use crate::review::{ReviewProvider, ReviewState};
use crate::subprocess::run_cmd;
use crate::worktree::{PushOutcome, Workspace, WorktreeManager};
use anyhow::{Context, Result};
use async_trait::async_trait;
use marshal_core::config::{ChecksConfig, MergeStrategy, ReviewConfig};
use marshal_core::flow::StepName;
use marshal_core::result::WorkerResult;
use marshal_core::task::{ReviewRequestRef, Task};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// What a step sees.
pub struct StepContext<'a> {
    /// The task as the engine currently holds it, including outputs of
    /// earlier steps in the same run.
    pub task: &'a Task,
    pub result: &'a WorkerResult,
    pub workspace: Option<&'a Workspace>,
}

impl StepContext<'_> {
    pub fn work_dir(&self) -> Option<&Path> {
        self.workspace.map(|ws| ws.path.as_path())
    }

    pub fn branch(&self) -> String {
        self.workspace
            .map(|ws| ws.branch.clone())
            .unwrap_or_else(|| self.task.branch_name())
    }
}

/// Structured result of a successful step.
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    pub summary: String,
    /// Merged into the task's audit trail.
    pub context: serde_json::Value,
    pub review_request: Option<ReviewRequestRef>,
    /// Replacement task description.
    pub description: Option<String>,
}

impl StepOutput {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            ..Self::default()
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> StepName;

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutput>;
}

/// Step name → implementation.
#[derive(Default, Clone)]
pub struct StepRegistry {
    steps: HashMap<StepName, Arc<dyn Step>>,
}

impl StepRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// All six built-in steps.
    pub fn builtin(
        worktrees: WorktreeManager,
        reviews: Arc<dyn ReviewProvider>,
        checks: &ChecksConfig,
        review: &ReviewConfig,
    ) -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(PushBranch { worktrees }));
        registry.register(Arc::new(RunChecks {
            commands: checks.commands.clone(),
            timeout: Duration::from_secs(checks.timeout_secs),
        }));
        registry.register(Arc::new(OpenReviewRequest {
            reviews: Arc::clone(&reviews),
        }));
        registry.register(Arc::new(PostReviewComment {
            reviews: Arc::clone(&reviews),
        }));
        registry.register(Arc::new(MergeReviewRequest {
            reviews,
            strategy: review.merge_strategy,
            delete_branch: review.delete_branch,
        }));
        registry.register(Arc::new(RewriteTaskWithFeedback));
        registry
    }

    /// Add a step, replacing any step registered under the same name.
    pub fn register(&mut self, step: Arc<dyn Step>) {
        self.steps.insert(step.name(), step);
    }

    pub fn get(&self, name: StepName) -> Option<Arc<dyn Step>> {
        self.steps.get(&name).cloned()
    }
}

// ─── Built-ins ──────────────────────────────────────────────────────────

pub struct PushBranch {
    worktrees: WorktreeManager,
}

#[async_trait]
impl Step for PushBranch {
    fn name(&self) -> StepName {
        StepName::PushBranch
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutput> {
        let branch = ctx.branch();
        let outcome = self.worktrees.push_branch(&branch)?;
        let summary = match outcome {
            PushOutcome::Pushed => format!("pushed {branch}"),
            PushOutcome::UpToDate => format!("{branch} already up to date"),
        };
        Ok(StepOutput::new(summary).with_context(serde_json::json!({
            "branch": branch,
            "remote": self.worktrees.remote(),
        })))
    }
}

pub struct RunChecks {
    commands: Vec<String>,
    timeout: Duration,
}

#[async_trait]
impl Step for RunChecks {
    fn name(&self) -> StepName {
        StepName::RunChecks
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutput> {
        let dir = ctx.work_dir().context("run-checks needs a workspace")?;
        for cmd in &self.commands {
            let output = run_cmd(cmd, dir, self.timeout).await?;
            if !output.success() {
                anyhow::bail!(
                    "`{cmd}` failed (exit {}): {}",
                    output.exit_code,
                    output.tail(2000)
                );
            }
        }
        Ok(
            StepOutput::new(format!("{} check(s) passed", self.commands.len()))
                .with_context(serde_json::json!({ "commands": self.commands })),
        )
    }
}

pub struct OpenReviewRequest {
    reviews: Arc<dyn ReviewProvider>,
}

#[async_trait]
impl Step for OpenReviewRequest {
    fn name(&self) -> StepName {
        StepName::OpenReviewRequest
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutput> {
        if let Some(existing) = &ctx.task.review_request {
            return Ok(StepOutput {
                review_request: Some(existing.clone()),
                ..StepOutput::new(format!("review request #{} already recorded", existing.number))
            });
        }
        let branch = ctx.branch();
        let (request, summary) = match self.reviews.find_open(&branch).await? {
            Some(found) => {
                let summary = format!("found open review request #{}", found.number);
                (found, summary)
            }
            None => {
                let title = format!("{}: {}", ctx.task.id, ctx.task.title);
                let opened = self
                    .reviews
                    .open(&branch, &ctx.task.base_branch, &title, &ctx.task.description)
                    .await?;
                let summary = format!("opened review request #{}", opened.number);
                (opened, summary)
            }
        };
        Ok(StepOutput {
            context: serde_json::json!({ "number": request.number, "url": request.url }),
            review_request: Some(request),
            ..StepOutput::new(summary)
        })
    }
}

pub struct PostReviewComment {
    reviews: Arc<dyn ReviewProvider>,
}

/// Hidden marker identifying one comment per task, queue and rejection round.
pub fn comment_marker(task: &Task) -> String {
    format!(
        "<!-- marshal:{}:{}:r{} -->",
        task.id, task.queue, task.rejection_count
    )
}

#[async_trait]
impl Step for PostReviewComment {
    fn name(&self) -> StepName {
        StepName::PostReviewComment
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutput> {
        let request = ctx
            .task
            .review_request
            .as_ref()
            .context("no review request to comment on")?;
        let marker = comment_marker(ctx.task);
        let existing = self.reviews.comments(request.number).await?;
        if existing.iter().any(|body| body.contains(&marker)) {
            return Ok(StepOutput::new(format!(
                "comment already posted on #{}",
                request.number
            )));
        }
        let text = ctx
            .result
            .comment
            .as_deref()
            .or(ctx.task.last_feedback.as_deref())
            .unwrap_or("(no comment)");
        let body = format!("{text}\n\n{marker}");
        self.reviews.comment(request.number, &body).await?;
        Ok(StepOutput::new(format!("commented on #{}", request.number)))
    }
}

pub struct MergeReviewRequest {
    reviews: Arc<dyn ReviewProvider>,
    strategy: MergeStrategy,
    delete_branch: bool,
}

#[async_trait]
impl Step for MergeReviewRequest {
    fn name(&self) -> StepName {
        StepName::MergeReviewRequest
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutput> {
        let request = ctx
            .task
            .review_request
            .as_ref()
            .context("no review request to merge")?;
        match self.reviews.state(request.number).await? {
            ReviewState::Merged => Ok(StepOutput::new(format!(
                "#{} already merged",
                request.number
            ))),
            ReviewState::Closed => anyhow::bail!("review request #{} is closed", request.number),
            ReviewState::Open => {
                self.reviews
                    .merge(request.number, self.strategy, self.delete_branch)
                    .await?;
                Ok(StepOutput::new(format!("merged #{}", request.number))
                    .with_context(serde_json::json!({ "strategy": self.strategy.gh_flag() })))
            }
        }
    }
}

pub struct RewriteTaskWithFeedback;

pub fn feedback_heading(round: u32) -> String {
    format!("## Review feedback (round {round})")
}

#[async_trait]
impl Step for RewriteTaskWithFeedback {
    fn name(&self) -> StepName {
        StepName::RewriteTaskWithFeedback
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutput> {
        let Some(feedback) = ctx
            .result
            .comment
            .as_deref()
            .or(ctx.task.last_feedback.as_deref())
        else {
            return Ok(StepOutput::new("no feedback to record"));
        };
        let round = ctx.task.rejection_count + 1;
        let heading = feedback_heading(round);
        if ctx.task.description.contains(&heading) {
            return Ok(StepOutput::new(format!("round {round} feedback already recorded")));
        }
        let mut description = ctx.task.description.trim_end().to_string();
        if !description.is_empty() {
            description.push_str("\n\n");
        }
        description.push_str(&heading);
        description.push_str("\n\n");
        description.push_str(feedback.trim());
        description.push('\n');
        Ok(StepOutput {
            description: Some(description),
            ..StepOutput::new(format!("recorded round {round} feedback"))
        })
    }
}
