//! Worker process supervision.
//!
//! A worker is an external command launched per claimed task. The scheduler
//! never waits on it: each tick probes the child with `try_wait`, kills it
//! past its deadline, and once it is gone reads the result file it left.
//! A missing result is reconciled from what the worker left on its branch.

use crate::git::GitRepo;
use crate::instructions::{self, LOG_FILE, RESULT_FILE};
use crate::worktree::Workspace;
use anyhow::{Context, Result};
use marshal_core::agent::{WorkerId, WorkerSession};
use marshal_core::result::WorkerResult;
use marshal_core::role::{RoleConfig, RoleName};
use marshal_core::task::Task;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;

pub const ENV_TASK_ID: &str = "MARSHAL_TASK_ID";
pub const ENV_ROLE: &str = "MARSHAL_ROLE";
pub const ENV_WORKSPACE: &str = "MARSHAL_WORKSPACE";
pub const ENV_INSTRUCTIONS: &str = "MARSHAL_INSTRUCTIONS";
pub const ENV_RESULT_PATH: &str = "MARSHAL_RESULT_PATH";

/// Everything needed to start one worker run.
pub struct WorkerLaunch<'a> {
    pub worker: &'a WorkerId,
    pub role: &'a RoleName,
    pub config: &'a RoleConfig,
    pub task: &'a Task,
    pub workspace: &'a Workspace,
    /// Per-task runtime directory for instructions, result and log.
    pub runtime_dir: &'a Path,
    pub timeout: Duration,
}

/// How the process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// `None` when killed by a signal (including our own deadline kill).
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl WorkerExit {
    fn describe(&self) -> String {
        match (self.timed_out, self.exit_code) {
            (true, _) => "timed out".to_string(),
            (false, Some(code)) => format!("exited with code {code}"),
            (false, None) => "was killed by a signal".to_string(),
        }
    }
}

/// Where the result handed to the flow engine came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultSource {
    /// The worker wrote its result file.
    Reported,
    /// No usable result file; built from the exit status and branch evidence.
    Synthesized { detail: String, new_commits: usize },
}

/// A finished worker run.
#[derive(Debug)]
pub struct Completion {
    pub session: WorkerSession,
    pub workspace: Workspace,
    pub exit: WorkerExit,
    pub result: WorkerResult,
    pub source: ResultSource,
}

/// A live worker process tracked against its task.
#[derive(Debug)]
pub struct WorkerHandle {
    pub session: WorkerSession,
    pub workspace: Workspace,
    child: Child,
    deadline: Instant,
    result_path: PathBuf,
    log_path: PathBuf,
    /// Branch tip when the claim began, or when this run started if the
    /// claim's start is unknown.
    start_sha: Option<String>,
}

/// Render instructions and start the role's command for a claimed task.
pub fn spawn(launch: WorkerLaunch<'_>) -> Result<WorkerHandle> {
    let WorkerLaunch {
        worker,
        role,
        config,
        task,
        workspace,
        runtime_dir,
        timeout,
    } = launch;

    std::fs::create_dir_all(runtime_dir)
        .context(format!("failed to create {}", runtime_dir.display()))?;
    let result_path = runtime_dir.join(RESULT_FILE);
    if result_path.exists() {
        std::fs::remove_file(&result_path)
            .context(format!("failed to clear stale {}", result_path.display()))?;
    }
    let instructions_path =
        instructions::write(runtime_dir, task, role, &workspace.path, &result_path)?;

    let log_path = runtime_dir.join(LOG_FILE);
    let stdout = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .context(format!("failed to open {}", log_path.display()))?;
    let stderr = stdout.try_clone().context("failed to clone log handle")?;

    let task_id = task.id.to_string();
    let instructions_arg = instructions_path.to_string_lossy().to_string();
    let workspace_arg = workspace.path.to_string_lossy().to_string();
    let result_arg = result_path.to_string_lossy().to_string();
    let args = config.render_args(&[
        ("instructions", &instructions_arg),
        ("workspace", &workspace_arg),
        ("task_id", &task_id),
        ("result", &result_arg),
    ]);

    let start_sha = match &workspace.claim_tip {
        Some(tip) => Some(tip.clone()),
        None => GitRepo::open(&workspace.path)
            .and_then(|repo| repo.branch_tip(&workspace.branch))
            .unwrap_or_else(|e| {
                tracing::debug!(task = %task.id, error = %e, "no branch tip at worker start");
                None
            }),
    };

    let child = Command::new(&config.command)
        .args(&args)
        .envs(&config.env)
        .env(ENV_TASK_ID, &task_id)
        .env(ENV_ROLE, role.as_str())
        .env(ENV_WORKSPACE, &workspace_arg)
        .env(ENV_INSTRUCTIONS, &instructions_arg)
        .env(ENV_RESULT_PATH, &result_arg)
        .current_dir(&workspace.path)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .spawn()
        .context(format!("failed to spawn `{}` for {}", config.command, task.id))?;

    tracing::info!(
        worker = %worker,
        task = %task.id,
        role = %role,
        pid = child.id(),
        workspace = %workspace.path.display(),
        "worker started"
    );

    Ok(WorkerHandle {
        session: WorkerSession::new(
            worker.clone(),
            task.id,
            role.clone(),
            workspace.path.clone(),
        ),
        workspace: workspace.clone(),
        child,
        deadline: Instant::now() + timeout,
        result_path,
        log_path,
        start_sha,
    })
}

impl WorkerHandle {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Non-blocking liveness probe. Kills the process once past its deadline.
    pub fn poll(&mut self) -> Result<Option<WorkerExit>> {
        if let Some(status) = self
            .child
            .try_wait()
            .context(format!("failed to probe worker for {}", self.session.task_id))?
        {
            return Ok(Some(WorkerExit {
                exit_code: status.code(),
                timed_out: false,
            }));
        }
        if Instant::now() >= self.deadline {
            tracing::warn!(
                worker = %self.session.worker,
                task = %self.session.task_id,
                "worker past its deadline, killing"
            );
            if let Err(e) = self.child.start_kill() {
                tracing::warn!(task = %self.session.task_id, error = %e, "failed to kill worker");
            }
            return Ok(Some(WorkerExit {
                exit_code: None,
                timed_out: true,
            }));
        }
        Ok(None)
    }

    /// Read the worker's result, synthesizing one when it left none.
    pub fn collect(mut self, exit: WorkerExit) -> Completion {
        self.session.finish();
        let reported = match WorkerResult::read(&self.result_path) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(task = %self.session.task_id, error = ?e, "unreadable worker result");
                None
            }
        };

        let (result, source) = match reported {
            Some(result) => {
                if exit.exit_code != Some(0) {
                    tracing::info!(
                        task = %self.session.task_id,
                        exit = %exit.describe(),
                        "worker exited abnormally but left a result"
                    );
                }
                (result, ResultSource::Reported)
            }
            None => {
                let new_commits = self.new_commits();
                let (result, detail) = synthesize(&exit, new_commits);
                tracing::warn!(
                    worker = %self.session.worker,
                    task = %self.session.task_id,
                    new_commits,
                    detail = %detail,
                    "worker left no result"
                );
                (result, ResultSource::Synthesized { detail, new_commits })
            }
        };

        Completion {
            session: self.session,
            workspace: self.workspace,
            exit,
            result,
            source,
        }
    }

    fn new_commits(&self) -> usize {
        GitRepo::open(&self.workspace.path)
            .and_then(|repo| repo.commits_since(&self.workspace.branch, self.start_sha.as_deref()))
            .unwrap_or_else(|e| {
                tracing::warn!(task = %self.session.task_id, error = %e, "failed to count new commits");
                0
            })
    }
}

/// Result for a run that left no result file.
///
/// New commits on the branch mean the work landed before the process died.
/// A timeout never counts as success.
fn synthesize(exit: &WorkerExit, new_commits: usize) -> (WorkerResult, String) {
    let detail = format!("worker {} without writing a result", exit.describe());
    if new_commits > 0 && !exit.timed_out {
        let comment = format!("{detail}; {new_commits} new commit(s) on the branch");
        (WorkerResult::success().with_comment(comment.clone()), comment)
    } else {
        (WorkerResult::failure(detail.clone()), detail)
    }
}
