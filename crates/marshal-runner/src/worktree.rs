//! Git worktree lifecycle management.
//!
//! Every task gets an isolated working copy under the worktrees directory:
//! `task-NNNN` for private branches, `project-NNNN` for tasks of a
//! shared-branch project, which reuse one workspace one after another.
//!
//! A branch may be checked out (non-detached) in only one worktree at a time.
//! Instead of deleting whichever workspace holds a branch we need, the
//! manager detaches its HEAD. Retiring a workspace pushes its branch and
//! detaches it; removal is left to the sweeper.

use crate::git::{GitRepo, WorktreeEntry, git, parse_worktree_list};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use marshal_core::config::WorkspaceConfig;
use marshal_core::error::ControlError;
use marshal_core::project::{Project, ProjectId};
use marshal_core::task::{Task, TaskId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspacePhase {
    /// Checked out on its branch, possibly with a worker inside.
    Active,
    /// Branch pushed and released; the directory stays for inspection.
    Detached,
    /// Picked by the sweeper; removal may not have finished.
    PendingRemoval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum WorkspaceOwner {
    Task(TaskId),
    Project(ProjectId),
}

impl WorkspaceOwner {
    /// Directory name under the worktrees root.
    pub fn dir_name(&self) -> String {
        match self {
            WorkspaceOwner::Task(id) => format!("task-{:04}", id.0),
            WorkspaceOwner::Project(id) => format!("project-{:04}", id.0),
        }
    }

    /// Which workspace a task works in.
    pub fn for_task(task: &Task, project: Option<&Project>) -> Self {
        match project {
            Some(p) if p.is_serialized() && task.project == Some(p.id) => {
                WorkspaceOwner::Project(p.id)
            }
            _ => WorkspaceOwner::Task(task.id),
        }
    }
}

/// A working copy bound to a branch. Also the on-disk binding record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub path: PathBuf,
    pub branch: String,
    pub base_branch: String,
    pub owner: WorkspaceOwner,
    pub phase: WorkspacePhase,
    #[serde(default)]
    pub retired_at: Option<DateTime<Utc>>,
    /// Branch tip when the current claim began; kept across resumes.
    #[serde(default)]
    pub claim_tip: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    /// The remote already had the local tip.
    UpToDate,
}

/// Creates, reuses, retires and removes task workspaces.
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    repo: PathBuf,
    root: PathBuf,
    remote: String,
}

impl WorktreeManager {
    pub fn new(repo: impl Into<PathBuf>, root: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            root: root.into(),
            remote: remote.into(),
        }
    }

    pub fn from_config(config: &WorkspaceConfig) -> Self {
        Self::new(&config.repo, &config.worktrees_dir, config.remote.clone())
    }

    pub fn repo_dir(&self) -> &Path {
        &self.repo
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn path_for(&self, owner: WorkspaceOwner) -> PathBuf {
        self.root.join(owner.dir_name())
    }

    fn bindings_dir(&self) -> PathBuf {
        self.root.join(".bindings")
    }

    fn binding_path(&self, owner: WorkspaceOwner) -> PathBuf {
        self.bindings_dir().join(format!("{}.json", owner.dir_name()))
    }

    /// The binding recorded for `owner`, if any.
    pub fn binding(&self, owner: WorkspaceOwner) -> Result<Option<Workspace>> {
        let path = self.binding_path(owner);
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)
            .context(format!("failed to read binding {}", path.display()))?;
        match serde_json::from_str(&text) {
            Ok(ws) => Ok(Some(ws)),
            Err(e) => {
                // A torn binding is treated as a mismatch and rebuilt.
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable binding");
                Ok(None)
            }
        }
    }

    fn write_binding(&self, ws: &Workspace) -> Result<()> {
        let dir = self.bindings_dir();
        std::fs::create_dir_all(&dir)
            .context(format!("failed to create {}", dir.display()))?;
        let path = self.binding_path(ws.owner);
        std::fs::write(&path, serde_json::to_string_pretty(ws)?)
            .context(format!("failed to write binding {}", path.display()))
    }

    fn clear_binding(&self, owner: WorkspaceOwner) -> Result<()> {
        let path = self.binding_path(owner);
        if path.exists() {
            std::fs::remove_file(&path)
                .context(format!("failed to remove binding {}", path.display()))?;
        }
        Ok(())
    }

    /// All recorded bindings, in directory order.
    pub fn bindings(&self) -> Result<Vec<Workspace>> {
        let dir = self.bindings_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&dir).context(format!("failed to list {}", dir.display()))? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "json") {
                let text = std::fs::read_to_string(&path)?;
                match serde_json::from_str::<Workspace>(&text) {
                    Ok(ws) => out.push(ws),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping unreadable binding");
                    }
                }
            }
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    fn worktrees(&self) -> Result<Vec<WorktreeEntry>> {
        let out = git(&self.repo, &["worktree", "list", "--porcelain"])?;
        Ok(parse_worktree_list(&out))
    }

    fn fetch(&self) {
        let has_remote = GitRepo::open(&self.repo)
            .map(|r| r.has_remote(&self.remote))
            .unwrap_or(false);
        if !has_remote {
            return;
        }
        if let Err(e) = git(&self.repo, &["fetch", "--prune", &self.remote]) {
            tracing::warn!(remote = %self.remote, error = %e, "fetch failed, using cached remote refs");
        }
    }

    /// Prepare the workspace for `task`.
    ///
    /// Reuses an existing workspace whose binding matches the task's branch
    /// and base branch, and rebuilds it on any mismatch.
    pub fn prepare(&self, task: &Task, project: Option<&Project>) -> Result<Workspace> {
        std::fs::create_dir_all(&self.root)
            .context(format!("failed to create worktree root {}", self.root.display()))?;
        self.fetch();
        git(&self.repo, &["worktree", "prune"])?;

        let owner = WorkspaceOwner::for_task(task, project);
        let path = self.path_for(owner);
        let branch = task.branch_name();
        let base = task.base_branch.clone();

        let known = self
            .worktrees()?
            .into_iter()
            .any(|e| same_path(&e.path, &path));

        if path.exists() && !known {
            tracing::warn!(path = %path.display(), "removing workspace directory git does not know about");
            std::fs::remove_dir_all(&path)
                .context(format!("failed to remove stale workspace {}", path.display()))?;
            self.clear_binding(owner)?;
        }

        if known {
            let previous = self
                .binding(owner)?
                .filter(|b| b.branch == branch && b.base_branch == base);
            if let Some(previous) = previous {
                self.free_branch(&branch)?;
                self.resolve_branch(&branch, &base)?;
                git(&path, &["checkout", &branch])?;
                let ws = self.activate(owner, path, branch, base, previous.claim_tip)?;
                tracing::info!(task = %task.id, path = %ws.path.display(), "reattached workspace");
                return Ok(ws);
            }
            tracing::info!(
                task = %task.id,
                path = %path.display(),
                branch = %branch,
                "workspace binding does not match task, recreating"
            );
            git(&self.repo, &["worktree", "remove", "--force", &path_str(&path)?])?;
            self.clear_binding(owner)?;
        }

        self.free_branch(&branch)?;
        self.resolve_branch(&branch, &base)?;
        git(&self.repo, &["worktree", "add", &path_str(&path)?, &branch])?;
        let ws = self.activate(owner, path, branch, base, None)?;
        tracing::info!(
            task = %task.id,
            path = %ws.path.display(),
            branch = %ws.branch,
            "created workspace"
        );
        Ok(ws)
    }

    fn activate(
        &self,
        owner: WorkspaceOwner,
        path: PathBuf,
        branch: String,
        base_branch: String,
        claim_tip: Option<String>,
    ) -> Result<Workspace> {
        let ws = Workspace {
            path,
            branch,
            base_branch,
            owner,
            phase: WorkspacePhase::Active,
            retired_at: None,
            claim_tip,
        };
        self.write_binding(&ws)?;
        Ok(ws)
    }

    /// Record the branch tip as the start of a new claim. Crash evidence
    /// counts commits from here, across any resumed runs.
    pub fn begin_claim(&self, ws: Workspace) -> Result<Workspace> {
        let tip = GitRepo::open(&self.repo)?.branch_tip(&ws.branch)?;
        let ws = Workspace {
            claim_tip: tip,
            ..ws
        };
        self.write_binding(&ws)?;
        Ok(ws)
    }

    /// Detach every worktree (the main one included) that has `branch`
    /// checked out.
    fn free_branch(&self, branch: &str) -> Result<()> {
        for entry in self.worktrees()? {
            if entry.branch.as_deref() != Some(branch) {
                continue;
            }
            let conflict = ControlError::BranchConflict {
                branch: branch.to_string(),
                path: entry.path.clone(),
            };
            tracing::info!(incident = conflict.kind(), "{conflict}; detaching");
            git(&entry.path, &["checkout", "--detach"])?;
        }
        Ok(())
    }

    /// Make sure a local `branch` exists and is not behind its remote copy.
    fn resolve_branch(&self, branch: &str, base: &str) -> Result<()> {
        let repo = GitRepo::open(&self.repo)?;
        let remote_ref = format!("{}/{branch}", self.remote);
        match (repo.branch_tip(branch)?, repo.remote_tip(&self.remote, branch)?) {
            (Some(local), Some(remote)) if local != remote => {
                if repo.is_ancestor(&local, &remote)? {
                    tracing::debug!(branch, "fast-forwarding to remote");
                    git(&self.repo, &["branch", "-f", branch, &remote_ref])?;
                }
            }
            (Some(_), _) => {}
            (None, Some(_)) => {
                git(&self.repo, &["branch", "--track", branch, &remote_ref])?;
            }
            (None, None) => {
                let start = if repo.remote_tip(&self.remote, base)?.is_some() {
                    format!("{}/{base}", self.remote)
                } else if repo.branch_tip(base)?.is_some() {
                    base.to_string()
                } else {
                    anyhow::bail!("base branch {base} not found locally or on {}", self.remote);
                };
                git(&self.repo, &["branch", "--no-track", branch, &start])?;
            }
        }
        Ok(())
    }

    /// Retire a workspace after its task left the worker.
    ///
    /// On success the branch is pushed first, so later tasks on the same
    /// branch see this work. The workspace is detached either way.
    pub fn retire(&self, ws: &Workspace, success: bool) -> Result<Workspace> {
        if success {
            self.push_branch(&ws.branch)?;
        }
        if ws.path.exists() {
            git(&ws.path, &["checkout", "--detach"])?;
        }
        let retired = Workspace {
            phase: WorkspacePhase::Detached,
            retired_at: Some(Utc::now()),
            ..ws.clone()
        };
        self.write_binding(&retired)?;
        tracing::info!(path = %ws.path.display(), branch = %ws.branch, success, "retired workspace");
        Ok(retired)
    }

    /// Push `branch` to the remote by name, unless the remote already has
    /// the local tip.
    pub fn push_branch(&self, branch: &str) -> Result<PushOutcome> {
        let repo = GitRepo::open(&self.repo)?;
        if !repo.has_remote(&self.remote) {
            anyhow::bail!("remote {} is not configured", self.remote);
        }
        let local = repo
            .branch_tip(branch)?
            .context(format!("branch {branch} does not exist"))?;
        if repo.remote_tip(&self.remote, branch)?.as_deref() == Some(local.as_str()) {
            tracing::debug!(branch, "remote already up to date, skipping push");
            return Ok(PushOutcome::UpToDate);
        }
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        git(&self.repo, &["push", &self.remote, &refspec])?;
        tracing::info!(branch, remote = %self.remote, "pushed branch");
        Ok(PushOutcome::Pushed)
    }

    /// Delete a local branch, pushing it first so no commit is lost.
    pub fn discard_branch(&self, branch: &str) -> Result<()> {
        let repo = GitRepo::open(&self.repo)?;
        if repo.branch_tip(branch)?.is_none() {
            return Ok(());
        }
        self.push_branch(branch)
            .context(format!("refusing to delete {branch}: it could not be pushed"))?;
        self.free_branch(branch)?;
        git(&self.repo, &["branch", "-D", branch])?;
        tracing::info!(branch, "deleted local branch");
        Ok(())
    }

    /// Flag a workspace for removal; returns the updated binding.
    pub fn mark_pending_removal(&self, owner: WorkspaceOwner) -> Result<Option<Workspace>> {
        let Some(ws) = self.binding(owner)? else {
            return Ok(None);
        };
        let ws = Workspace {
            phase: WorkspacePhase::PendingRemoval,
            ..ws
        };
        self.write_binding(&ws)?;
        Ok(Some(ws))
    }

    /// Remove a workspace directory and its binding.
    pub fn remove(&self, owner: WorkspaceOwner) -> Result<()> {
        let path = self.path_for(owner);
        let known = self
            .worktrees()?
            .into_iter()
            .any(|e| same_path(&e.path, &path));
        if known {
            git(&self.repo, &["worktree", "remove", "--force", &path_str(&path)?])?;
        } else if path.exists() {
            std::fs::remove_dir_all(&path)
                .context(format!("failed to remove {}", path.display()))?;
        }
        git(&self.repo, &["worktree", "prune"])?;
        self.clear_binding(owner)?;
        tracing::info!(path = %path.display(), "removed workspace");
        Ok(())
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    let a = a.canonicalize().unwrap_or_else(|_| a.to_path_buf());
    let b = b.canonicalize().unwrap_or_else(|_| b.to_path_buf());
    a == b
}

fn path_str(path: &Path) -> Result<String> {
    path.to_str()
        .map(str::to_string)
        .context(format!("non-UTF-8 path {}", path.display()))
}
