//! The pipeline config (`configs/pipeline.toml`).

use crate::error::ConfigError;
use crate::flow::{FlowDef, FlowName, FlowSet};
use crate::role::RolesConfig;
use crate::task::TaskId;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub roles: RolesConfig,
    #[serde(default)]
    pub checks: ChecksConfig,
    #[serde(default)]
    pub review: ReviewConfig,
    #[serde(default)]
    pub flows: BTreeMap<FlowName, FlowDef>,
}

/// `[scheduler]`: timers, ceilings and leases.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_secs: u64,
    pub reconcile_secs: u64,
    pub sweep_secs: u64,
    /// Global ceiling on live workers across all roles.
    pub max_workers: usize,
    pub lease_secs: i64,
    /// Quiet period after which an untracked, unexpired claim is orphaned.
    pub orphan_secs: i64,
    /// Deadline for a worker run when its role sets none.
    pub worker_timeout_secs: u64,
    /// Consecutive step failures before a task is escalated.
    pub step_retry_limit: u32,
    /// Rejections before a task is escalated.
    pub rejection_limit: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: 10,
            reconcile_secs: 60,
            sweep_secs: 3600,
            max_workers: 4,
            lease_secs: 3600,
            orphan_secs: 900,
            worker_timeout_secs: 3600,
            step_retry_limit: 3,
            rejection_limit: 3,
        }
    }
}

/// `[workspace]`: where repositories, worktrees and runtime files live.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub repo: PathBuf,
    pub worktrees_dir: PathBuf,
    pub runtime_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub remote: String,
    /// Age a terminal task must reach before the sweeper touches it.
    pub sweep_grace_secs: i64,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            repo: PathBuf::from("."),
            worktrees_dir: PathBuf::from(".marshal/worktrees"),
            runtime_dir: PathBuf::from(".marshal/runtime"),
            archive_dir: PathBuf::from(".marshal/archive"),
            remote: "origin".into(),
            sweep_grace_secs: 86_400,
        }
    }
}

impl WorkspaceConfig {
    /// Per-task runtime directory: instructions, result file and worker log.
    pub fn task_runtime_dir(&self, id: TaskId) -> PathBuf {
        self.runtime_dir.join("tasks").join(id.to_string())
    }

    /// Anchor relative paths at `base`.
    pub fn resolve_against(mut self, base: &Path) -> Self {
        for path in [
            &mut self.repo,
            &mut self.worktrees_dir,
            &mut self.runtime_dir,
            &mut self.archive_dir,
        ] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
        self
    }
}

/// `[checks]`: commands run by the `run-checks` step.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChecksConfig {
    pub commands: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ChecksConfig {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    #[default]
    Squash,
    Merge,
    Rebase,
}

impl MergeStrategy {
    pub fn gh_flag(&self) -> &'static str {
        match self {
            MergeStrategy::Squash => "--squash",
            MergeStrategy::Merge => "--merge",
            MergeStrategy::Rebase => "--rebase",
        }
    }
}

/// `[review]`: how review requests are merged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    pub merge_strategy: MergeStrategy,
    pub delete_branch: bool,
}

impl PipelineConfig {
    /// Load and validate from a TOML file. Returns defaults if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "pipeline config not found, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).context(format!(
            "failed to read pipeline config: {}",
            path.display()
        ))?;
        let config = Self::parse(&contents).context(format!(
            "invalid pipeline config: {}",
            path.display()
        ))?;
        tracing::info!(
            roles = config.roles.roles.len(),
            flows = config.flows.len(),
            path = %path.display(),
            "loaded pipeline config"
        );
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents).context("failed to parse pipeline config")?;
        config.flow_set()?;
        Ok(config)
    }

    /// Validate roles and scheduler settings, then build the flow set.
    pub fn flow_set(&self) -> Result<FlowSet, ConfigError> {
        for (name, role) in self.roles.iter() {
            if role.max_concurrent == 0 {
                return Err(ConfigError::ZeroConcurrency(name.to_string()));
            }
        }
        let s = &self.scheduler;
        for (field, value) in [
            ("tick_secs", s.tick_secs),
            ("reconcile_secs", s.reconcile_secs),
            ("sweep_secs", s.sweep_secs),
            ("max_workers", s.max_workers as u64),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroInterval(field));
            }
        }
        FlowSet::from_defs(self.flows.clone(), &self.roles)
    }
}
