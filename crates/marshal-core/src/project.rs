use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique project identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProjectId(pub i64);

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PROJ-{:04}", self.0)
    }
}

impl std::str::FromStr for ProjectId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix("PROJ-")
            .or_else(|| s.strip_prefix("proj-"))
            .unwrap_or(s);
        digits.parse().map(ProjectId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    #[default]
    Active,
    Complete,
    Archived,
}

/// A group of tasks, optionally sharing one branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    /// Shared branch for all tasks. `None` means private per-task branches.
    #[serde(default)]
    pub shared_branch: Option<String>,
    pub base_branch: String,
    #[serde(default)]
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
}

impl Project {
    /// Tasks of a shared-branch project must run one after another.
    pub fn is_serialized(&self) -> bool {
        self.shared_branch.is_some()
    }
}

/// Fields for creating a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProject {
    pub name: String,
    #[serde(default)]
    pub shared_branch: Option<String>,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
}

pub(crate) fn default_base_branch() -> String {
    "main".to_string()
}
