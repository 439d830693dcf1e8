use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Name of a worker role (implementer, gatekeeper, ...).
///
/// Roles form a closed set: every role a flow or task names must be declared
/// under `[roles]` in the pipeline config.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RoleName(String);

impl<'de> Deserialize<'de> for RoleName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(RoleName::new(s))
    }
}

impl RoleName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for RoleName {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(RoleName::new(s))
    }
}

/// How to launch workers for a role.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoleConfig {
    /// Executable to run (e.g., "claude", "opencode", "aider").
    pub command: String,
    /// Arguments. Placeholders: `{instructions}`, `{workspace}`, `{task_id}`, `{result}`.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment for the worker process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Number of worker slots for this role.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Per-run deadline; falls back to the scheduler's worker timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_max_concurrent() -> usize {
    1
}

impl RoleConfig {
    /// Substitute the invocation placeholders into the configured args.
    pub fn render_args(&self, vars: &[(&str, &str)]) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                vars.iter().fold(arg.clone(), |acc, (key, value)| {
                    acc.replace(&format!("{{{key}}}"), value)
                })
            })
            .collect()
    }
}

/// Collection of role definitions, loaded from pipeline.toml.
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct RolesConfig {
    pub roles: BTreeMap<RoleName, RoleConfig>,
}

impl RolesConfig {
    pub fn get(&self, name: &RoleName) -> Option<&RoleConfig> {
        self.roles.get(name)
    }

    pub fn contains(&self, name: &RoleName) -> bool {
        self.roles.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RoleName, &RoleConfig)> {
        self.roles.iter()
    }

    /// Total number of worker slots across all roles.
    pub fn total_slots(&self) -> usize {
        self.roles.values().map(|r| r.max_concurrent).sum()
    }
}

impl Default for RolesConfig {
    fn default() -> Self {
        let mut roles = BTreeMap::new();
        roles.insert(
            RoleName::new("implementer"),
            RoleConfig {
                command: "claude".into(),
                args: vec![
                    "-p".into(),
                    "Follow the instructions in {instructions}. Write your JSON result to {result}."
                        .into(),
                ],
                env: HashMap::new(),
                max_concurrent: 1,
                timeout_secs: Some(3600),
            },
        );
        Self { roles }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_args_substitutes_placeholders() {
        let role = RoleConfig {
            command: "agent".into(),
            args: vec!["--read".into(), "{instructions}".into(), "--cwd={workspace}".into()],
            env: HashMap::new(),
            max_concurrent: 1,
            timeout_secs: None,
        };
        let args = role.render_args(&[("instructions", "/tmp/i.md"), ("workspace", "/w")]);
        assert_eq!(args, vec!["--read", "/tmp/i.md", "--cwd=/w"]);
    }

    #[test]
    fn roles_parse_from_toml() {
        let roles: RolesConfig = toml::from_str(
            r#"
            [implementer]
            command = "claude"
            max_concurrent = 3

            [gatekeeper]
            command = "claude"
            "#,
        )
        .unwrap();
        assert_eq!(roles.total_slots(), 4);
        assert!(roles.contains(&RoleName::new("GATEKEEPER")));
    }
}
