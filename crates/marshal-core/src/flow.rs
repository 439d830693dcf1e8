//! Declarative flow graphs.
//!
//! A flow is a set of transitions between queues. Two kinds of edge exist:
//!
//! - **claim edges** (`claim = "<role>"`) are taken atomically by the task
//!   store when a worker of that role claims a task;
//! - **work edges** are taken by the flow engine once the claimant's result
//!   is in, after the edge's conditions pass and its steps succeed.
//!
//! Besides the declared edges, every flow permits a few implicit ones: a
//! work queue may move to the failure queue, to the holding queue, or to any
//! `on_fail` target of its transition; the holding queue may return to a
//! work queue; a claim may be released back to where it came from; and any
//! task may be reset to the initial queue.

use crate::error::ConfigError;
use crate::role::{RoleName, RolesConfig};
use crate::task::Queue;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Name of a flow. Tasks without one use `default`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FlowName(String);

impl<'de> Deserialize<'de> for FlowName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(FlowName::new(s))
    }
}

impl FlowName {
    pub const DEFAULT: &'static str = "default";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for FlowName {
    fn default() -> Self {
        Self::new(Self::DEFAULT)
    }
}

impl fmt::Display for FlowName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for FlowName {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(FlowName::new(s))
    }
}

/// The closed set of side effects a transition can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepName {
    PushBranch,
    RunChecks,
    OpenReviewRequest,
    PostReviewComment,
    MergeReviewRequest,
    RewriteTaskWithFeedback,
}

impl StepName {
    pub const ALL: [StepName; 6] = [
        StepName::PushBranch,
        StepName::RunChecks,
        StepName::OpenReviewRequest,
        StepName::PostReviewComment,
        StepName::MergeReviewRequest,
        StepName::RewriteTaskWithFeedback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::PushBranch => "push-branch",
            StepName::RunChecks => "run-checks",
            StepName::OpenReviewRequest => "open-review-request",
            StepName::PostReviewComment => "post-review-comment",
            StepName::MergeReviewRequest => "merge-review-request",
            StepName::RewriteTaskWithFeedback => "rewrite-task-with-feedback",
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepName {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepName::ALL
            .into_iter()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownStep(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    /// Evaluated by running a check step.
    Automatic,
    /// Evaluated by a worker of another role, whose decision gates the edge.
    Delegated,
}

/// A gate a work edge must pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub name: String,
    pub kind: ConditionKind,
    /// Evaluating role, for delegated conditions.
    #[serde(default)]
    pub role: Option<RoleName>,
    /// Check step for automatic conditions (default: run-checks).
    #[serde(default)]
    pub check: Option<StepName>,
    /// Where the task goes when the condition fails.
    #[serde(default)]
    pub on_fail: Option<Queue>,
    /// Steps run before the task is sent back to `on_fail`.
    #[serde(default)]
    pub on_fail_steps: Vec<StepName>,
}

impl Condition {
    pub fn check_step(&self) -> StepName {
        self.check.unwrap_or(StepName::RunChecks)
    }
}

/// One edge of a flow graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: Queue,
    pub to: Queue,
    /// Set on claim edges: the role whose claim takes this edge.
    #[serde(default)]
    pub claim: Option<RoleName>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub steps: Vec<StepName>,
}

impl Transition {
    pub fn is_claim_edge(&self) -> bool {
        self.claim.is_some()
    }

    /// The first condition that names a failure target.
    pub fn on_fail(&self) -> Option<&Queue> {
        self.conditions.iter().find_map(|c| c.on_fail.as_ref())
    }

    /// Steps to run when a delegated condition rejects.
    pub fn rejection_steps(&self) -> Vec<StepName> {
        self.conditions
            .iter()
            .filter(|c| c.kind == ConditionKind::Delegated)
            .flat_map(|c| c.on_fail_steps.iter().copied())
            .collect()
    }

    pub fn delegated_to(&self) -> impl Iterator<Item = &RoleName> {
        self.conditions
            .iter()
            .filter(|c| c.kind == ConditionKind::Delegated)
            .filter_map(|c| c.role.as_ref())
    }
}

/// Where a role picks up work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRoute {
    pub flow: FlowName,
    pub role: RoleName,
    /// Queue the role claims from.
    pub from: Queue,
    /// Queue the claim moves the task into (`None` keeps it in place).
    pub to: Option<Queue>,
    /// Whether the task's own role must equal the claimant's role.
    /// Gate roles review tasks that belong to other roles.
    pub match_task_role: bool,
}

/// Body of a `[flows.<name>.transitions."from -> to"]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransitionDef {
    #[serde(default)]
    pub claim: Option<RoleName>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub steps: Vec<StepName>,
}

/// A `[flows.<name>]` table as written in the pipeline config.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlowDef {
    #[serde(default)]
    pub initial: Option<Queue>,
    #[serde(default)]
    pub transitions: BTreeMap<String, TransitionDef>,
}

/// A named transition graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flow {
    pub name: FlowName,
    pub initial: Queue,
    pub transitions: Vec<Transition>,
}

impl Flow {
    /// `incoming -(claim implementer)-> claimed -[push-branch]-> provisional -> done`.
    pub fn default_flow() -> Self {
        Self {
            name: FlowName::default(),
            initial: Queue::incoming(),
            transitions: vec![
                Transition {
                    from: Queue::incoming(),
                    to: Queue::claimed(),
                    claim: Some(RoleName::new("implementer")),
                    conditions: Vec::new(),
                    steps: Vec::new(),
                },
                Transition {
                    from: Queue::claimed(),
                    to: Queue::provisional(),
                    claim: None,
                    conditions: Vec::new(),
                    steps: vec![StepName::PushBranch],
                },
                Transition {
                    from: Queue::provisional(),
                    to: Queue::done(),
                    claim: None,
                    conditions: Vec::new(),
                    steps: Vec::new(),
                },
            ],
        }
    }

    /// Build a flow from its config table, parsing the `from -> to` keys.
    pub fn from_def(name: FlowName, def: FlowDef) -> Result<Self, ConfigError> {
        let mut transitions = Vec::with_capacity(def.transitions.len());
        for (key, body) in def.transitions {
            let (from, to) = parse_transition_key(&key)?;
            transitions.push(Transition {
                from,
                to,
                claim: body.claim,
                conditions: body.conditions,
                steps: body.steps,
            });
        }
        Ok(Self {
            name,
            initial: def.initial.unwrap_or_else(Queue::incoming),
            transitions,
        })
    }

    pub fn failure_queue(&self) -> Queue {
        Queue::failed()
    }

    pub fn holding_queue(&self) -> Queue {
        Queue::needs_continuation()
    }

    /// The work edge leaving `queue`, if any.
    pub fn transition_from(&self, queue: &Queue) -> Option<&Transition> {
        self.transitions
            .iter()
            .find(|t| !t.is_claim_edge() && &t.from == queue)
    }

    /// Every queue this flow can put a task in.
    pub fn queues(&self) -> BTreeSet<Queue> {
        let mut queues = BTreeSet::new();
        queues.insert(self.initial.clone());
        queues.insert(self.failure_queue());
        queues.insert(self.holding_queue());
        for t in &self.transitions {
            queues.insert(t.from.clone());
            queues.insert(t.to.clone());
            for c in &t.conditions {
                if let Some(q) = &c.on_fail {
                    queues.insert(q.clone());
                }
            }
        }
        queues
    }

    /// Where each role claims work in this flow.
    pub fn claim_routes(&self) -> Vec<ClaimRoute> {
        let mut routes = Vec::new();
        for t in &self.transitions {
            if let Some(role) = &t.claim {
                routes.push(ClaimRoute {
                    flow: self.name.clone(),
                    role: role.clone(),
                    from: t.from.clone(),
                    to: (t.to != t.from).then(|| t.to.clone()),
                    match_task_role: true,
                });
            }
            for role in t.delegated_to() {
                routes.push(ClaimRoute {
                    flow: self.name.clone(),
                    role: role.clone(),
                    from: t.from.clone(),
                    to: None,
                    match_task_role: false,
                });
            }
        }
        routes
    }

    /// The queue a claim held in `queue` was taken from.
    ///
    /// For a claim edge `a -> b` that is `a`; for gate queues (claimed in
    /// place) it is the queue itself.
    pub fn claim_source(&self, queue: &Queue) -> Option<Queue> {
        if let Some(edge) = self
            .transitions
            .iter()
            .find(|t| t.is_claim_edge() && &t.to == queue)
        {
            return Some(edge.from.clone());
        }
        self.transition_from(queue).map(|_| queue.clone())
    }

    /// Whether the engine may move a task from `from` to `to`.
    pub fn permits(&self, from: &Queue, to: &Queue) -> bool {
        if from == to || to == &self.initial {
            return true;
        }
        let declared = self
            .transitions
            .iter()
            .any(|t| &t.from == from && &t.to == to);
        if declared {
            return true;
        }
        // Releasing a claim back to its source.
        if self
            .transitions
            .iter()
            .any(|t| t.is_claim_edge() && &t.to == from && &t.from == to)
        {
            return true;
        }
        if let Some(work) = self.transition_from(from) {
            if to == &self.failure_queue() || to == &self.holding_queue() {
                return true;
            }
            if work.conditions.iter().any(|c| c.on_fail.as_ref() == Some(to)) {
                return true;
            }
        }
        if from == &self.holding_queue() {
            return self.transition_from(to).is_some()
                || self
                    .transitions
                    .iter()
                    .any(|t| t.is_claim_edge() && &t.from == to);
        }
        false
    }

    /// Check the graph against the declared roles.
    pub fn validate(&self, roles: &RolesConfig) -> Result<(), ConfigError> {
        let flow = self.name.to_string();
        // on_fail may only point at queues the graph itself declares.
        let mut queues: BTreeSet<Queue> = self
            .transitions
            .iter()
            .flat_map(|t| [t.from.clone(), t.to.clone()])
            .collect();
        queues.insert(self.initial.clone());
        queues.insert(self.failure_queue());
        queues.insert(self.holding_queue());

        let mut work_sources = BTreeSet::new();
        for t in &self.transitions {
            if t.from.is_terminal() {
                return Err(ConfigError::TerminalHasExit {
                    flow,
                    queue: t.from.to_string(),
                });
            }
            if let Some(role) = &t.claim {
                if !roles.contains(role) {
                    return Err(ConfigError::UnknownRole {
                        flow,
                        role: role.to_string(),
                    });
                }
            } else if !work_sources.insert(t.from.clone()) {
                return Err(ConfigError::DuplicateTransition {
                    flow,
                    queue: t.from.to_string(),
                });
            }
            for c in &t.conditions {
                if c.kind == ConditionKind::Delegated {
                    let role = c.role.as_ref().ok_or_else(|| ConfigError::MissingConditionRole {
                        flow: flow.clone(),
                        condition: c.name.clone(),
                    })?;
                    if !roles.contains(role) {
                        return Err(ConfigError::UnknownRole {
                            flow,
                            role: role.to_string(),
                        });
                    }
                }
                if let Some(target) = &c.on_fail
                    && !queues.contains(target)
                {
                    return Err(ConfigError::UnknownQueue {
                        flow,
                        queue: target.to_string(),
                    });
                }
            }
        }

        if !self
            .transitions
            .iter()
            .any(|t| t.is_claim_edge() && t.from == self.initial)
        {
            return Err(ConfigError::NoInitialClaim {
                flow,
                queue: self.initial.to_string(),
            });
        }

        for t in self.transitions.iter().filter(|t| t.is_claim_edge()) {
            let Some(work) = self.transition_from(&t.to) else {
                return Err(ConfigError::DeadEnd {
                    flow,
                    queue: t.to.to_string(),
                });
            };
            // The claimant keeps its lease on `t.to`, so no gate role can claim it.
            if let Some(gate) = work
                .conditions
                .iter()
                .find(|c| c.kind == ConditionKind::Delegated)
            {
                return Err(ConfigError::UnreachableGate {
                    flow,
                    queue: t.to.to_string(),
                    condition: gate.name.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Parse `"claimed -> provisional"` into its two queues.
pub fn parse_transition_key(key: &str) -> Result<(Queue, Queue), ConfigError> {
    let (from, to) = key
        .split_once("->")
        .ok_or_else(|| ConfigError::BadTransitionKey(key.to_string()))?;
    let (from, to) = (from.trim(), to.trim());
    if from.is_empty() || to.is_empty() {
        return Err(ConfigError::BadTransitionKey(key.to_string()));
    }
    Ok((Queue::new(from), Queue::new(to)))
}

/// All flows known to the control plane.
#[derive(Debug, Clone)]
pub struct FlowSet {
    flows: BTreeMap<FlowName, Flow>,
}

impl FlowSet {
    /// Build and validate flows from config. A built-in `default` flow is
    /// added when the config does not define one.
    pub fn from_defs(
        defs: BTreeMap<FlowName, FlowDef>,
        roles: &RolesConfig,
    ) -> Result<Self, ConfigError> {
        let mut flows = BTreeMap::new();
        for (name, def) in defs {
            let flow = Flow::from_def(name.clone(), def)?;
            flows.insert(name, flow);
        }
        flows
            .entry(FlowName::default())
            .or_insert_with(Flow::default_flow);
        for flow in flows.values() {
            flow.validate(roles)?;
        }
        Ok(Self { flows })
    }

    pub fn from_flows(flows: impl IntoIterator<Item = Flow>) -> Self {
        Self {
            flows: flows.into_iter().map(|f| (f.name.clone(), f)).collect(),
        }
    }

    pub fn get(&self, name: &FlowName) -> Option<&Flow> {
        self.flows.get(name)
    }

    /// Resolve a task's flow, defaulting when unset.
    pub fn resolve(&self, name: Option<&FlowName>) -> Result<&Flow, ConfigError> {
        let name = name.cloned().unwrap_or_default();
        self.flows
            .get(&name)
            .ok_or_else(|| ConfigError::UnknownFlow(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Flow> {
        self.flows.values()
    }

    /// Claim routes for one role across all flows.
    pub fn claim_routes_for(&self, role: &RoleName) -> Vec<ClaimRoute> {
        self.flows
            .values()
            .flat_map(|f| f.claim_routes())
            .filter(|r| &r.role == role)
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::RoleConfig;
    use std::collections::HashMap;

    fn roles(names: &[&str]) -> RolesConfig {
        RolesConfig {
            roles: names
                .iter()
                .map(|n| {
                    (
                        RoleName::new(*n),
                        RoleConfig {
                            command: "true".into(),
                            args: Vec::new(),
                            env: HashMap::new(),
                            max_concurrent: 1,
                            timeout_secs: None,
                        },
                    )
                })
                .collect(),
        }
    }

    fn gated_flow() -> Flow {
        let def: FlowDef = toml::from_str(
            r#"
            [transitions."incoming -> claimed"]
            claim = "implementer"

            [transitions."claimed -> provisional"]
            steps = ["push-branch", "open-review-request"]

            [transitions."provisional -> done"]
            conditions = [{ name = "review", kind = "delegated", role = "gatekeeper", on_fail = "incoming", on_fail_steps = ["post-review-comment", "rewrite-task-with-feedback"] }]
            steps = ["merge-review-request"]
            "#,
        )
        .unwrap();
        Flow::from_def(FlowName::new("gated"), def).unwrap()
    }

    #[test]
    fn default_flow_is_valid() {
        Flow::default_flow()
            .validate(&roles(&["implementer"]))
            .unwrap();
    }

    #[test]
    fn parses_transition_keys() {
        let (from, to) = parse_transition_key(" claimed ->provisional").unwrap();
        assert_eq!(from, Queue::claimed());
        assert_eq!(to, Queue::provisional());
        assert!(parse_transition_key("claimed provisional").is_err());
        assert!(parse_transition_key("-> done").is_err());
    }

    #[test]
    fn gated_flow_claim_routes() {
        let flow = gated_flow();
        let routes = flow.claim_routes();
        assert_eq!(routes.len(), 2);
        let implementer = routes
            .iter()
            .find(|r| r.role == RoleName::new("implementer"))
            .unwrap();
        assert_eq!(implementer.from, Queue::incoming());
        assert_eq!(implementer.to, Some(Queue::claimed()));
        assert!(implementer.match_task_role);

        let gate = routes
            .iter()
            .find(|r| r.role == RoleName::new("gatekeeper"))
            .unwrap();
        assert_eq!(gate.from, Queue::provisional());
        assert_eq!(gate.to, None);
        assert!(!gate.match_task_role);
    }

    #[test]
    fn permits_declared_and_implicit_edges() {
        let flow = gated_flow();
        assert!(flow.permits(&Queue::claimed(), &Queue::provisional()));
        assert!(flow.permits(&Queue::provisional(), &Queue::done()));
        // on_fail target
        assert!(flow.permits(&Queue::provisional(), &Queue::incoming()));
        // failure and holding from a work queue
        assert!(flow.permits(&Queue::claimed(), &Queue::failed()));
        assert!(flow.permits(&Queue::claimed(), &Queue::needs_continuation()));
        // resume from holding
        assert!(flow.permits(&Queue::needs_continuation(), &Queue::claimed()));
        // skipping a stage is not an edge
        assert!(!flow.permits(&Queue::claimed(), &Queue::done()));
        assert!(!flow.permits(&Queue::incoming(), &Queue::provisional()));
        assert!(!flow.permits(&Queue::done(), &Queue::provisional()));
    }

    #[test]
    fn rejection_steps_come_from_delegated_conditions() {
        let flow = gated_flow();
        let gate = flow.transition_from(&Queue::provisional()).unwrap();
        assert_eq!(
            gate.rejection_steps(),
            vec![StepName::PostReviewComment, StepName::RewriteTaskWithFeedback]
        );
        let work = flow.transition_from(&Queue::claimed()).unwrap();
        assert!(work.rejection_steps().is_empty());
    }

    #[test]
    fn claim_source_of_work_and_gate_queues() {
        let flow = gated_flow();
        assert_eq!(flow.claim_source(&Queue::claimed()), Some(Queue::incoming()));
        assert_eq!(
            flow.claim_source(&Queue::provisional()),
            Some(Queue::provisional())
        );
        assert_eq!(flow.claim_source(&Queue::done()), None);
    }

    #[test]
    fn validate_rejects_unknown_gate_role() {
        let err = gated_flow().validate(&roles(&["implementer"])).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownRole { .. }));
    }

    #[test]
    fn validate_rejects_duplicate_work_edges() {
        let mut flow = gated_flow();
        flow.transitions.push(Transition {
            from: Queue::claimed(),
            to: Queue::done(),
            claim: None,
            conditions: Vec::new(),
            steps: Vec::new(),
        });
        let err = flow
            .validate(&roles(&["implementer", "gatekeeper"]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateTransition { .. }));
    }

    #[test]
    fn validate_rejects_unknown_on_fail_queue() {
        let mut flow = gated_flow();
        flow.transitions[1].conditions.push(Condition {
            name: "lint".into(),
            kind: ConditionKind::Automatic,
            role: None,
            check: None,
            on_fail: Some(Queue::new("nowhere")),
            on_fail_steps: Vec::new(),
        });
        let err = flow
            .validate(&roles(&["implementer", "gatekeeper"]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownQueue { .. }));
    }

    #[test]
    fn validate_rejects_exit_from_terminal_queue() {
        let mut flow = gated_flow();
        flow.transitions.push(Transition {
            from: Queue::done(),
            to: Queue::incoming(),
            claim: None,
            conditions: Vec::new(),
            steps: Vec::new(),
        });
        let err = flow
            .validate(&roles(&["implementer", "gatekeeper"]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::TerminalHasExit { .. }));
    }

    #[test]
    fn validate_rejects_claim_into_dead_end() {
        let flow = Flow {
            name: FlowName::new("stuck"),
            initial: Queue::incoming(),
            transitions: vec![Transition {
                from: Queue::incoming(),
                to: Queue::claimed(),
                claim: Some(RoleName::new("implementer")),
                conditions: Vec::new(),
                steps: Vec::new(),
            }],
        };
        let err = flow.validate(&roles(&["implementer"])).unwrap_err();
        assert!(matches!(err, ConfigError::DeadEnd { .. }));
    }

    #[test]
    fn validate_rejects_gate_on_claimed_queue() {
        let def: FlowDef = toml::from_str(
            r#"
            [transitions."incoming -> claimed"]
            claim = "implementer"

            [transitions."claimed -> done"]
            conditions = [{ name = "review", kind = "delegated", role = "gatekeeper", on_fail = "incoming" }]
            "#,
        )
        .unwrap();
        let flow = Flow::from_def(FlowName::new("shortcut"), def).unwrap();
        let err = flow
            .validate(&roles(&["implementer", "gatekeeper"]))
            .unwrap_err();
        match err {
            ConfigError::UnreachableGate {
                queue, condition, ..
            } => {
                assert_eq!(queue, "claimed");
                assert_eq!(condition, "review");
            }
            other => panic!("unexpected error: {other}"),
        }
        gated_flow()
            .validate(&roles(&["implementer", "gatekeeper"]))
            .unwrap();
    }

    #[test]
    fn unknown_step_names_fail_to_parse() {
        let err = toml::from_str::<FlowDef>(
            r#"
            [transitions."claimed -> provisional"]
            steps = ["deploy-to-prod"]
            "#,
        );
        assert!(err.is_err());
        assert!("deploy-to-prod".parse::<StepName>().is_err());
        assert_eq!(
            "open-review-request".parse::<StepName>().unwrap(),
            StepName::OpenReviewRequest
        );
    }

    #[test]
    fn flow_set_adds_default_and_resolves() {
        let set = FlowSet::from_defs(BTreeMap::new(), &roles(&["implementer"])).unwrap();
        assert_eq!(set.resolve(None).unwrap().name, FlowName::default());
        assert!(set.resolve(Some(&FlowName::new("missing"))).is_err());
        assert_eq!(set.claim_routes_for(&RoleName::new("implementer")).len(), 1);
    }
}
