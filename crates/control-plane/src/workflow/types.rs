//! Workflow definition types.
//!
//! A workflow is an immutable DAG addressed by stable integer node IDs.
//! Runs embed a snapshot of it, so nothing here changes while a run
//! is being processed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Stable identifier of a DAG node.
pub type NodeId = i64;

/// A named string value visible to node runs and jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: String,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Workflow DAG definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: i64,
    pub name: String,
    pub project_key: String,
    pub root_id: NodeId,
    pub nodes: BTreeMap<NodeId, Node>,
    #[serde(default)]
    pub pipelines: BTreeMap<i64, Pipeline>,
    #[serde(default)]
    pub applications: BTreeMap<i64, Application>,
    #[serde(default)]
    pub environments: BTreeMap<i64, Environment>,
    #[serde(default)]
    pub project_variables: Vec<Parameter>,
}

/// One vertex of the DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub context: NodeContext,
    /// Children started when this node reaches a terminal status.
    #[serde(default)]
    pub triggers: Vec<NodeId>,
}

/// Node kinds, one case per way a node runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Runs the stages of a pipeline.
    Pipeline { pipeline_id: i64 },
    /// Pass-through fan-out, done as soon as it is visited.
    Fork,
    /// Fan-in over the latest runs of every parent.
    Join { parents: Vec<NodeId> },
    /// Delegated to the external task service.
    OutgoingHook(OutgoingHookConfig),
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pipeline { .. } => "pipeline",
            Self::Fork => "fork",
            Self::Join { .. } => "join",
            Self::OutgoingHook(_) => "outgoing_hook",
        }
    }

    /// Whether a run of this kind completes in the same processing call
    /// that creates it.
    pub fn completes_immediately(&self) -> bool {
        matches!(self, Self::Fork | Self::Join { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingHookConfig {
    /// Hook model name understood by the task service (webhook, workflow, ...).
    pub model: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

/// Per-node context: what the node runs against and when it may run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeContext {
    #[serde(default)]
    pub application_id: Option<i64>,
    #[serde(default)]
    pub environment_id: Option<i64>,
    #[serde(default)]
    pub default_payload: Option<serde_json::Value>,
    #[serde(default)]
    pub default_pipeline_parameters: Vec<Parameter>,
    #[serde(default)]
    pub conditions: Conditions,
    /// At most one building run of this node per workflow.
    #[serde(default)]
    pub mutex: bool,
}

/// Run conditions: every plain condition must hold, then the optional
/// expression must render truthy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conditions {
    #[serde(default)]
    pub plain: Vec<PlainCondition>,
    #[serde(default)]
    pub expression: Option<String>,
}

impl Conditions {
    pub fn is_empty(&self) -> bool {
        self.plain.is_empty() && self.expression.as_deref().map_or(true, str::is_empty)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlainCondition {
    pub variable: String,
    pub operator: ConditionOperator,
    pub value: String,
}

impl PlainCondition {
    pub fn new(variable: &str, operator: ConditionOperator, value: &str) -> Self {
        Self {
            variable: variable.to_string(),
            operator,
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Regex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub stages: Vec<StageDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDef {
    pub id: i64,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub conditions: Conditions,
    #[serde(default)]
    pub jobs: Vec<JobDef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDef {
    pub id: i64,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub variables: Vec<Parameter>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub variables: Vec<Parameter>,
}

fn default_true() -> bool {
    true
}
