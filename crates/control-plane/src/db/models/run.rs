//! Workflow run model.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::models::NodeRun;
use crate::engine::state::{Status, StatusCounter};
use crate::workflow::{NodeId, Workflow};

/// One execution of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: i64,
    pub workflow_id: i64,
    /// Monotonic per workflow.
    pub number: i64,
    /// Cached aggregate of the latest node runs.
    pub status: Status,
    /// Definition snapshot taken when the run started.
    pub workflow: Workflow,
    /// Node runs per node, most recent sub number first.
    #[serde(default)]
    pub node_runs: BTreeMap<NodeId, Vec<NodeRun>>,
    pub last_sub_number: i64,
    #[serde(default)]
    pub infos: Vec<RunInfo>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub start: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn new(workflow: Workflow, number: i64) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            workflow_id: workflow.id,
            number,
            status: Status::Waiting,
            workflow,
            node_runs: BTreeMap::new(),
            last_sub_number: 0,
            infos: Vec::new(),
            tags: BTreeMap::new(),
            start: now,
            last_modified: now,
        }
    }

    /// Most recent run of a node.
    pub fn latest_node_run(&self, node_id: NodeId) -> Option<&NodeRun> {
        self.node_runs.get(&node_id).and_then(|runs| runs.first())
    }

    pub fn node_run_at(&self, node_id: NodeId, sub_number: i64) -> Option<&NodeRun> {
        self.node_runs
            .get(&node_id)
            .and_then(|runs| runs.iter().find(|nr| nr.sub_number == sub_number))
    }

    pub fn find_node_run(&self, node_run_id: i64) -> Option<&NodeRun> {
        self.node_runs
            .values()
            .flat_map(|runs| runs.iter())
            .find(|nr| nr.id == node_run_id)
    }

    pub fn find_node_run_mut(&mut self, node_run_id: i64) -> Option<&mut NodeRun> {
        self.node_runs
            .values_mut()
            .flat_map(|runs| runs.iter_mut())
            .find(|nr| nr.id == node_run_id)
    }

    /// Insert or replace a node run, keeping most recent first.
    pub fn put_node_run(&mut self, node_run: NodeRun) {
        self.last_sub_number = self.last_sub_number.max(node_run.sub_number);
        let runs = self.node_runs.entry(node_run.node_id).or_default();
        match runs.iter_mut().find(|nr| nr.id == node_run.id) {
            Some(existing) => *existing = node_run,
            None => runs.push(node_run),
        }
        runs.sort_by(|a, b| b.sub_number.cmp(&a.sub_number));
    }

    pub fn max_sub_number(&self) -> i64 {
        self.node_runs
            .values()
            .flat_map(|runs| runs.iter().map(|nr| nr.sub_number))
            .max()
            .unwrap_or(0)
    }

    /// Aggregate status over the latest run of every node.
    pub fn compute_status(&self) -> Status {
        let counter: StatusCounter = self
            .node_runs
            .values()
            .filter_map(|runs| runs.first())
            .map(|nr| nr.status)
            .collect();
        counter.status()
    }

    /// Attach a message; an identical message for the same sub number is kept once.
    pub fn add_info(&mut self, message: RunMessage, sub_number: i64) {
        if self
            .infos
            .iter()
            .any(|i| i.sub_number == sub_number && i.message == message)
        {
            return;
        }
        tracing::debug!(run_id = self.id, %message, "Run info added");
        self.infos.push(RunInfo {
            at: Utc::now(),
            is_error: message.is_error(),
            sub_number,
            message,
        });
    }

    /// Set a tag unless it is already present.
    pub fn tag(&mut self, key: &str, value: &str) {
        if !value.is_empty() {
            self.tags
                .entry(key.to_string())
                .or_insert_with(|| value.to_string());
        }
    }
}

/// User-facing note attached to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub at: DateTime<Utc>,
    pub message: RunMessage,
    pub is_error: bool,
    pub sub_number: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "id", content = "args", rename_all = "snake_case")]
pub enum RunMessage {
    WorkflowStarting { workflow: String, number: i64 },
    ParameterError { node: String, errors: String },
    ConditionError { node: String, error: String },
    NodeMutex { node: String },
    NodeMutexRelease { node: String },
    HookFailed { node: String, error: String },
    WorkflowStopped { by: String },
    Error(String),
}

impl RunMessage {
    pub fn is_error(&self) -> bool {
        !matches!(
            self,
            Self::WorkflowStarting { .. }
                | Self::NodeMutex { .. }
                | Self::NodeMutexRelease { .. }
                | Self::WorkflowStopped { .. }
        )
    }
}

impl fmt::Display for RunMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkflowStarting { workflow, number } => {
                write!(f, "Workflow {} v{} starting", workflow, number)
            }
            Self::ParameterError { node, errors } => {
                write!(f, "Unable to compute parameters of {}: {}", node, errors)
            }
            Self::ConditionError { node, error } => {
                write!(f, "Unable to evaluate conditions of {}: {}", node, error)
            }
            Self::NodeMutex { node } => {
                write!(f, "Node {} is waiting for another run to finish", node)
            }
            Self::NodeMutexRelease { node } => write!(f, "Mutex on node {} released", node),
            Self::HookFailed { node, error } => {
                write!(f, "Outgoing hook {} failed: {}", node, error)
            }
            Self::WorkflowStopped { by } => write!(f, "Workflow stopped by {}", by),
            Self::Error(msg) => f.write_str(msg),
        }
    }
}
