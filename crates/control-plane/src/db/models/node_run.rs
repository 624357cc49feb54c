//! Node run model: one execution of one DAG node within a run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::models::JobRun;
use crate::engine::state::Status;
use crate::workflow::{Conditions, JobDef, NodeId, OutgoingHookConfig, Parameter, StageDef};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRun {
    pub id: i64,
    pub workflow_run_id: i64,
    pub workflow_id: i64,
    pub node_id: NodeId,
    pub node_name: String,
    /// Same as the run number.
    pub number: i64,
    /// Restart generation, 0 for the first run of the node.
    pub sub_number: i64,
    pub status: Status,
    #[serde(default)]
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub build_parameters: Vec<Parameter>,
    /// Flattened trigger payload.
    #[serde(default)]
    pub payload: BTreeMap<String, String>,
    #[serde(default)]
    pub manual: Option<ManualTrigger>,
    #[serde(default)]
    pub hook_event: Option<HookEvent>,
    /// Node runs this one was started from.
    #[serde(default)]
    pub source_node_runs: Vec<i64>,
    /// Status of each child this run triggered or declined.
    #[serde(default)]
    pub triggers_run: BTreeMap<NodeId, Status>,
    #[serde(default)]
    pub vcs: VcsInfo,
    #[serde(default)]
    pub outgoing_hook: Option<OutgoingHookRun>,
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub done: Option<DateTime<Utc>>,
    pub last_modified: DateTime<Utc>,
}

impl NodeRun {
    /// Set a status, stamping `done` when it is terminal.
    pub fn set_status(&mut self, status: Status) {
        self.status = status;
        let now = Utc::now();
        self.last_modified = now;
        if status.is_terminal() && self.done.is_none() {
            self.done = Some(now);
        }
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.build_parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }

    /// Stage holding the given job run.
    pub fn stage_of_job_mut(&mut self, job_run_id: i64) -> Option<&mut Stage> {
        self.stages
            .iter_mut()
            .find(|s| s.run_jobs.iter().any(|j| j.job_run_id == job_run_id))
    }
}

/// Stage snapshot kept on the node run; it outlives the job rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    #[serde(default)]
    pub conditions: Conditions,
    #[serde(default)]
    pub jobs: Vec<JobDef>,
    /// `None` until the stage is first visited.
    #[serde(default)]
    pub status: Option<Status>,
    #[serde(default)]
    pub run_jobs: Vec<RunJob>,
}

impl From<&StageDef> for Stage {
    fn from(def: &StageDef) -> Self {
        Self {
            id: def.id,
            name: def.name.clone(),
            enabled: def.enabled,
            conditions: def.conditions.clone(),
            jobs: def.jobs.clone(),
            status: None,
            run_jobs: Vec::new(),
        }
    }
}

/// Job summary inside a stage snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunJob {
    pub job_run_id: i64,
    pub job_id: i64,
    pub name: String,
    pub status: Status,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub done: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry: i32,
}

impl From<&JobRun> for RunJob {
    fn from(job: &JobRun) -> Self {
        Self {
            job_run_id: job.id,
            job_id: job.job.id,
            name: job.job.name.clone(),
            status: job.status,
            start: job.start,
            done: job.done,
            retry: job.retry,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualTrigger {
    pub username: String,
    #[serde(default)]
    pub fullname: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub pipeline_parameters: Vec<Parameter>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookEvent {
    pub hook_uuid: String,
    #[serde(default)]
    pub payload: BTreeMap<String, String>,
}

/// What started a processing call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunTrigger {
    Manual(ManualTrigger),
    Hook(HookEvent),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcsInfo {
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Asynchronous counterpart of a job for outgoing hook nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingHookRun {
    pub uuid: String,
    pub hook: OutgoingHookConfig,
    /// Task execution handle returned by the task service.
    #[serde(default)]
    pub execution_id: Option<String>,
    #[serde(default)]
    pub callback: Option<HookCallback>,
}

/// Terminal report sent back by the task service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookCallback {
    pub status: Status,
    #[serde(default)]
    pub log: String,
    pub done: DateTime<Utc>,
}
