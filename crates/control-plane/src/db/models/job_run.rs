//! Job run model: one job waiting for, or claimed by, an execution agent.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::state::Status;
use crate::workflow::{JobDef, Parameter};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub id: i64,
    pub node_run_id: i64,
    pub workflow_run_id: i64,
    pub stage_id: i64,
    pub job: JobDef,
    pub status: Status,
    pub queued: DateTime<Utc>,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub done: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub spawn_infos: Vec<SpawnInfo>,
    /// Agent that took the job.
    #[serde(default)]
    pub agent: Option<AgentRef>,
    /// Requeues after a dead agent was detected.
    #[serde(default)]
    pub retry: i32,
    /// Last time the agent streamed log output.
    #[serde(default)]
    pub last_log_at: Option<DateTime<Utc>>,
}

impl JobRun {
    pub fn new(node_run_id: i64, workflow_run_id: i64, stage_id: i64, job: JobDef) -> Self {
        Self {
            id: 0,
            node_run_id,
            workflow_run_id,
            stage_id,
            job,
            status: Status::Waiting,
            queued: Utc::now(),
            start: None,
            done: None,
            parameters: Vec::new(),
            spawn_infos: Vec::new(),
            agent: None,
            retry: 0,
            last_log_at: None,
        }
    }

    pub fn add_spawn_info(&mut self, message: SpawnMessage) {
        self.spawn_infos.push(SpawnInfo::new(message));
    }

    /// Latest sign of life from the agent.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_log_at.or(self.start).unwrap_or(self.queued)
    }
}

/// Reference to the execution agent holding a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRef {
    pub id: String,
    pub name: String,
}

/// Registered execution agent, as seen by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub disabled: bool,
    pub last_beat: DateTime<Utc>,
}

/// Scheduling audit entry on a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnInfo {
    pub at: DateTime<Utc>,
    pub message: SpawnMessage,
}

impl SpawnInfo {
    pub fn new(message: SpawnMessage) -> Self {
        Self {
            at: Utc::now(),
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "id", content = "args", rename_all = "snake_case")]
pub enum SpawnMessage {
    JobInQueue,
    JobTaken { agent: String },
    JobError { errors: String },
    JobRequeued { retry: i32, reason: String },
    JobStopped { reason: String },
    Agent(String),
}

impl fmt::Display for SpawnMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::JobInQueue => f.write_str("Job has been queued"),
            Self::JobTaken { agent } => write!(f, "Job taken by {}", agent),
            Self::JobError { errors } => write!(f, "Job cannot be run: {}", errors),
            Self::JobRequeued { retry, reason } => {
                write!(f, "Job replaced in queue (retry {}): {}", retry, reason)
            }
            Self::JobStopped { reason } => write!(f, "Job stopped: {}", reason),
            Self::Agent(msg) => f.write_str(msg),
        }
    }
}

/// Why the reconciler considers a building job dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadReason {
    AgentGone,
    NoLogs,
}

impl fmt::Display for DeadReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AgentGone => f.write_str("execution agent no longer available"),
            Self::NoLogs => f.write_str("no log output received"),
        }
    }
}

/// A building job selected by a dead job sweep.
#[derive(Debug, Clone)]
pub struct DeadJob {
    pub job: JobRun,
    pub reason: DeadReason,
}
