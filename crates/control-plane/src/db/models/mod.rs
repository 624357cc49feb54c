//! Run-time entities persisted by the store.
//!
//! Definitions live in [`crate::workflow`]; these are the records a run
//! produces: the run itself, its node runs with their stage snapshots,
//! and the live job queue.

mod job_run;
mod node_run;
mod run;

pub use job_run::{Agent, AgentRef, DeadJob, DeadReason, JobRun, SpawnInfo, SpawnMessage};
pub use node_run::{
    HookCallback, HookEvent, ManualTrigger, NodeRun, OutgoingHookRun, RunJob, RunTrigger, Stage,
    VcsInfo,
};
pub use run::{RunInfo, RunMessage, WorkflowRun};
