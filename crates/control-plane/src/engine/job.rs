//! Job run state machine.
//!
//! ```text
//! Waiting ──take──▶ Building ──▶ Success | Fail | Stopped
//!    │                 │
//!    └──────┬──────────┘
//!           ▼
//!   Skipped | Disabled
//! ```
//!
//! A terminal job never leaves its status: late reports from agents are
//! accepted and ignored. Every applied change is mirrored into the stage
//! snapshot of the owning node run.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::db::models::{AgentRef, JobRun, NodeRun, RunJob, SpawnInfo, SpawnMessage};
use crate::engine::orchestrator::WorkflowOrchestrator;
use crate::engine::report::ProcessorReport;
use crate::engine::state::Status;
use crate::error::{AppError, AppResult};
use crate::store::StoreTx;

/// Outcome of checking a requested job transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Apply,
    /// Stale report on a terminal job.
    Ignore,
}

/// Validate a job status change.
pub fn check_transition(current: Status, next: Status) -> AppResult<Transition> {
    match next {
        Status::Building if current == Status::Waiting => Ok(Transition::Apply),
        Status::Disabled | Status::Skipped => Ok(Transition::Apply),
        Status::Success | Status::Fail | Status::Stopped if current.is_terminal() => {
            Ok(Transition::Ignore)
        }
        Status::Success | Status::Fail | Status::Stopped => Ok(Transition::Apply),
        _ => Err(AppError::InvalidTransition {
            from: current,
            to: next,
        }),
    }
}

impl WorkflowOrchestrator {
    /// Apply a status to a job and advance its node run.
    ///
    /// `job` is reloaded under the row lock, so edits not yet written to the
    /// store are lost. Returns `false` when the update was a stale no-op.
    pub async fn update_job_status(
        &self,
        tx: &mut dyn StoreTx,
        job: &mut JobRun,
        status: Status,
        report: &mut ProcessorReport,
    ) -> AppResult<bool> {
        let current = tx.lock_job_run_status(job.id).await?;
        if check_transition(current, status)? == Transition::Ignore {
            debug!(job_run_id = job.id, %current, requested = %status, "Stale job status ignored");
            return Ok(false);
        }
        *job = tx.load_job_run(job.id).await?;

        let now = Utc::now();
        job.status = status;
        if status == Status::Building {
            job.start = Some(now);
        } else {
            job.done = Some(now);
        }
        tx.update_job_run(job).await?;
        report.add_job_run(job);
        info!(
            job_run_id = job.id,
            job = %job.job.name,
            from = %current,
            to = %status,
            "Job status changed"
        );

        let mut node_run = tx.load_node_run(job.node_run_id).await?;
        if node_run.status.is_terminal() {
            debug!(node_run_id = node_run.id, "Node run already terminal");
            return Ok(true);
        }
        sync_job_snapshot(&mut node_run, job);

        if status == Status::Building {
            if node_run.status == Status::Waiting {
                node_run.set_status(Status::Building);
                report.add_node_run(&node_run);
            }
            tx.update_node_run(&node_run).await?;
            let mut run = tx.load_run(node_run.workflow_run_id).await?;
            self.update_run_status(tx, &mut run, report).await?;
        } else {
            self.advance_node_run(tx, node_run, report).await?;
        }
        Ok(true)
    }

    /// Claim a waiting job for an agent.
    pub async fn take_job(
        &self,
        tx: &mut dyn StoreTx,
        job_id: i64,
        agent: &AgentRef,
        report: &mut ProcessorReport,
    ) -> AppResult<JobRun> {
        let current = tx.lock_job_run_status(job_id).await?;
        if current != Status::Waiting {
            return Err(AppError::AlreadyTaken(format!(
                "job {} is {}",
                job_id, current
            )));
        }

        let mut job = tx.load_job_run(job_id).await?;
        job.agent = Some(agent.clone());
        job.last_log_at = None;
        job.add_spawn_info(SpawnMessage::JobTaken {
            agent: agent.name.clone(),
        });
        tx.update_job_run(&job).await?;
        self.update_job_status(tx, &mut job, Status::Building, report)
            .await?;
        Ok(job)
    }

    /// Append audit entries to a job. Only the spawn infos column is written.
    pub async fn add_spawn_infos(
        &self,
        tx: &mut dyn StoreTx,
        job_id: i64,
        messages: Vec<SpawnMessage>,
    ) -> AppResult<JobRun> {
        let infos: Vec<SpawnInfo> = messages.into_iter().map(SpawnInfo::new).collect();
        tx.append_job_spawn_infos(job_id, &infos).await?;
        tx.load_job_run(job_id).await
    }

    /// Note log output from the agent running a job.
    ///
    /// Returns `false` when the job is no longer building.
    pub async fn record_log(
        &self,
        tx: &mut dyn StoreTx,
        job_id: i64,
        at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let recorded = tx.touch_job_run_log(job_id, at).await?;
        if !recorded {
            debug!(job_run_id = job_id, "Log activity on a job that is not building");
        }
        Ok(recorded)
    }

    /// Put a building job back in the queue for another agent.
    pub async fn restart_job(
        &self,
        tx: &mut dyn StoreTx,
        job: &mut JobRun,
        reason: &str,
        report: &mut ProcessorReport,
    ) -> AppResult<()> {
        tx.lock_job_run_status(job.id).await?;
        *job = tx.load_job_run(job.id).await?;
        job.retry += 1;
        job.status = Status::Waiting;
        job.queued = Utc::now();
        job.start = None;
        job.agent = None;
        job.last_log_at = None;
        job.add_spawn_info(SpawnMessage::JobRequeued {
            retry: job.retry,
            reason: reason.to_string(),
        });
        tx.update_job_run(job).await?;
        report.add_job_run(job);
        warn!(job_run_id = job.id, retry = job.retry, reason, "Job requeued");

        let mut node_run = tx.load_node_run(job.node_run_id).await?;
        if !node_run.status.is_terminal() {
            sync_job_snapshot(&mut node_run, job);
            tx.update_node_run(&node_run).await?;
        }
        Ok(())
    }
}

/// Mirror a job into its stage snapshot. A stage still waiting on its
/// jobs moves to building as soon as one of them changes.
fn sync_job_snapshot(node_run: &mut NodeRun, job: &JobRun) {
    let Some(stage) = node_run.stage_of_job_mut(job.id) else {
        warn!(
            node_run_id = node_run.id,
            job_run_id = job.id,
            "Job missing from stage snapshot"
        );
        return;
    };
    if let Some(run_job) = stage.run_jobs.iter_mut().find(|j| j.job_run_id == job.id) {
        *run_job = RunJob::from(job);
    }
    if stage.status == Some(Status::Waiting) && job.status != Status::Waiting {
        stage.status = Some(Status::Building);
    }
}
