//! Run service: the operations exposed to callers outside the engine.
//!
//! Starting, restarting and stopping runs, the agent-facing job lifecycle
//! (book, take, status, logs) and outgoing hook callbacks. Each operation
//! runs in its own transaction; events and follow-up requests go out only
//! after commit.

use std::future::Future;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::db::models::{
    AgentRef, HookCallback, JobRun, ManualTrigger, RunTrigger, SpawnMessage, WorkflowRun,
};
use crate::engine::{ProcessStart, ProcessorReport, RunRequest, Status};
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::workflow::{NodeId, Workflow};

/// Attempts for an operation whose run row is held by another transaction.
const LOCK_ATTEMPTS: u32 = 5;

#[derive(Clone)]
pub struct RunService {
    state: AppState,
}

impl RunService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Create a run of `workflow` and start its root node.
    pub async fn start_run(
        &self,
        workflow: Workflow,
        trigger: RunTrigger,
    ) -> AppResult<WorkflowRun> {
        workflow.validate()?;

        let mut tx = self.state.store.begin().await?;
        let number = tx.next_run_number(workflow.id).await?;
        let mut run = WorkflowRun::new(workflow, number);
        tx.insert_run(&mut run).await?;

        let mut report = ProcessorReport::new();
        let started = self
            .state
            .engine
            .process(tx.as_mut(), &mut run, ProcessStart::Root(trigger), &mut report)
            .await?;
        if !started {
            tx.rollback().await?;
            return Err(AppError::Validation(format!(
                "conditions of the root node of {} are not met",
                run.workflow.name
            )));
        }

        report.add_run(&run);
        self.state.commit(tx, report).await?;
        info!(run_id = run.id, number = run.number, workflow = %run.workflow.name, "Run started");
        Ok(run)
    }

    /// Run `node_id` again in a new sub number, then everything after it.
    pub async fn restart_from_node(
        &self,
        run_id: i64,
        node_id: NodeId,
        manual: Option<ManualTrigger>,
    ) -> AppResult<WorkflowRun> {
        self.retry_locked(move || self.try_restart_from_node(run_id, node_id, manual.clone()))
            .await
    }

    async fn try_restart_from_node(
        &self,
        run_id: i64,
        node_id: NodeId,
        manual: Option<ManualTrigger>,
    ) -> AppResult<WorkflowRun> {
        let mut tx = self.state.store.begin().await?;
        tx.lock_run(run_id).await?;
        let mut run = tx.load_run(run_id).await?;

        let mut report = ProcessorReport::new();
        let start = ProcessStart::FromNode {
            node_id,
            trigger: manual.map(RunTrigger::Manual),
        };
        let started = self
            .state
            .engine
            .process(tx.as_mut(), &mut run, start, &mut report)
            .await?;
        if !started {
            tx.rollback().await?;
            return Err(AppError::Validation(format!(
                "conditions of node {} are not met",
                node_id
            )));
        }

        self.state.commit(tx, report).await?;
        Ok(run)
    }

    /// Reserve a waiting job for an agent.
    pub async fn book_job(&self, job_id: i64, agent: &AgentRef) -> AppResult<()> {
        let mut tx = self.state.store.begin().await?;
        let job = tx.load_job_run(job_id).await?;
        tx.rollback().await?;
        if job.status != Status::Waiting {
            return Err(AppError::AlreadyTaken(format!(
                "job {} is {}",
                job_id, job.status
            )));
        }
        self.state.bookings.book(job_id, agent).await
    }

    pub async fn free_job(&self, job_id: i64) -> AppResult<()> {
        self.state.bookings.free(job_id).await
    }

    /// Claim a job for an agent. A job booked by another agent is refused.
    pub async fn take_job(&self, job_id: i64, agent: &AgentRef) -> AppResult<JobRun> {
        if let Some(holder) = self.state.bookings.booked_by(job_id).await? {
            if holder.id != agent.id {
                return Err(AppError::AlreadyTaken(format!(
                    "job {} is booked by {}",
                    job_id, holder.name
                )));
            }
        }

        let job = self
            .retry_locked(move || self.try_take_job(job_id, agent))
            .await?;
        if self.state.bookings.free(job_id).await.is_err() {
            debug!(job_id, "Job taken without booking");
        }
        Ok(job)
    }

    async fn try_take_job(&self, job_id: i64, agent: &AgentRef) -> AppResult<JobRun> {
        let mut tx = self.state.store.begin().await?;
        let job = tx.load_job_run(job_id).await?;
        tx.lock_run(job.workflow_run_id).await?;

        let mut report = ProcessorReport::new();
        let job = self
            .state
            .engine
            .take_job(tx.as_mut(), job_id, agent, &mut report)
            .await?;
        self.state.commit(tx, report).await?;
        Ok(job)
    }

    /// Apply a status reported for a job.
    ///
    /// Returns `false` when the report arrived after the job was terminal.
    pub async fn update_job_status(&self, job_id: i64, status: Status) -> AppResult<bool> {
        self.retry_locked(move || self.try_update_job_status(job_id, status))
            .await
    }

    async fn try_update_job_status(&self, job_id: i64, status: Status) -> AppResult<bool> {
        let mut tx = self.state.store.begin().await?;
        let mut job = tx.load_job_run(job_id).await?;
        tx.lock_run(job.workflow_run_id).await?;

        let mut report = ProcessorReport::new();
        let applied = self
            .state
            .engine
            .update_job_status(tx.as_mut(), &mut job, status, &mut report)
            .await?;
        self.state.commit(tx, report).await?;
        Ok(applied)
    }

    pub async fn add_spawn_infos(
        &self,
        job_id: i64,
        messages: Vec<SpawnMessage>,
    ) -> AppResult<JobRun> {
        let mut tx = self.state.store.begin().await?;
        let job = self
            .state
            .engine
            .add_spawn_infos(tx.as_mut(), job_id, messages)
            .await?;
        tx.commit().await?;
        Ok(job)
    }

    /// Note that the agent running a job produced output at `at`.
    pub async fn record_log(&self, job_id: i64, at: DateTime<Utc>) -> AppResult<bool> {
        let mut tx = self.state.store.begin().await?;
        let recorded = self.state.engine.record_log(tx.as_mut(), job_id, at).await?;
        tx.commit().await?;
        Ok(recorded)
    }

    /// Terminal report from the task service for an outgoing hook.
    pub async fn complete_outgoing_hook(
        &self,
        run_id: i64,
        hook_uuid: &str,
        callback: HookCallback,
    ) -> AppResult<bool> {
        self.retry_locked(move || {
            self.try_complete_outgoing_hook(run_id, hook_uuid, callback.clone())
        })
        .await
    }

    async fn try_complete_outgoing_hook(
        &self,
        run_id: i64,
        hook_uuid: &str,
        callback: HookCallback,
    ) -> AppResult<bool> {
        let mut tx = self.state.store.begin().await?;
        tx.lock_run(run_id).await?;
        let mut run = tx.load_run(run_id).await?;

        let mut report = ProcessorReport::new();
        let applied = self
            .state
            .engine
            .complete_outgoing_hook(tx.as_mut(), &mut run, hook_uuid, callback, &mut report)
            .await?;
        self.state.commit(tx, report).await?;
        Ok(applied)
    }

    /// Stop every unfinished node run of a run on behalf of `by`.
    pub async fn stop_run(&self, run_id: i64, by: &str) -> AppResult<WorkflowRun> {
        self.retry_locked(move || self.try_stop_run(run_id, by))
            .await
    }

    async fn try_stop_run(&self, run_id: i64, by: &str) -> AppResult<WorkflowRun> {
        let mut tx = self.state.store.begin().await?;
        tx.lock_run(run_id).await?;

        let mut report = ProcessorReport::new();
        let run = self
            .state
            .engine
            .stop_run(tx.as_mut(), run_id, by, &mut report)
            .await?;
        self.state.commit(tx, report).await?;
        Ok(run)
    }

    /// Stop one node run. Returns `false` when it had already finished.
    pub async fn stop_node_run(&self, run_id: i64, node_run_id: i64, by: &str) -> AppResult<bool> {
        self.retry_locked(move || self.try_stop_node_run(run_id, node_run_id, by))
            .await
    }

    async fn try_stop_node_run(&self, run_id: i64, node_run_id: i64, by: &str) -> AppResult<bool> {
        let mut tx = self.state.store.begin().await?;
        tx.lock_run(run_id).await?;
        let node_run = tx.load_node_run(node_run_id).await?;
        if node_run.workflow_run_id != run_id {
            tx.rollback().await?;
            return Err(AppError::NotFound(format!(
                "node run {} in run {}",
                node_run_id, run_id
            )));
        }

        let mut report = ProcessorReport::new();
        let reason = format!("stopped by {}", by);
        let stopped = self
            .state
            .engine
            .stop_node_run(tx.as_mut(), node_run_id, &reason, &mut report)
            .await?;
        self.state.commit(tx, report).await?;
        Ok(stopped)
    }

    /// Ask the dispatcher to process a run.
    pub async fn notify(&self, run_id: i64) -> AppResult<()> {
        self.state.queue.produce(RunRequest::run(run_id)).await
    }

    pub async fn load_run(&self, run_id: i64) -> AppResult<WorkflowRun> {
        let mut tx = self.state.store.begin().await?;
        let run = tx.load_run(run_id).await?;
        tx.rollback().await?;
        Ok(run)
    }

    async fn retry_locked<T, F, Fut>(&self, mut op: F) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Err(e) if e.is_retryable() && attempt < LOCK_ATTEMPTS => {
                    debug!(attempt, error = %e, "Run locked, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.state.config.lock_retry_delay()).await;
                }
                result => return result,
            }
        }
    }
}
