//! Transactional storage seam for the run engine.
//!
//! Every engine operation works against a [`StoreTx`]: it reads, locks and
//! writes rows, and the caller decides whether to commit. Two
//! implementations exist:
//!
//! - [`crate::db::PgStore`]: PostgreSQL, row locks via `FOR UPDATE [NOWAIT]`
//! - [`MemoryStore`]: in-process, used by tests and local runs

mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::models::{DeadJob, JobRun, NodeRun, SpawnInfo, WorkflowRun};
use crate::engine::state::Status;
use crate::error::AppResult;
use crate::workflow::NodeId;

pub use memory::MemoryStore;

/// Opens transactions.
#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> AppResult<Box<dyn StoreTx>>;
}

/// One open transaction.
///
/// `lock_run` and `lock_node_run` never wait: a row held by another
/// transaction yields [`crate::AppError::Locked`]. `lock_job_run_status`
/// waits, as it only guards a single job row. Writes that race agent
/// reports on a job row go through the column-scoped
/// `touch_job_run_log` and `append_job_spawn_infos`.
#[async_trait]
pub trait StoreTx: Send {
    async fn next_run_number(&mut self, workflow_id: i64) -> AppResult<i64>;

    /// Insert a run and assign its ID.
    async fn insert_run(&mut self, run: &mut WorkflowRun) -> AppResult<()>;

    /// Load a run together with all its node runs.
    async fn load_run(&mut self, run_id: i64) -> AppResult<WorkflowRun>;

    async fn lock_run(&mut self, run_id: i64) -> AppResult<()>;

    /// Persist run-level fields (status, infos, tags, sub number).
    async fn update_run(&mut self, run: &WorkflowRun) -> AppResult<()>;

    async fn node_run_exists(
        &mut self,
        run_id: i64,
        node_id: NodeId,
        sub_number: i64,
    ) -> AppResult<bool>;

    async fn insert_node_run(&mut self, node_run: &mut NodeRun) -> AppResult<()>;

    async fn load_node_run(&mut self, node_run_id: i64) -> AppResult<NodeRun>;

    async fn lock_node_run(&mut self, node_run_id: i64) -> AppResult<NodeRun>;

    async fn update_node_run(&mut self, node_run: &NodeRun) -> AppResult<()>;

    /// Building runs of `node_id` in other runs of the workflow.
    async fn count_building_node_runs(
        &mut self,
        workflow_id: i64,
        node_id: NodeId,
        exclude_run_id: i64,
    ) -> AppResult<i64>;

    /// Oldest node run of `node_id` in another run still waiting on the mutex.
    async fn next_mutex_waiter(
        &mut self,
        workflow_id: i64,
        node_id: NodeId,
        exclude_run_id: i64,
    ) -> AppResult<Option<NodeRun>>;

    /// Non-terminal node runs untouched since `older_than` with no live job.
    async fn find_stuck_node_runs(&mut self, older_than: DateTime<Utc>) -> AppResult<Vec<NodeRun>>;

    /// Insert a job run and assign its ID.
    async fn insert_job_run(&mut self, job: &mut JobRun) -> AppResult<()>;

    async fn load_job_run(&mut self, job_id: i64) -> AppResult<JobRun>;

    /// Blocking row lock, returns the current status.
    async fn lock_job_run_status(&mut self, job_id: i64) -> AppResult<Status>;

    async fn update_job_run(&mut self, job: &JobRun) -> AppResult<()>;

    /// Stamp agent log activity without touching other columns.
    ///
    /// Returns `false` when the job is missing or no longer building.
    async fn touch_job_run_log(&mut self, job_id: i64, at: DateTime<Utc>) -> AppResult<bool>;

    /// Append to the spawn infos of a job without touching other columns.
    async fn append_job_spawn_infos(&mut self, job_id: i64, infos: &[SpawnInfo]) -> AppResult<()>;

    /// Purge the live job rows of a node run.
    async fn delete_job_runs(&mut self, node_run_id: i64) -> AppResult<u64>;

    /// Building jobs whose agent is gone or that logged nothing since `stale_before`.
    async fn find_dead_jobs(&mut self, stale_before: DateTime<Utc>) -> AppResult<Vec<DeadJob>>;

    async fn commit(self: Box<Self>) -> AppResult<()>;

    async fn rollback(self: Box<Self>) -> AppResult<()>;
}
