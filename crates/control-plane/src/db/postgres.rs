//! PostgreSQL implementation of the run store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};

use crate::db::models::{DeadJob, DeadReason, JobRun, NodeRun, SpawnInfo, WorkflowRun};
use crate::db::queries::{agent, job_run, node_run, run};
use crate::db::DbPool;
use crate::engine::state::Status;
use crate::error::{AppError, AppResult};
use crate::store::{Store, StoreTx};
use crate::workflow::NodeId;

const SCHEMA: &str = include_str!("schema.sql");

/// Run store backed by a connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Create missing tables and indexes.
    pub async fn migrate(&self) -> AppResult<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        tracing::info!("Database schema ready");
        Ok(())
    }

    /// Register an execution agent or refresh its heartbeat.
    pub async fn register_agent(&self, id: &str, name: &str) -> AppResult<()> {
        let mut conn = self.pool.acquire().await?;
        agent::upsert_agent(&mut conn, id, name).await
    }

    /// Disable an agent; its building jobs become dead on the next sweep.
    pub async fn disable_agent(&self, id: &str) -> AppResult<()> {
        let mut conn = self.pool.acquire().await?;
        if agent::set_disabled(&mut conn, id, true).await? == 0 {
            return Err(AppError::NotFound(format!("agent {}", id)));
        }
        Ok(())
    }

    pub async fn remove_agent(&self, id: &str) -> AppResult<()> {
        let mut conn = self.pool.acquire().await?;
        agent::delete_agent(&mut conn, id).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> AppResult<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx { tx }))
    }
}

/// One PostgreSQL transaction. Dropping it without commit rolls back.
struct PgTx {
    tx: Transaction<'static, Postgres>,
}

fn not_found(what: &str, id: i64) -> AppError {
    AppError::NotFound(format!("{} {}", what, id))
}

fn expect_one(affected: u64, what: &str, id: i64) -> AppResult<()> {
    if affected == 0 {
        return Err(not_found(what, id));
    }
    Ok(())
}

#[async_trait]
impl StoreTx for PgTx {
    async fn next_run_number(&mut self, workflow_id: i64) -> AppResult<i64> {
        run::next_run_number(&mut self.tx, workflow_id).await
    }

    async fn insert_run(&mut self, workflow_run: &mut WorkflowRun) -> AppResult<()> {
        workflow_run.id = run::insert_run(&mut self.tx, workflow_run).await?;
        Ok(())
    }

    async fn load_run(&mut self, run_id: i64) -> AppResult<WorkflowRun> {
        let mut workflow_run = run::get_run(&mut self.tx, run_id)
            .await?
            .ok_or_else(|| not_found("workflow run", run_id))?;
        for nr in node_run::list_for_run(&mut self.tx, run_id).await? {
            workflow_run.put_node_run(nr);
        }
        Ok(workflow_run)
    }

    async fn lock_run(&mut self, run_id: i64) -> AppResult<()> {
        if !run::lock_run(&mut self.tx, run_id).await? {
            return Err(not_found("workflow run", run_id));
        }
        Ok(())
    }

    async fn update_run(&mut self, workflow_run: &WorkflowRun) -> AppResult<()> {
        let affected = run::update_run(&mut self.tx, workflow_run).await?;
        expect_one(affected, "workflow run", workflow_run.id)
    }

    async fn node_run_exists(
        &mut self,
        run_id: i64,
        node_id: NodeId,
        sub_number: i64,
    ) -> AppResult<bool> {
        node_run::exists(&mut self.tx, run_id, node_id, sub_number).await
    }

    async fn insert_node_run(&mut self, nr: &mut NodeRun) -> AppResult<()> {
        nr.id = node_run::insert_node_run(&mut self.tx, nr).await?;
        Ok(())
    }

    async fn load_node_run(&mut self, node_run_id: i64) -> AppResult<NodeRun> {
        node_run::get_node_run(&mut self.tx, node_run_id)
            .await?
            .ok_or_else(|| not_found("node run", node_run_id))
    }

    async fn lock_node_run(&mut self, node_run_id: i64) -> AppResult<NodeRun> {
        node_run::lock_node_run(&mut self.tx, node_run_id)
            .await?
            .ok_or_else(|| not_found("node run", node_run_id))
    }

    async fn update_node_run(&mut self, nr: &NodeRun) -> AppResult<()> {
        let affected = node_run::update_node_run(&mut self.tx, nr).await?;
        expect_one(affected, "node run", nr.id)
    }

    async fn count_building_node_runs(
        &mut self,
        workflow_id: i64,
        node_id: NodeId,
        exclude_run_id: i64,
    ) -> AppResult<i64> {
        node_run::count_building(&mut self.tx, workflow_id, node_id, exclude_run_id).await
    }

    async fn next_mutex_waiter(
        &mut self,
        workflow_id: i64,
        node_id: NodeId,
        exclude_run_id: i64,
    ) -> AppResult<Option<NodeRun>> {
        node_run::next_mutex_waiter(&mut self.tx, workflow_id, node_id, exclude_run_id).await
    }

    async fn find_stuck_node_runs(&mut self, older_than: DateTime<Utc>) -> AppResult<Vec<NodeRun>> {
        node_run::find_stuck(&mut self.tx, older_than).await
    }

    async fn insert_job_run(&mut self, job: &mut JobRun) -> AppResult<()> {
        job.id = job_run::insert_job_run(&mut self.tx, job).await?;
        Ok(())
    }

    async fn load_job_run(&mut self, job_id: i64) -> AppResult<JobRun> {
        job_run::get_job_run(&mut self.tx, job_id)
            .await?
            .ok_or_else(|| not_found("job run", job_id))
    }

    async fn lock_job_run_status(&mut self, job_id: i64) -> AppResult<Status> {
        job_run::lock_status(&mut self.tx, job_id)
            .await?
            .ok_or_else(|| not_found("job run", job_id))
    }

    async fn update_job_run(&mut self, job: &JobRun) -> AppResult<()> {
        let affected = job_run::update_job_run(&mut self.tx, job).await?;
        expect_one(affected, "job run", job.id)
    }

    async fn touch_job_run_log(&mut self, job_id: i64, at: DateTime<Utc>) -> AppResult<bool> {
        let affected = job_run::touch_log(&mut self.tx, job_id, at).await?;
        Ok(affected > 0)
    }

    async fn append_job_spawn_infos(&mut self, job_id: i64, infos: &[SpawnInfo]) -> AppResult<()> {
        let affected = job_run::append_spawn_infos(&mut self.tx, job_id, infos).await?;
        expect_one(affected, "job run", job_id)
    }

    async fn delete_job_runs(&mut self, node_run_id: i64) -> AppResult<u64> {
        job_run::delete_for_node_run(&mut self.tx, node_run_id).await
    }

    async fn find_dead_jobs(&mut self, stale_before: DateTime<Utc>) -> AppResult<Vec<DeadJob>> {
        let building = job_run::list_building_with_agent(&mut self.tx).await?;
        Ok(building
            .into_iter()
            .filter_map(|(job, agent_alive)| {
                let reason = if !agent_alive {
                    DeadReason::AgentGone
                } else if job.last_activity() < stale_before {
                    DeadReason::NoLogs
                } else {
                    return None;
                };
                Some(DeadJob { job, reason })
            })
            .collect())
    }

    async fn commit(self: Box<Self>) -> AppResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> AppResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
