//! Job run queries.

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection};

use crate::db::models::{AgentRef, JobRun, SpawnInfo};
use crate::engine::state::Status;
use crate::error::{AppError, AppResult};
use crate::workflow::{JobDef, Parameter};

const JOB_RUN_COLUMNS: &str = r#"
    id, node_run_id, workflow_run_id, stage_id, job, status, queued, start, done,
    parameters, spawn_infos, agent_id, agent_name, retry, last_log_at
"#;

#[derive(Debug, FromRow)]
pub(crate) struct JobRunRow {
    id: i64,
    node_run_id: i64,
    workflow_run_id: i64,
    stage_id: i64,
    job: Json<JobDef>,
    status: String,
    queued: DateTime<Utc>,
    start: Option<DateTime<Utc>>,
    done: Option<DateTime<Utc>>,
    parameters: Json<Vec<Parameter>>,
    spawn_infos: Json<Vec<SpawnInfo>>,
    agent_id: Option<String>,
    agent_name: Option<String>,
    retry: i32,
    last_log_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRunRow> for JobRun {
    type Error = AppError;

    fn try_from(row: JobRunRow) -> AppResult<Self> {
        let agent = match (row.agent_id, row.agent_name) {
            (Some(id), Some(name)) => Some(AgentRef { id, name }),
            (Some(id), None) => Some(AgentRef {
                name: id.clone(),
                id,
            }),
            _ => None,
        };
        Ok(Self {
            id: row.id,
            node_run_id: row.node_run_id,
            workflow_run_id: row.workflow_run_id,
            stage_id: row.stage_id,
            job: row.job.0,
            status: row.status.parse()?,
            queued: row.queued,
            start: row.start,
            done: row.done,
            parameters: row.parameters.0,
            spawn_infos: row.spawn_infos.0,
            agent,
            retry: row.retry,
            last_log_at: row.last_log_at,
        })
    }
}

pub async fn insert_job_run(conn: &mut PgConnection, job: &JobRun) -> AppResult<i64> {
    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO workflow_node_run_job (
            node_run_id, workflow_run_id, stage_id, job, status, queued, start, done,
            parameters, spawn_infos, agent_id, agent_name, retry, last_log_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        RETURNING id
        "#,
    )
    .bind(job.node_run_id)
    .bind(job.workflow_run_id)
    .bind(job.stage_id)
    .bind(Json(&job.job))
    .bind(job.status.as_str())
    .bind(job.queued)
    .bind(job.start)
    .bind(job.done)
    .bind(Json(&job.parameters))
    .bind(Json(&job.spawn_infos))
    .bind(job.agent.as_ref().map(|a| a.id.as_str()))
    .bind(job.agent.as_ref().map(|a| a.name.as_str()))
    .bind(job.retry)
    .bind(job.last_log_at)
    .fetch_one(conn)
    .await?;

    Ok(row.0)
}

pub async fn get_job_run(conn: &mut PgConnection, job_id: i64) -> AppResult<Option<JobRun>> {
    let sql = format!(
        "SELECT {} FROM workflow_node_run_job WHERE id = $1",
        JOB_RUN_COLUMNS
    );
    let row = sqlx::query_as::<_, JobRunRow>(&sql)
        .bind(job_id)
        .fetch_optional(conn)
        .await?;

    row.map(JobRun::try_from).transpose()
}

/// Lock a job row, waiting for concurrent updates, and return its status.
pub async fn lock_status(conn: &mut PgConnection, job_id: i64) -> AppResult<Option<Status>> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT status FROM workflow_node_run_job WHERE id = $1 FOR UPDATE")
            .bind(job_id)
            .fetch_optional(conn)
            .await?;

    row.map(|(status,)| status.parse()).transpose()
}

pub async fn update_job_run(conn: &mut PgConnection, job: &JobRun) -> AppResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE workflow_node_run_job
        SET status = $2, start = $3, done = $4, parameters = $5, spawn_infos = $6,
            agent_id = $7, agent_name = $8, retry = $9, last_log_at = $10
        WHERE id = $1
        "#,
    )
    .bind(job.id)
    .bind(job.status.as_str())
    .bind(job.start)
    .bind(job.done)
    .bind(Json(&job.parameters))
    .bind(Json(&job.spawn_infos))
    .bind(job.agent.as_ref().map(|a| a.id.as_str()))
    .bind(job.agent.as_ref().map(|a| a.name.as_str()))
    .bind(job.retry)
    .bind(job.last_log_at)
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

/// Stamp log activity on a job that is still building.
pub async fn touch_log(
    conn: &mut PgConnection,
    job_id: i64,
    at: DateTime<Utc>,
) -> AppResult<u64> {
    let result = sqlx::query(
        "UPDATE workflow_node_run_job SET last_log_at = $2 WHERE id = $1 AND status = $3",
    )
    .bind(job_id)
    .bind(at)
    .bind(Status::Building.as_str())
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

pub async fn append_spawn_infos(
    conn: &mut PgConnection,
    job_id: i64,
    infos: &[SpawnInfo],
) -> AppResult<u64> {
    let result = sqlx::query(
        "UPDATE workflow_node_run_job SET spawn_infos = spawn_infos || $2 WHERE id = $1",
    )
    .bind(job_id)
    .bind(Json(infos))
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

pub async fn delete_for_node_run(conn: &mut PgConnection, node_run_id: i64) -> AppResult<u64> {
    let result = sqlx::query("DELETE FROM workflow_node_run_job WHERE node_run_id = $1")
        .bind(node_run_id)
        .execute(conn)
        .await?;

    Ok(result.rows_affected())
}

/// Building jobs paired with whether their agent is still registered and enabled.
pub async fn list_building_with_agent(
    conn: &mut PgConnection,
) -> AppResult<Vec<(JobRun, bool)>> {
    #[derive(FromRow)]
    struct Row {
        #[sqlx(flatten)]
        job: JobRunRow,
        agent_alive: bool,
    }

    let sql = format!(
        r#"
        SELECT {}, COALESCE(NOT a.disabled, FALSE) AS agent_alive
        FROM workflow_node_run_job j
        LEFT JOIN agent a ON a.id = j.agent_id
        WHERE j.status = $1
        ORDER BY j.id
        "#,
        JOB_RUN_COLUMNS
            .split(',')
            .map(|c| format!("j.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ")
    );
    let rows = sqlx::query_as::<_, Row>(&sql)
        .bind(Status::Building.as_str())
        .fetch_all(conn)
        .await?;

    rows.into_iter()
        .map(|row| Ok((JobRun::try_from(row.job)?, row.agent_alive)))
        .collect()
}
