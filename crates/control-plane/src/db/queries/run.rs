//! Workflow run queries.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection};

use crate::db::models::{RunInfo, WorkflowRun};
use crate::error::{AppError, AppResult};
use crate::workflow::Workflow;

#[derive(Debug, FromRow)]
struct RunRow {
    id: i64,
    workflow_id: i64,
    number: i64,
    status: String,
    workflow: Json<Workflow>,
    last_sub_number: i64,
    infos: Json<Vec<RunInfo>>,
    tags: Json<BTreeMap<String, String>>,
    start: DateTime<Utc>,
    last_modified: DateTime<Utc>,
}

impl TryFrom<RunRow> for WorkflowRun {
    type Error = AppError;

    fn try_from(row: RunRow) -> AppResult<Self> {
        Ok(Self {
            id: row.id,
            workflow_id: row.workflow_id,
            number: row.number,
            status: row.status.parse()?,
            workflow: row.workflow.0,
            node_runs: BTreeMap::new(),
            last_sub_number: row.last_sub_number,
            infos: row.infos.0,
            tags: row.tags.0,
            start: row.start,
            last_modified: row.last_modified,
        })
    }
}

/// Allocate the next run number of a workflow.
pub async fn next_run_number(conn: &mut PgConnection, workflow_id: i64) -> AppResult<i64> {
    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO workflow_run_number (workflow_id, number)
        VALUES ($1, 1)
        ON CONFLICT (workflow_id)
        DO UPDATE SET number = workflow_run_number.number + 1
        RETURNING number
        "#,
    )
    .bind(workflow_id)
    .fetch_one(conn)
    .await?;

    Ok(row.0)
}

pub async fn insert_run(conn: &mut PgConnection, run: &WorkflowRun) -> AppResult<i64> {
    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO workflow_run (
            workflow_id, number, status, workflow, last_sub_number,
            infos, tags, start, last_modified
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING id
        "#,
    )
    .bind(run.workflow_id)
    .bind(run.number)
    .bind(run.status.as_str())
    .bind(Json(&run.workflow))
    .bind(run.last_sub_number)
    .bind(Json(&run.infos))
    .bind(Json(&run.tags))
    .bind(run.start)
    .bind(run.last_modified)
    .fetch_one(conn)
    .await?;

    Ok(row.0)
}

/// Get a run without its node runs.
pub async fn get_run(conn: &mut PgConnection, run_id: i64) -> AppResult<Option<WorkflowRun>> {
    let row = sqlx::query_as::<_, RunRow>(
        r#"
        SELECT id, workflow_id, number, status, workflow, last_sub_number,
               infos, tags, start, last_modified
        FROM workflow_run
        WHERE id = $1
        "#,
    )
    .bind(run_id)
    .fetch_optional(conn)
    .await?;

    row.map(WorkflowRun::try_from).transpose()
}

/// Take the run row lock without waiting.
///
/// Returns `false` when the run does not exist; a held lock surfaces as
/// [`AppError::Locked`].
pub async fn lock_run(conn: &mut PgConnection, run_id: i64) -> AppResult<bool> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT id FROM workflow_run WHERE id = $1 FOR UPDATE NOWAIT")
            .bind(run_id)
            .fetch_optional(conn)
            .await?;

    Ok(row.is_some())
}

pub async fn update_run(conn: &mut PgConnection, run: &WorkflowRun) -> AppResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE workflow_run
        SET status = $2, last_sub_number = $3, infos = $4, tags = $5, last_modified = $6
        WHERE id = $1
        "#,
    )
    .bind(run.id)
    .bind(run.status.as_str())
    .bind(run.last_sub_number)
    .bind(Json(&run.infos))
    .bind(Json(&run.tags))
    .bind(Utc::now())
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}
