//! Node run queries.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection};

use crate::db::models::{HookEvent, ManualTrigger, NodeRun, OutgoingHookRun, Stage, VcsInfo};
use crate::engine::state::Status;
use crate::error::{AppError, AppResult};
use crate::workflow::{NodeId, Parameter};

const NODE_RUN_COLUMNS: &str = r#"
    id, workflow_run_id, workflow_id, node_id, node_name, number, sub_number, status,
    stages, build_parameters, payload, manual, hook_event, source_node_runs,
    triggers_run, vcs, outgoing_hook, start, done, last_modified
"#;

#[derive(Debug, FromRow)]
struct NodeRunRow {
    id: i64,
    workflow_run_id: i64,
    workflow_id: i64,
    node_id: i64,
    node_name: String,
    number: i64,
    sub_number: i64,
    status: String,
    stages: Json<Vec<Stage>>,
    build_parameters: Json<Vec<Parameter>>,
    payload: Json<BTreeMap<String, String>>,
    manual: Option<Json<ManualTrigger>>,
    hook_event: Option<Json<HookEvent>>,
    source_node_runs: Json<Vec<i64>>,
    triggers_run: Json<BTreeMap<NodeId, Status>>,
    vcs: Json<VcsInfo>,
    outgoing_hook: Option<Json<OutgoingHookRun>>,
    start: DateTime<Utc>,
    done: Option<DateTime<Utc>>,
    last_modified: DateTime<Utc>,
}

impl TryFrom<NodeRunRow> for NodeRun {
    type Error = AppError;

    fn try_from(row: NodeRunRow) -> AppResult<Self> {
        Ok(Self {
            id: row.id,
            workflow_run_id: row.workflow_run_id,
            workflow_id: row.workflow_id,
            node_id: row.node_id,
            node_name: row.node_name,
            number: row.number,
            sub_number: row.sub_number,
            status: row.status.parse()?,
            stages: row.stages.0,
            build_parameters: row.build_parameters.0,
            payload: row.payload.0,
            manual: row.manual.map(|j| j.0),
            hook_event: row.hook_event.map(|j| j.0),
            source_node_runs: row.source_node_runs.0,
            triggers_run: row.triggers_run.0,
            vcs: row.vcs.0,
            outgoing_hook: row.outgoing_hook.map(|j| j.0),
            start: row.start,
            done: row.done,
            last_modified: row.last_modified,
        })
    }
}

fn into_node_runs(rows: Vec<NodeRunRow>) -> AppResult<Vec<NodeRun>> {
    rows.into_iter().map(NodeRun::try_from).collect()
}

/// Insert a node run.
///
/// A run already present for the same node and sub number violates the
/// unique key and is reported as [`AppError::Conflict`].
pub async fn insert_node_run(conn: &mut PgConnection, node_run: &NodeRun) -> AppResult<i64> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        INSERT INTO workflow_node_run (
            workflow_run_id, workflow_id, node_id, node_name, number, sub_number, status,
            stages, build_parameters, payload, manual, hook_event, source_node_runs,
            triggers_run, vcs, outgoing_hook, start, done, last_modified
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
        ON CONFLICT (workflow_run_id, node_id, sub_number) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(node_run.workflow_run_id)
    .bind(node_run.workflow_id)
    .bind(node_run.node_id)
    .bind(&node_run.node_name)
    .bind(node_run.number)
    .bind(node_run.sub_number)
    .bind(node_run.status.as_str())
    .bind(Json(&node_run.stages))
    .bind(Json(&node_run.build_parameters))
    .bind(Json(&node_run.payload))
    .bind(node_run.manual.as_ref().map(Json))
    .bind(node_run.hook_event.as_ref().map(Json))
    .bind(Json(&node_run.source_node_runs))
    .bind(Json(&node_run.triggers_run))
    .bind(Json(&node_run.vcs))
    .bind(node_run.outgoing_hook.as_ref().map(Json))
    .bind(node_run.start)
    .bind(node_run.done)
    .bind(node_run.last_modified)
    .fetch_optional(conn)
    .await?;

    row.map(|r| r.0).ok_or_else(|| {
        AppError::Conflict(format!(
            "node run for node {} sub number {} already exists",
            node_run.node_id, node_run.sub_number
        ))
    })
}

pub async fn get_node_run(conn: &mut PgConnection, node_run_id: i64) -> AppResult<Option<NodeRun>> {
    let sql = format!("SELECT {} FROM workflow_node_run WHERE id = $1", NODE_RUN_COLUMNS);
    let row = sqlx::query_as::<_, NodeRunRow>(&sql)
        .bind(node_run_id)
        .fetch_optional(conn)
        .await?;

    row.map(NodeRun::try_from).transpose()
}

/// Get a node run and take its row lock without waiting.
pub async fn lock_node_run(
    conn: &mut PgConnection,
    node_run_id: i64,
) -> AppResult<Option<NodeRun>> {
    let sql = format!(
        "SELECT {} FROM workflow_node_run WHERE id = $1 FOR UPDATE NOWAIT",
        NODE_RUN_COLUMNS
    );
    let row = sqlx::query_as::<_, NodeRunRow>(&sql)
        .bind(node_run_id)
        .fetch_optional(conn)
        .await?;

    row.map(NodeRun::try_from).transpose()
}

/// All node runs of a run, most recent sub number first.
pub async fn list_for_run(conn: &mut PgConnection, run_id: i64) -> AppResult<Vec<NodeRun>> {
    let sql = format!(
        "SELECT {} FROM workflow_node_run WHERE workflow_run_id = $1 ORDER BY node_id, sub_number DESC",
        NODE_RUN_COLUMNS
    );
    let rows = sqlx::query_as::<_, NodeRunRow>(&sql)
        .bind(run_id)
        .fetch_all(conn)
        .await?;

    into_node_runs(rows)
}

pub async fn exists(
    conn: &mut PgConnection,
    run_id: i64,
    node_id: NodeId,
    sub_number: i64,
) -> AppResult<bool> {
    let row: (bool,) = sqlx::query_as(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM workflow_node_run
            WHERE workflow_run_id = $1 AND node_id = $2 AND sub_number = $3
        )
        "#,
    )
    .bind(run_id)
    .bind(node_id)
    .bind(sub_number)
    .fetch_one(conn)
    .await?;

    Ok(row.0)
}

pub async fn update_node_run(conn: &mut PgConnection, node_run: &NodeRun) -> AppResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE workflow_node_run
        SET status = $2, stages = $3, build_parameters = $4, payload = $5,
            triggers_run = $6, vcs = $7, outgoing_hook = $8, done = $9, last_modified = $10
        WHERE id = $1
        "#,
    )
    .bind(node_run.id)
    .bind(node_run.status.as_str())
    .bind(Json(&node_run.stages))
    .bind(Json(&node_run.build_parameters))
    .bind(Json(&node_run.payload))
    .bind(Json(&node_run.triggers_run))
    .bind(Json(&node_run.vcs))
    .bind(node_run.outgoing_hook.as_ref().map(Json))
    .bind(node_run.done)
    .bind(node_run.last_modified)
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

/// Count building runs of a node in the other runs of a workflow.
pub async fn count_building(
    conn: &mut PgConnection,
    workflow_id: i64,
    node_id: NodeId,
    exclude_run_id: i64,
) -> AppResult<i64> {
    let row: (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM workflow_node_run
        WHERE workflow_id = $1 AND node_id = $2 AND workflow_run_id <> $3
          AND status = $4
        "#,
    )
    .bind(workflow_id)
    .bind(node_id)
    .bind(exclude_run_id)
    .bind(Status::Building.as_str())
    .fetch_one(conn)
    .await?;

    Ok(row.0)
}

/// Oldest waiting run of a node, in another run, that has not started a stage.
pub async fn next_mutex_waiter(
    conn: &mut PgConnection,
    workflow_id: i64,
    node_id: NodeId,
    exclude_run_id: i64,
) -> AppResult<Option<NodeRun>> {
    let sql = format!(
        r#"
        SELECT {} FROM workflow_node_run
        WHERE workflow_id = $1 AND node_id = $2 AND workflow_run_id <> $3
          AND status = $4
          AND NOT jsonb_path_exists(stages, '$[*] ? (@.status != null)')
        ORDER BY number, sub_number
        LIMIT 1
        "#,
        NODE_RUN_COLUMNS
    );
    let row = sqlx::query_as::<_, NodeRunRow>(&sql)
        .bind(workflow_id)
        .bind(node_id)
        .bind(exclude_run_id)
        .bind(Status::Waiting.as_str())
        .fetch_optional(conn)
        .await?;

    row.map(NodeRun::try_from).transpose()
}

/// Non-terminal node runs untouched since `older_than` with no live job.
pub async fn find_stuck(
    conn: &mut PgConnection,
    older_than: DateTime<Utc>,
) -> AppResult<Vec<NodeRun>> {
    let sql = format!(
        r#"
        SELECT {} FROM workflow_node_run nr
        WHERE nr.status IN ($1, $2) AND nr.last_modified < $3
          AND NOT EXISTS (
              SELECT 1 FROM workflow_node_run_job j
              WHERE j.node_run_id = nr.id AND j.status IN ($1, $2)
          )
        ORDER BY nr.id
        "#,
        NODE_RUN_COLUMNS
    );
    let rows = sqlx::query_as::<_, NodeRunRow>(&sql)
        .bind(Status::Waiting.as_str())
        .bind(Status::Building.as_str())
        .bind(older_than)
        .fetch_all(conn)
        .await?;

    into_node_runs(rows)
}
