//! Execution agent queries.

use chrono::Utc;
use sqlx::PgConnection;

use crate::error::AppResult;

/// Register an agent or refresh its heartbeat.
pub async fn upsert_agent(conn: &mut PgConnection, id: &str, name: &str) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO agent (id, name, disabled, last_beat)
        VALUES ($1, $2, FALSE, $3)
        ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, last_beat = EXCLUDED.last_beat
        "#,
    )
    .bind(id)
    .bind(name)
    .bind(Utc::now())
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn set_disabled(conn: &mut PgConnection, id: &str, disabled: bool) -> AppResult<u64> {
    let result = sqlx::query("UPDATE agent SET disabled = $2 WHERE id = $1")
        .bind(id)
        .bind(disabled)
        .execute(conn)
        .await?;

    Ok(result.rows_affected())
}

pub async fn delete_agent(conn: &mut PgConnection, id: &str) -> AppResult<u64> {
    let result = sqlx::query("DELETE FROM agent WHERE id = $1")
        .bind(id)
        .execute(conn)
        .await?;

    Ok(result.rows_affected())
}
