use sqlx::PgPool;

use crate::DbError;

/// Fixed key for the advisory lock that serialises migration runs across
/// processes starting at the same time.
const MIGRATION_LOCK_KEY: i64 = 0x6361_7365_626F_6F6B; // "casebook"

pub async fn run(pool: &PgPool) -> Result<(), DbError> {
    // Session-level lock: take and release it on the same connection.
    let mut conn = pool
        .acquire()
        .await
        .map_err(|e| DbError::Internal(e.to_string()))?;

    sqlx::query("SELECT pg_advisory_lock($1)")
        .bind(MIGRATION_LOCK_KEY)
        .execute(&mut *conn)
        .await
        .map_err(|e| DbError::Internal(e.to_string()))?;

    let result = run_inner(pool).await;

    let _ = sqlx::query("SELECT pg_advisory_unlock($1)")
        .bind(MIGRATION_LOCK_KEY)
        .execute(&mut *conn)
        .await;

    result
}

async fn run_inner(pool: &PgPool) -> Result<(), DbError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version    INTEGER PRIMARY KEY,
            applied_at TIMESTAMPTZ NOT NULL
        )",
    )
    .execute(pool)
    .await
    .map_err(|e| DbError::Internal(e.to_string()))?;

    let current: i32 = sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
        .fetch_one(pool)
        .await
        .map_err(|e| DbError::Internal(e.to_string()))?;

    if current < 1 {
        tracing::info!("applying postgres migration V1__initial");
        sqlx::raw_sql(include_str!("sql/V1__initial.sql"))
            .execute(pool)
            .await
            .map_err(|e| DbError::Internal(e.to_string()))?;
    }

    Ok(())
}
