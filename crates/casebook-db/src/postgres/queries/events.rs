use chrono::{DateTime, Utc};
use sqlx::PgConnection;

use casebook_core::sync_event::{EventType, NewSyncEvent, Severity, SeveritySummary, SyncEvent};

use super::super::{pg_err, PostgresDatabase};
use crate::DbError;

#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    job_id: Option<String>,
    event_type: String,
    severity: String,
    message: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for SyncEvent {
    type Error = DbError;

    fn try_from(r: EventRow) -> Result<Self, DbError> {
        let event_type = EventType::parse_str(&r.event_type)
            .ok_or_else(|| DbError::Internal(format!("unknown event type {}", r.event_type)))?;
        Ok(SyncEvent {
            id: r.id,
            job_id: r.job_id,
            severity: Severity::parse_str(&r.severity).unwrap_or(event_type.severity()),
            event_type,
            message: r.message,
            created_at: r.created_at,
        })
    }
}

/// Insert an event on a connection that may be inside a transaction.
pub(crate) async fn insert_event(
    conn: &mut PgConnection,
    event: &NewSyncEvent,
    now: DateTime<Utc>,
) -> Result<SyncEvent, DbError> {
    let row = sqlx::query_as::<_, EventRow>(
        "INSERT INTO sync_event_log (id, job_id, event_type, severity, message, created_at)
         VALUES ($1, $2, $3, $4, $5, $6)
         RETURNING *",
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(&event.job_id)
    .bind(event.event_type.as_str())
    .bind(event.severity().as_str())
    .bind(&event.message)
    .bind(now)
    .fetch_one(conn)
    .await
    .map_err(pg_err)?;

    row.try_into()
}

impl PostgresDatabase {
    pub(crate) async fn pg_append_event(&self, event: &NewSyncEvent) -> Result<SyncEvent, DbError> {
        let mut conn = self.pool.acquire().await.map_err(pg_err)?;
        insert_event(&mut conn, event, Utc::now()).await
    }

    pub(crate) async fn pg_list_events(
        &self,
        job_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<SyncEvent>, DbError> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT * FROM sync_event_log
             WHERE $1::TEXT IS NULL OR job_id = $1
             ORDER BY created_at DESC, seq DESC
             LIMIT $2",
        )
        .bind(job_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err)?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    pub(crate) async fn pg_summarize_events(
        &self,
        since: DateTime<Utc>,
    ) -> Result<SeveritySummary, DbError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT severity, COUNT(*) FROM sync_event_log
             WHERE created_at >= $1
             GROUP BY severity",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err)?;

        let mut summary = SeveritySummary {
            since: Some(since),
            ..Default::default()
        };
        for (severity, count) in rows {
            if let Some(severity) = Severity::parse_str(&severity) {
                summary.add(severity, count);
            }
        }
        Ok(summary)
    }
}
