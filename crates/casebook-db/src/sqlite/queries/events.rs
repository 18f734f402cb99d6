use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use casebook_core::sync_event::{EventType, NewSyncEvent, Severity, SeveritySummary, SyncEvent};

use super::super::{SqliteDatabase, SqliteResultExt};
use crate::DbError;

fn row_to_event(row: &Row) -> rusqlite::Result<SyncEvent> {
    let type_str: String = row.get("event_type")?;
    let severity_str: String = row.get("severity")?;
    let event_type = EventType::parse_str(&type_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown event type {type_str}").into(),
        )
    })?;
    Ok(SyncEvent {
        id: row.get("id")?,
        job_id: row.get("job_id")?,
        severity: Severity::parse_str(&severity_str).unwrap_or(event_type.severity()),
        event_type,
        message: row.get("message")?,
        created_at: row.get("created_at")?,
    })
}

/// Insert an event on an existing connection or transaction.
pub(crate) fn insert_event(
    conn: &Connection,
    event: &NewSyncEvent,
    now: DateTime<Utc>,
) -> rusqlite::Result<SyncEvent> {
    conn.query_row(
        "INSERT INTO sync_event_log (id, job_id, event_type, severity, message, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         RETURNING *",
        params![
            uuid::Uuid::new_v4().to_string(),
            event.job_id,
            event.event_type.as_str(),
            event.severity().as_str(),
            event.message,
            now
        ],
        row_to_event,
    )
}

impl SqliteDatabase {
    pub fn append_event_sync(&self, event: &NewSyncEvent) -> Result<SyncEvent, DbError> {
        self.with_conn(|conn| insert_event(conn, event, Utc::now()).to_db())
    }

    /// Newest first.
    pub fn list_events_sync(
        &self,
        job_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<SyncEvent>, DbError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT * FROM sync_event_log
                     WHERE ?1 IS NULL OR job_id = ?1
                     ORDER BY created_at DESC, rowid DESC
                     LIMIT ?2",
                )
                .to_db()?;
            let events = stmt
                .query_map(params![job_id, limit], row_to_event)
                .to_db()?
                .collect::<Result<Vec<_>, _>>()
                .to_db()?;
            Ok(events)
        })
    }

    pub fn summarize_events_sync(&self, since: DateTime<Utc>) -> Result<SeveritySummary, DbError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT severity, COUNT(*) FROM sync_event_log
                     WHERE created_at >= ?1
                     GROUP BY severity",
                )
                .to_db()?;
            let rows = stmt
                .query_map(params![since], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })
                .to_db()?
                .collect::<Result<Vec<_>, _>>()
                .to_db()?;

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
        })
    }
}
