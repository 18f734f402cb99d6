use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use casebook_core::upload_session::{SessionClaim, UploadSession};

use super::super::{SqliteDatabase, SqliteResultExt};
use crate::DbError;

fn row_to_session(row: &Row) -> rusqlite::Result<UploadSession> {
    Ok(UploadSession {
        session_id: row.get("session_id")?,
        attachment_id: row.get("attachment_id")?,
        created_at: row.get("created_at")?,
        expires_at: row.get("expires_at")?,
    })
}

impl SqliteDatabase {
    pub fn get_upload_session_sync(
        &self,
        session_id: &str,
    ) -> Result<Option<UploadSession>, DbError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM upload_sessions WHERE session_id = ?1",
                params![session_id],
                row_to_session,
            )
            .optional()
            .to_db()
        })
    }

    pub fn claim_upload_session_sync(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
        pending_ttl: chrono::Duration,
    ) -> Result<SessionClaim, DbError> {
        self.with_conn(|conn| {
            let claimed = conn
                .execute(
                    "INSERT INTO upload_sessions (session_id, attachment_id, created_at, expires_at)
                     VALUES (?1, NULL, ?2, ?3)
                     ON CONFLICT(session_id) DO UPDATE SET
                         attachment_id = NULL,
                         created_at = excluded.created_at,
                         expires_at = excluded.expires_at
                     WHERE upload_sessions.expires_at <= excluded.created_at",
                    params![session_id, now, now + pending_ttl],
                )
                .to_db()?;
            if claimed == 1 {
                return Ok(SessionClaim::Claimed);
            }
            conn.query_row(
                "SELECT * FROM upload_sessions WHERE session_id = ?1",
                params![session_id],
                row_to_session,
            )
            .map(SessionClaim::Existing)
            .to_db()
        })
    }

    pub fn release_upload_session_sync(&self, session_id: &str) -> Result<(), DbError> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM upload_sessions WHERE session_id = ?1 AND attachment_id IS NULL",
                params![session_id],
            )
            .to_db()?;
            Ok(())
        })
    }

    pub fn complete_upload_session_sync(
        &self,
        session_id: &str,
        attachment_id: &str,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<UploadSession, DbError> {
        self.with_conn(|conn| {
            let expires_at = now + ttl;
            conn.execute(
                "INSERT INTO upload_sessions (session_id, attachment_id, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(session_id) DO UPDATE SET
                     attachment_id = excluded.attachment_id,
                     created_at = excluded.created_at,
                     expires_at = excluded.expires_at
                 WHERE upload_sessions.attachment_id IS NULL
                    OR upload_sessions.expires_at <= excluded.created_at",
                params![session_id, attachment_id, now, expires_at],
            )
            .to_db()?;
            conn.query_row(
                "SELECT * FROM upload_sessions WHERE session_id = ?1",
                params![session_id],
                row_to_session,
            )
            .to_db()
        })
    }

    pub fn purge_expired_sessions_sync(&self, now: DateTime<Utc>) -> Result<u64, DbError> {
        self.with_conn(|conn| {
            let n = conn
                .execute(
                    "DELETE FROM upload_sessions WHERE expires_at <= ?1",
                    params![now],
                )
                .to_db()?;
            Ok(n as u64)
        })
    }
}
