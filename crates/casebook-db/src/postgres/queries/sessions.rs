use chrono::{DateTime, Utc};

use casebook_core::upload_session::{SessionClaim, UploadSession};

use super::super::{pg_err, PostgresDatabase};
use crate::DbError;

#[derive(sqlx::FromRow)]
struct SessionRow {
    session_id: String,
    attachment_id: Option<String>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl From<SessionRow> for UploadSession {
    fn from(r: SessionRow) -> Self {
        UploadSession {
            session_id: r.session_id,
            attachment_id: r.attachment_id,
            created_at: r.created_at,
            expires_at: r.expires_at,
        }
    }
}

impl PostgresDatabase {
    pub(crate) async fn pg_get_upload_session(
        &self,
        session_id: &str,
    ) -> Result<Option<UploadSession>, DbError> {
        let row = sqlx::query_as::<_, SessionRow>(
            "SELECT * FROM upload_sessions WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_err)?;

        Ok(row.map(Into::into))
    }

    pub(crate) async fn pg_claim_upload_session(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
        pending_ttl: chrono::Duration,
    ) -> Result<SessionClaim, DbError> {
        let claimed: Option<String> = sqlx::query_scalar(
            "INSERT INTO upload_sessions (session_id, attachment_id, created_at, expires_at)
             VALUES ($1, NULL, $2, $3)
             ON CONFLICT (session_id) DO UPDATE SET
                 attachment_id = NULL,
                 created_at = EXCLUDED.created_at,
                 expires_at = EXCLUDED.expires_at
             WHERE upload_sessions.expires_at <= EXCLUDED.created_at
             RETURNING session_id",
        )
        .bind(session_id)
        .bind(now)
        .bind(now + pending_ttl)
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_err)?;
        if claimed.is_some() {
            return Ok(SessionClaim::Claimed);
        }

        // The row can vanish between the upsert and this read when its
        // claim is released.
        match self.pg_get_upload_session(session_id).await? {
            Some(existing) => Ok(SessionClaim::Existing(existing)),
            None => Err(DbError::Conflict(format!(
                "upload session {session_id} changed while being claimed"
            ))),
        }
    }

    pub(crate) async fn pg_release_upload_session(&self, session_id: &str) -> Result<(), DbError> {
        sqlx::query("DELETE FROM upload_sessions WHERE session_id = $1 AND attachment_id IS NULL")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(pg_err)?;
        Ok(())
    }

    pub(crate) async fn pg_complete_upload_session(
        &self,
        session_id: &str,
        attachment_id: &str,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<UploadSession, DbError> {
        sqlx::query(
            "INSERT INTO upload_sessions (session_id, attachment_id, created_at, expires_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (session_id) DO UPDATE SET
                 attachment_id = EXCLUDED.attachment_id,
                 created_at = EXCLUDED.created_at,
                 expires_at = EXCLUDED.expires_at
             WHERE upload_sessions.attachment_id IS NULL
                OR upload_sessions.expires_at <= EXCLUDED.created_at",
        )
        .bind(session_id)
        .bind(attachment_id)
        .bind(now)
        .bind(now + ttl)
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;

        let row = sqlx::query_as::<_, SessionRow>(
            "SELECT * FROM upload_sessions WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .map_err(pg_err)?;

        Ok(row.into())
    }

    pub(crate) async fn pg_purge_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64, DbError> {
        let result = sqlx::query("DELETE FROM upload_sessions WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(pg_err)?;
        Ok(result.rows_affected())
    }
}
