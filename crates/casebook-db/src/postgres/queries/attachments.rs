use chrono::{DateTime, Utc};

use casebook_core::attachment::{Attachment, RegisterAttachment, Registration};

use super::super::{pg_err, pg_not_found, PostgresDatabase};
use crate::DbError;

#[derive(sqlx::FromRow)]
pub(crate) struct AttachmentRow {
    pub(crate) id: String,
    pub(crate) digest: String,
    pub(crate) size_bytes: i64,
    pub(crate) mime_type: String,
    pub(crate) file_name: String,
    pub(crate) remote_attachment_id: Option<String>,
    pub(crate) remote_url: Option<String>,
    pub(crate) created_at: DateTime<Utc>,
}

impl From<AttachmentRow> for Attachment {
    fn from(r: AttachmentRow) -> Self {
        Attachment {
            id: r.id,
            digest: r.digest,
            size_bytes: r.size_bytes,
            mime_type: r.mime_type,
            file_name: r.file_name,
            remote_attachment_id: r.remote_attachment_id,
            remote_url: r.remote_url,
            created_at: r.created_at,
        }
    }
}

impl PostgresDatabase {
    pub(crate) async fn pg_register_attachment(
        &self,
        input: &RegisterAttachment,
    ) -> Result<Registration, DbError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        let inserted = sqlx::query(
            "INSERT INTO attachments
                (id, digest, size_bytes, mime_type, file_name,
                 remote_attachment_id, remote_url, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (digest) DO NOTHING",
        )
        .bind(&id)
        .bind(&input.digest)
        .bind(input.size_bytes)
        .bind(&input.mime_type)
        .bind(&input.file_name)
        .bind(&input.remote_attachment_id)
        .bind(&input.remote_url)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(pg_err)?
        .rows_affected();

        let row = sqlx::query_as::<_, AttachmentRow>("SELECT * FROM attachments WHERE digest = $1")
            .bind(&input.digest)
            .fetch_one(&self.pool)
            .await
            .map_err(pg_err)?;

        Ok(Registration {
            attachment: row.into(),
            created: inserted == 1,
        })
    }

    pub(crate) async fn pg_get_attachment(&self, id: &str) -> Result<Attachment, DbError> {
        let row = sqlx::query_as::<_, AttachmentRow>("SELECT * FROM attachments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(pg_err)?
            .ok_or_else(|| pg_not_found(&format!("attachment {id}")))?;

        Ok(row.into())
    }

    pub(crate) async fn pg_find_attachment_by_digest(
        &self,
        digest: &str,
    ) -> Result<Option<Attachment>, DbError> {
        let row = sqlx::query_as::<_, AttachmentRow>("SELECT * FROM attachments WHERE digest = $1")
            .bind(digest)
            .fetch_optional(&self.pool)
            .await
            .map_err(pg_err)?;

        Ok(row.map(Into::into))
    }

    pub(crate) async fn pg_find_attachment_by_remote_id(
        &self,
        remote_attachment_id: &str,
    ) -> Result<Option<Attachment>, DbError> {
        let row = sqlx::query_as::<_, AttachmentRow>(
            "SELECT * FROM attachments WHERE remote_attachment_id = $1
             ORDER BY created_at LIMIT 1",
        )
        .bind(remote_attachment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_err)?;

        Ok(row.map(Into::into))
    }

    pub(crate) async fn pg_set_remote_reference(
        &self,
        id: &str,
        remote_attachment_id: &str,
        remote_url: &str,
    ) -> Result<Attachment, DbError> {
        let row = sqlx::query_as::<_, AttachmentRow>(
            "UPDATE attachments SET remote_attachment_id = $1, remote_url = $2
             WHERE id = $3
             RETURNING *",
        )
        .bind(remote_attachment_id)
        .bind(remote_url)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_err)?
        .ok_or_else(|| pg_not_found(&format!("attachment {id}")))?;

        Ok(row.into())
    }

    pub(crate) async fn pg_delete_attachment(
        &self,
        id: &str,
        force: bool,
    ) -> Result<Attachment, DbError> {
        let mut tx = self.pool.begin().await.map_err(pg_err)?;

        let row = sqlx::query_as::<_, AttachmentRow>(
            "SELECT * FROM attachments WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(pg_err)?
        .ok_or_else(|| pg_not_found(&format!("attachment {id}")))?;

        let links: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM work_item_links WHERE attachment_id = $1")
                .bind(id)
                .fetch_one(&mut *tx)
                .await
                .map_err(pg_err)?;
        if links > 0 && !force {
            return Err(DbError::Conflict(format!(
                "attachment {id} is still linked to {links} work item(s)"
            )));
        }

        sqlx::query("DELETE FROM work_item_links WHERE attachment_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(pg_err)?;
        sqlx::query("DELETE FROM attachments WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(pg_err)?;

        tx.commit().await.map_err(pg_err)?;
        Ok(row.into())
    }
}
