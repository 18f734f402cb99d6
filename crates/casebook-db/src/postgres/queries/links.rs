use chrono::{DateTime, Utc};

use casebook_core::attachment::{Attachment, AttachmentRef};
use casebook_core::work_item_link::{CreateWorkItemLink, WorkItemLink};

use super::super::{pg_err, pg_not_found, PostgresDatabase};
use crate::DbError;

#[derive(sqlx::FromRow)]
struct LinkRow {
    work_item_id: i64,
    attachment_id: String,
    comment: String,
    linked_at: DateTime<Utc>,
}

impl From<LinkRow> for WorkItemLink {
    fn from(r: LinkRow) -> Self {
        WorkItemLink {
            work_item_id: r.work_item_id,
            attachment_id: r.attachment_id,
            comment: r.comment,
            linked_at: r.linked_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AttachmentRefRow {
    id: String,
    digest: String,
    size_bytes: i64,
    mime_type: String,
    file_name: String,
    remote_attachment_id: Option<String>,
    remote_url: Option<String>,
    created_at: DateTime<Utc>,
    comment: String,
    linked_at: DateTime<Utc>,
}

impl From<AttachmentRefRow> for AttachmentRef {
    fn from(r: AttachmentRefRow) -> Self {
        AttachmentRef {
            attachment: Attachment {
                id: r.id,
                digest: r.digest,
                size_bytes: r.size_bytes,
                mime_type: r.mime_type,
                file_name: r.file_name,
                remote_attachment_id: r.remote_attachment_id,
                remote_url: r.remote_url,
                created_at: r.created_at,
            },
            comment: r.comment,
            linked_at: r.linked_at,
        }
    }
}

impl PostgresDatabase {
    pub(crate) async fn pg_link_attachment(
        &self,
        input: &CreateWorkItemLink,
    ) -> Result<WorkItemLink, DbError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM attachments WHERE id = $1)")
                .bind(&input.attachment_id)
                .fetch_one(&self.pool)
                .await
                .map_err(pg_err)?;
        if !exists {
            return Err(pg_not_found(&format!("attachment {}", input.attachment_id)));
        }

        let row = sqlx::query_as::<_, LinkRow>(
            "INSERT INTO work_item_links (work_item_id, attachment_id, comment, linked_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (work_item_id, attachment_id)
                 DO UPDATE SET comment = EXCLUDED.comment
             RETURNING *",
        )
        .bind(input.work_item_id)
        .bind(&input.attachment_id)
        .bind(&input.comment)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(pg_err)?;

        Ok(row.into())
    }

    pub(crate) async fn pg_get_link(
        &self,
        attachment_id: &str,
        work_item_id: i64,
    ) -> Result<WorkItemLink, DbError> {
        let row = sqlx::query_as::<_, LinkRow>(
            "SELECT * FROM work_item_links WHERE attachment_id = $1 AND work_item_id = $2",
        )
        .bind(attachment_id)
        .bind(work_item_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_err)?
        .ok_or_else(|| {
            pg_not_found(&format!(
                "link attachment {attachment_id} / work item {work_item_id}"
            ))
        })?;

        Ok(row.into())
    }

    pub(crate) async fn pg_list_links_for_work_item(
        &self,
        work_item_id: i64,
    ) -> Result<Vec<AttachmentRef>, DbError> {
        let rows = sqlx::query_as::<_, AttachmentRefRow>(
            "SELECT a.*, l.comment, l.linked_at
             FROM work_item_links l
             JOIN attachments a ON a.id = l.attachment_id
             WHERE l.work_item_id = $1
             ORDER BY l.linked_at, a.id",
        )
        .bind(work_item_id)
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub(crate) async fn pg_list_links_for_attachment(
        &self,
        attachment_id: &str,
    ) -> Result<Vec<WorkItemLink>, DbError> {
        let rows = sqlx::query_as::<_, LinkRow>(
            "SELECT * FROM work_item_links WHERE attachment_id = $1
             ORDER BY linked_at, work_item_id",
        )
        .bind(attachment_id)
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}
