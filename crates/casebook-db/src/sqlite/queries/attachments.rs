use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use casebook_core::attachment::{Attachment, RegisterAttachment, Registration};

use super::super::{not_found_or, SqliteDatabase, SqliteResultExt};
use crate::DbError;

pub(crate) fn row_to_attachment(row: &Row) -> rusqlite::Result<Attachment> {
    Ok(Attachment {
        id: row.get("id")?,
        digest: row.get("digest")?,
        size_bytes: row.get("size_bytes")?,
        mime_type: row.get("mime_type")?,
        file_name: row.get("file_name")?,
        remote_attachment_id: row.get("remote_attachment_id")?,
        remote_url: row.get("remote_url")?,
        created_at: row.get("created_at")?,
    })
}

impl SqliteDatabase {
    pub fn register_attachment_sync(
        &self,
        input: &RegisterAttachment,
    ) -> Result<Registration, DbError> {
        self.with_conn(|conn| {
            let id = uuid::Uuid::new_v4().to_string();
            let now = Utc::now();
            let inserted = conn
                .execute(
                    "INSERT INTO attachments
                        (id, digest, size_bytes, mime_type, file_name,
                         remote_attachment_id, remote_url, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(digest) DO NOTHING",
                    params![
                        id,
                        input.digest,
                        input.size_bytes,
                        input.mime_type,
                        input.file_name,
                        input.remote_attachment_id,
                        input.remote_url,
                        now
                    ],
                )
                .to_db()?;
            let attachment = conn
                .query_row(
                    "SELECT * FROM attachments WHERE digest = ?1",
                    params![input.digest],
                    row_to_attachment,
                )
                .to_db()?;
            Ok(Registration {
                attachment,
                created: inserted == 1,
            })
        })
    }

    pub fn get_attachment_sync(&self, id: &str) -> Result<Attachment, DbError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM attachments WHERE id = ?1",
                params![id],
                row_to_attachment,
            )
            .map_err(not_found_or(format!("attachment {id}")))
        })
    }

    pub fn find_attachment_by_digest_sync(
        &self,
        digest: &str,
    ) -> Result<Option<Attachment>, DbError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM attachments WHERE digest = ?1",
                params![digest],
                row_to_attachment,
            )
            .optional()
            .to_db()
        })
    }

    pub fn find_attachment_by_remote_id_sync(
        &self,
        remote_attachment_id: &str,
    ) -> Result<Option<Attachment>, DbError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM attachments WHERE remote_attachment_id = ?1
                 ORDER BY created_at LIMIT 1",
                params![remote_attachment_id],
                row_to_attachment,
            )
            .optional()
            .to_db()
        })
    }

    pub fn set_remote_reference_sync(
        &self,
        id: &str,
        remote_attachment_id: &str,
        remote_url: &str,
    ) -> Result<Attachment, DbError> {
        self.with_conn(|conn| {
            conn.query_row(
                "UPDATE attachments SET remote_attachment_id = ?1, remote_url = ?2
                 WHERE id = ?3
                 RETURNING *",
                params![remote_attachment_id, remote_url, id],
                row_to_attachment,
            )
            .map_err(not_found_or(format!("attachment {id}")))
        })
    }

    pub fn delete_attachment_sync(&self, id: &str, force: bool) -> Result<Attachment, DbError> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction().to_db()?;
            let attachment = tx
                .query_row(
                    "SELECT * FROM attachments WHERE id = ?1",
                    params![id],
                    row_to_attachment,
                )
                .map_err(not_found_or(format!("attachment {id}")))?;

            let links: i64 = tx
                .query_row(
                    "SELECT COUNT(*) FROM work_item_links WHERE attachment_id = ?1",
                    params![id],
                    |r| r.get(0),
                )
                .to_db()?;
            if links > 0 && !force {
                return Err(DbError::Conflict(format!(
                    "attachment {id} is still linked to {links} work item(s)"
                )));
            }

            tx.execute(
                "DELETE FROM work_item_links WHERE attachment_id = ?1",
                params![id],
            )
            .to_db()?;
            tx.execute("DELETE FROM attachments WHERE id = ?1", params![id])
                .to_db()?;
            tx.commit().to_db()?;
            Ok(attachment)
        })
    }
}
