use chrono::Utc;
use rusqlite::{params, Row};

use casebook_core::attachment::AttachmentRef;
use casebook_core::work_item_link::{CreateWorkItemLink, WorkItemLink};

use super::attachments::row_to_attachment;
use super::super::{not_found_or, SqliteDatabase, SqliteResultExt};
use crate::DbError;

fn row_to_link(row: &Row) -> rusqlite::Result<WorkItemLink> {
    Ok(WorkItemLink {
        work_item_id: row.get("work_item_id")?,
        attachment_id: row.get("attachment_id")?,
        comment: row.get("comment")?,
        linked_at: row.get("linked_at")?,
    })
}

fn row_to_attachment_ref(row: &Row) -> rusqlite::Result<AttachmentRef> {
    Ok(AttachmentRef {
        attachment: row_to_attachment(row)?,
        comment: row.get("comment")?,
        linked_at: row.get("linked_at")?,
    })
}

impl SqliteDatabase {
    pub fn link_attachment_sync(&self, input: &CreateWorkItemLink) -> Result<WorkItemLink, DbError> {
        self.with_conn(|conn| {
            let exists: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM attachments WHERE id = ?1",
                    params![input.attachment_id],
                    |r| r.get(0),
                )
                .to_db()?;
            if exists == 0 {
                return Err(DbError::NotFound(format!(
                    "attachment {}",
                    input.attachment_id
                )));
            }
            conn.query_row(
                "INSERT INTO work_item_links (work_item_id, attachment_id, comment, linked_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(work_item_id, attachment_id)
                     DO UPDATE SET comment = excluded.comment
                 RETURNING *",
                params![
                    input.work_item_id,
                    input.attachment_id,
                    input.comment,
                    Utc::now()
                ],
                row_to_link,
            )
            .to_db()
        })
    }

    pub fn get_link_sync(
        &self,
        attachment_id: &str,
        work_item_id: i64,
    ) -> Result<WorkItemLink, DbError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM work_item_links WHERE attachment_id = ?1 AND work_item_id = ?2",
                params![attachment_id, work_item_id],
                row_to_link,
            )
            .map_err(not_found_or(format!(
                "link attachment {attachment_id} / work item {work_item_id}"
            )))
        })
    }

    pub fn list_links_for_work_item_sync(
        &self,
        work_item_id: i64,
    ) -> Result<Vec<AttachmentRef>, DbError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT a.*, l.comment, l.linked_at
                     FROM work_item_links l
                     JOIN attachments a ON a.id = l.attachment_id
                     WHERE l.work_item_id = ?1
                     ORDER BY l.linked_at, a.id",
                )
                .to_db()?;
            let refs = stmt
                .query_map(params![work_item_id], row_to_attachment_ref)
                .to_db()?
                .collect::<Result<Vec<_>, _>>()
                .to_db()?;
            Ok(refs)
        })
    }

    pub fn list_links_for_attachment_sync(
        &self,
        attachment_id: &str,
    ) -> Result<Vec<WorkItemLink>, DbError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT * FROM work_item_links WHERE attachment_id = ?1
                     ORDER BY linked_at, work_item_id",
                )
                .to_db()?;
            let links = stmt
                .query_map(params![attachment_id], row_to_link)
                .to_db()?
                .collect::<Result<Vec<_>, _>>()
                .to_db()?;
            Ok(links)
        })
    }
}
