use rusqlite::Connection;

use super::SqliteResultExt;
use crate::DbError;

pub fn run(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );",
    )
    .to_db()?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |r| r.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        let tx = conn.unchecked_transaction().to_db()?;
        tx.execute_batch(V1_INITIAL).to_db()?;
        tx.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (1, datetime('now'))",
            [],
        )
        .to_db()?;
        tx.commit().to_db()?;
    }

    Ok(())
}

const V1_INITIAL: &str = "
    CREATE TABLE IF NOT EXISTS attachments (
        id                   TEXT PRIMARY KEY,
        digest               TEXT NOT NULL UNIQUE,
        size_bytes           INTEGER NOT NULL CHECK(size_bytes >= 0),
        mime_type            TEXT NOT NULL,
        file_name            TEXT NOT NULL,
        remote_attachment_id TEXT,
        remote_url           TEXT,
        created_at           TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_attachments_remote
        ON attachments(remote_attachment_id);

    CREATE TABLE IF NOT EXISTS work_item_links (
        work_item_id  INTEGER NOT NULL CHECK(work_item_id > 0),
        attachment_id TEXT NOT NULL REFERENCES attachments(id) ON DELETE CASCADE,
        comment       TEXT NOT NULL DEFAULT '',
        linked_at     TEXT NOT NULL,
        PRIMARY KEY (work_item_id, attachment_id)
    );
    CREATE INDEX IF NOT EXISTS idx_links_attachment ON work_item_links(attachment_id);

    CREATE TABLE IF NOT EXISTS sync_job_queue (
        id            TEXT PRIMARY KEY,
        job_type      TEXT NOT NULL
                          CHECK(job_type IN ('upload','download','link','delete')),
        target_key    TEXT NOT NULL,
        lock_key      TEXT NOT NULL,
        attachment_id TEXT,
        work_item_id  INTEGER,
        payload       TEXT NOT NULL DEFAULT '{}',
        status        TEXT NOT NULL DEFAULT 'queued'
                          CHECK(status IN ('queued','in_progress','succeeded','failed','dead')),
        attempts      INTEGER NOT NULL DEFAULT 0,
        max_attempts  INTEGER NOT NULL CHECK(max_attempts >= 1),
        next_run_at   TEXT NOT NULL,
        last_error    TEXT,
        claimed_by    TEXT,
        claimed_at    TEXT,
        created_at    TEXT NOT NULL,
        updated_at    TEXT NOT NULL,
        finished_at   TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_jobs_due ON sync_job_queue(status, next_run_at);
    CREATE INDEX IF NOT EXISTS idx_jobs_target ON sync_job_queue(job_type, target_key, status);
    CREATE INDEX IF NOT EXISTS idx_jobs_attachment ON sync_job_queue(attachment_id);
    CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_one_in_progress
        ON sync_job_queue(lock_key) WHERE status = 'in_progress';

    CREATE TABLE IF NOT EXISTS sync_event_log (
        id         TEXT PRIMARY KEY,
        job_id     TEXT,
        event_type TEXT NOT NULL,
        severity   TEXT NOT NULL CHECK(severity IN ('info','warn','error')),
        message    TEXT NOT NULL,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_events_job ON sync_event_log(job_id);
    CREATE INDEX IF NOT EXISTS idx_events_created ON sync_event_log(created_at);

    CREATE TABLE IF NOT EXISTS upload_sessions (
        session_id    TEXT PRIMARY KEY,
        attachment_id TEXT REFERENCES attachments(id) ON DELETE CASCADE,
        created_at    TEXT NOT NULL,
        expires_at    TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_sessions_expiry ON upload_sessions(expires_at);

    CREATE VIEW IF NOT EXISTS sync_summary AS
        SELECT 'job_status' AS kind, status AS name, COUNT(*) AS count
          FROM sync_job_queue GROUP BY status
        UNION ALL
        SELECT 'event_severity' AS kind, severity AS name, COUNT(*) AS count
          FROM sync_event_log GROUP BY severity;
";
