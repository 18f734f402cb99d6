// Integration tests that exercise every Database trait method against the
// in-memory SQLite backend.  The assertions live in `common/mod.rs` so the
// same checks run against Postgres.

mod common;

use std::sync::Arc;
use casebook_db::Database;

async fn make_db() -> Arc<dyn Database> {
    Arc::new(casebook_db::SqliteDatabase::open_in_memory().unwrap())
}

#[tokio::test]
async fn register_is_idempotent_by_digest() {
    let db = make_db().await;
    common::test_register_is_idempotent_by_digest(&*db).await;
}

#[tokio::test]
async fn remote_reference() {
    let db = make_db().await;
    common::test_remote_reference(&*db).await;
}

#[tokio::test]
async fn links() {
    let db = make_db().await;
    common::test_links(&*db).await;
}

#[tokio::test]
async fn delete_attachment_respects_links() {
    let db = make_db().await;
    common::test_delete_attachment_respects_links(&*db).await;
}

#[tokio::test]
async fn enqueue_coalesces() {
    let db = make_db().await;
    common::test_enqueue_coalesces(&*db).await;
}

#[tokio::test]
async fn claim_lifecycle() {
    let db = make_db().await;
    common::test_claim_lifecycle(&*db).await;
}

#[tokio::test]
async fn claim_respects_lock_key() {
    let db = make_db().await;
    common::test_claim_respects_lock_key(&*db).await;
}

#[tokio::test]
async fn claim_respects_next_run_at() {
    let db = make_db().await;
    common::test_claim_respects_next_run_at(&*db).await;
}

#[tokio::test]
async fn retries_are_bounded() {
    let db = make_db().await;
    common::test_retries_are_bounded(&*db).await;
}

#[tokio::test]
async fn fatal_failure() {
    let db = make_db().await;
    common::test_fatal_failure(&*db).await;
}

#[tokio::test]
async fn cancel_and_reschedule() {
    let db = make_db().await;
    common::test_cancel_and_reschedule(&*db).await;
}

#[tokio::test]
async fn stale_jobs_and_counts() {
    let db = make_db().await;
    common::test_stale_jobs_and_counts(&*db).await;
}

#[tokio::test]
async fn event_summary() {
    let db = make_db().await;
    common::test_event_summary(&*db).await;
}

#[tokio::test]
async fn upload_sessions() {
    let db = make_db().await;
    common::test_upload_sessions(&*db).await;
}

#[tokio::test]
async fn upload_session_claims() {
    let db = make_db().await;
    common::test_upload_session_claims(&*db).await;
}

#[tokio::test]
async fn only_claim_holder_finishes_job() {
    let db = make_db().await;
    common::test_only_claim_holder_finishes_job(&*db).await;
}
