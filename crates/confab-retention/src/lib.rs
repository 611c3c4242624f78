//! Background sweeps: hourly message expiry, daily orphaned-conversation
//! cleanup.
//!
//! Both sweeps are idempotent and isolate failures per item, so one stuck row
//! never starves the rest of the batch. A sweep racing a concurrent delete is
//! fine: deleting an already-deleted message is a no-op.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use confab_db::Database;
use confab_storage::BlobStore;

/// Hourly pass over messages past their expiry timestamp.
pub const EXPIRY_SWEEP_SECS: u64 = 60 * 60;

/// Daily pass over conversations with no messages left.
pub const ORPHAN_SWEEP_SECS: u64 = 24 * 60 * 60;

/// What a sweep did. `errors` counts items that failed and were skipped.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted: usize,
    pub errors: usize,
}

pub async fn run_expiry_loop(db: Arc<Database>, store: Arc<BlobStore>, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;

        match sweep_expired_messages(&db, &store).await {
            Ok(report) => {
                if report.deleted > 0 || report.errors > 0 {
                    info!(
                        "Expiry sweep: deleted {} messages ({} errors)",
                        report.deleted, report.errors
                    );
                }
            }
            Err(e) => warn!("Expiry sweep failed: {:#}", e),
        }
    }
}

pub async fn run_orphan_loop(db: Arc<Database>, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;

        match sweep_orphaned_conversations(&db).await {
            Ok(removed) => {
                if removed > 0 {
                    info!("Orphan sweep: removed {} empty conversations", removed);
                }
            }
            Err(e) => warn!("Orphan sweep failed: {:#}", e),
        }
    }
}

/// Delete every message whose `expires_at` has passed, along with its blob.
///
/// Blob first, row second; a blob whose row survives a failed delete is
/// still reachable for the retry on the next pass, while a stranded blob
/// with no row costs disk only. The orphan check for the emptied
/// conversation is left to the daily sweep.
pub async fn sweep_expired_messages(
    db: &Arc<Database>,
    store: &Arc<BlobStore>,
) -> anyhow::Result<SweepReport> {
    let now = Utc::now();
    let db_list = db.clone();
    let expired = tokio::task::spawn_blocking(move || db_list.expired_messages(now)).await??;

    let mut report = SweepReport::default();
    for handle in expired {
        if let Some(media_id) = &handle.media_id {
            if let Err(e) = store.delete(media_id).await {
                warn!("Expiry sweep: failed to delete blob {}: {:#}", media_id, e);
                report.errors += 1;
            }
        }

        let db_del = db.clone();
        let id = handle.id.clone();
        match tokio::task::spawn_blocking(move || db_del.delete_message(&id)).await? {
            Ok(true) => report.deleted += 1,
            // Raced with unfriend or an earlier pass.
            Ok(false) => {}
            Err(e) => {
                warn!("Expiry sweep: failed to delete message {}: {:#}", handle.id, e);
                report.errors += 1;
            }
        }
    }

    Ok(report)
}

/// Remove conversations that no longer contain any messages.
pub async fn sweep_orphaned_conversations(db: &Arc<Database>) -> anyhow::Result<usize> {
    let db = db.clone();
    let removed = tokio::task::spawn_blocking(move || db.sweep_empty_conversations()).await??;
    Ok(removed)
}
