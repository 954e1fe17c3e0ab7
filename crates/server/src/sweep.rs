//! Recovery sweep - re-dispatch of failed notifications.
//!
//! The sweep funnels every failed record back through the dispatch queue
//! and mutates the records in place: a record that delivers on retry
//! flips from failed to delivered. Individual failures are counted, never
//! propagated; the sweep itself always completes.

use std::path::Path;

use tracing::{info, warn};

use donatrack_protocol::{NotificationRecord, RetryOutcome};

use crate::persistence;
use crate::queue::DispatchQueue;

/// Re-dispatch every failed notification, one at a time through the
/// single worker, and report aggregate counts.
pub async fn retry_all_failed(
    queue: &DispatchQueue,
    db_path: &Path,
) -> anyhow::Result<RetryOutcome> {
    let failed = persistence::load_failed_notifications(db_path).await?;
    info!(
        component = "sweep",
        event = "sweep.started",
        count = failed.len(),
    );

    let mut outcome = RetryOutcome::default();
    for record in &failed {
        let rx = queue.enqueue_existing(record).await;
        match rx.await {
            Ok(Ok(())) => outcome.succeeded += 1,
            Ok(Err(e)) => {
                warn!(
                    component = "sweep",
                    event = "sweep.record_failed",
                    record_id = %record.id,
                    error = %e,
                );
                outcome.failed += 1;
            }
            Err(_) => {
                // Worker dropped the job without reporting
                outcome.failed += 1;
            }
        }
    }

    info!(
        component = "sweep",
        event = "sweep.complete",
        succeeded = outcome.succeeded,
        failed = outcome.failed,
    );
    Ok(outcome)
}

/// Retry a single notification by id. Unlike the sweep this creates a
/// fresh pending record for the attempt; the original keeps its history.
pub async fn retry_notification(
    queue: &DispatchQueue,
    db_path: &Path,
    id: &str,
) -> anyhow::Result<Option<NotificationRecord>> {
    let Some(original) = persistence::load_notification(db_path, id).await? else {
        return Ok(None);
    };

    let record = queue
        .enqueue(&original.contact_id, &original.phone, &original.body)
        .await?;
    info!(
        component = "sweep",
        event = "sweep.single_retry",
        original_id = %id,
        record_id = %record.id,
    );
    Ok(Some(record))
}
