//! Publishing terminal notifications exactly once per request.
//!
//! ```text
//! 1. claim      (conditional write; one holder at a time)
//! 2. publish
//! 3. mark notified
//! ```
//!
//! A publisher that cannot claim skips: someone else is publishing or has
//! published. A failed publish releases the claim so a redelivery can retry
//! at once. A claim whose holder died lapses after `lease` and is taken over
//! by the next redelivery or reconciler sweep.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use demandflow_core::RequestRecord;
use demandflow_messaging::{MessageQueue, NotificationMessage, QueueError};

use crate::store::{RequestStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification publish failed: {0}")]
    Publish(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Publish the notification for a terminal record and mark it notified.
///
/// Returns `false` without publishing if the record is not terminal, has
/// already been notified, or another publisher holds a live claim.
pub async fn publish_terminal(
    notifications: &dyn MessageQueue<NotificationMessage>,
    store: &dyn RequestStore,
    record: &RequestRecord,
    lease: Duration,
) -> Result<bool, NotifyError> {
    if record.notified_at.is_some() {
        debug!(request_id = %record.request_id, "already notified");
        return Ok(false);
    }
    let Some(message) = NotificationMessage::from_terminal(record) else {
        return Ok(false);
    };

    let stale_before = Utc::now() - crate::chrono_duration(lease);
    if !store.claim_notification(record.request_id, stale_before).await? {
        debug!(request_id = %record.request_id, "notification claimed elsewhere");
        return Ok(false);
    }

    if let Err(e) = notifications.publish(&message).await {
        if let Err(release) = store.release_notification(record.request_id).await {
            // The claim lapses after the lease instead.
            warn!(request_id = %record.request_id, error = %release, "could not release notification claim");
        }
        return Err(e.into());
    }

    let marked = store.mark_notified(record.request_id).await?;
    info!(
        request_id = %record.request_id,
        parent = %record.parent,
        outcome = ?message.outcome,
        is_reprocessing = message.is_reprocessing,
        marked,
        "notification published"
    );
    Ok(true)
}
