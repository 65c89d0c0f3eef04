//! Retention - periodic removal of old terminal task records

use crate::store::TaskStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// `now - older_than`, saturating at the earliest representable time
pub(crate) fn cutoff_for(older_than: Duration) -> chrono::DateTime<Utc> {
    chrono::Duration::from_std(older_than)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC)
}

/// Spawn a loop that reaps terminal tasks older than `max_age` every
/// `interval` until `shutdown` fires.
pub(crate) fn spawn_retention_loop(
    store: Arc<TaskStore>,
    interval: Duration,
    max_age: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "Retention cleanup started (interval={:?}, max_age={:?})",
            interval, max_age
        );
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // first tick completes immediately
        timer.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Retention cleanup stopped");
                    return;
                }
                _ = timer.tick() => {}
            }

            let removed = store.cleanup_before(cutoff_for(max_age)).await;
            if removed > 0 {
                info!("Retention cleanup: removed {} tasks", removed);
            } else {
                debug!("Retention cleanup: nothing to remove");
            }
        }
    })
}
