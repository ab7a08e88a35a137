use std::{sync::Arc, time::Duration};

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::services::offline_queue::{DrainReport, OfflineVoteQueue};

const IDLE_INTERVAL: Duration = Duration::from_secs(15);
const INITIAL_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Drain the offline queue forever: right after votes are queued, on a slow cadence otherwise,
/// and with capped exponential backoff while the store stays unreachable.
///
/// `on_drained` runs after every pass that resolved at least one entry.
pub async fn run<F>(queue: Arc<OfflineVoteQueue>, mut on_drained: F)
where
    F: FnMut(&DrainReport) + Send + 'static,
{
    let mut delay = INITIAL_DELAY;

    loop {
        match queue.drain().await {
            Ok(report) => {
                if report.resolved() > 0 {
                    on_drained(&report);
                }
                if report.network_failures > 0 {
                    debug!(
                        remaining = report.remaining,
                        retry_in_ms = delay.as_millis() as u64,
                        "store still unreachable; backing off"
                    );
                    sleep(delay).await;
                    delay = (delay * 2).min(MAX_DELAY);
                    continue;
                }
                delay = INITIAL_DELAY;
                if report.remaining == 0 {
                    tokio::select! {
                        _ = queue.wait_for_entries() => {
                            sleep(INITIAL_DELAY).await;
                        }
                        _ = sleep(IDLE_INTERVAL) => {}
                    }
                } else {
                    sleep(IDLE_INTERVAL).await;
                }
            }
            Err(err) => {
                warn!(error = %err, "offline queue drain failed");
                sleep(delay).await;
                delay = (delay * 2).min(MAX_DELAY);
            }
        }
    }
}
