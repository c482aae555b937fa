//! Background refresh poller.
//!
//! Runs `ensure_fresh` on an interval. A manual wake skips the remaining
//! sleep; shutdown ends the loop after the current cycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::cache::policy::RefreshAction;
use crate::query::MirrorService;

/// Delay before the first cycle so startup work settles.
pub const STARTUP_DELAY: Duration = Duration::from_secs(5);

/// Returns the number of completed cycles.
pub async fn run_refresh_poller(
    service: Arc<MirrorService>,
    interval: Duration,
    startup_delay: Duration,
    wake: Arc<Notify>,
    shutdown: Arc<Notify>,
) -> u64 {
    tokio::select! {
        _ = tokio::time::sleep(startup_delay) => {},
        _ = shutdown.notified() => {
            log::info!("Refresh poller: shut down before first cycle");
            return 0;
        },
    }

    let mut cycles = 0u64;
    loop {
        match service.ensure_fresh().await {
            Ok(outcome) => match outcome.action {
                RefreshAction::None => log::debug!("Refresh poller: mirror is fresh"),
                action => log::info!(
                    "Refresh poller: {:?} refresh done, {} records (persisted: {})",
                    action,
                    outcome.counts.total(),
                    outcome.persisted
                ),
            },
            Err(e) => log::warn!(
                "Refresh poller: refresh failed: {} ({})",
                e,
                e.recovery_suggestion()
            ),
        }
        cycles += 1;

        tokio::select! {
            _ = tokio::time::sleep(interval) => {},
            _ = wake.notified() => {
                log::info!("Refresh poller: woken by manual refresh signal");
            },
            _ = shutdown.notified() => {
                log::info!("Refresh poller: shutting down after {} cycles", cycles);
                return cycles;
            },
        }
    }
}
