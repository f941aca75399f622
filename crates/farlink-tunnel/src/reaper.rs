//! Background eviction task
//!
//! One reaper runs per portal for as long as the portal exists. It holds
//! only a weak handle, so it can never keep a dropped portal (or the
//! process) alive, and the portal's cancellation token stops it
//! deterministically at shutdown.

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::portal::Portal;

/// Spawn the periodic reap loop for a portal
pub(crate) fn spawn(
    portal: Weak<Portal>,
    sweep_interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(run(portal, sweep_interval, cancel))
}

async fn run(portal: Weak<Portal>, sweep_interval: Duration, cancel: CancellationToken) {
    // First sweep lands one full interval after construction
    let start = tokio::time::Instant::now() + sweep_interval;
    let mut interval = tokio::time::interval_at(start, sweep_interval);

    tracing::debug!("Starting tunnel reaper (sweep interval: {:?})", sweep_interval);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let Some(portal) = portal.upgrade() else {
                    break;
                };
                portal.reap().await;
            }
            _ = cancel.cancelled() => {
                tracing::debug!("Tunnel reaper shutting down");
                break;
            }
        }
    }
}
