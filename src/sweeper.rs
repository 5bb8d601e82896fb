//! Expiry of discovered endpoints that stopped announcing.

use std::time::Duration;

use log::{debug, info};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use crate::debounce::Debouncer;
use crate::table::PeerTable;

/// Every `period`, removes remote endpoints older than `ttl` and signals
/// the debouncer if anything went away.
pub async fn run_sweeper(
    table: PeerTable,
    ttl: Duration,
    period: Duration,
    debouncer: Debouncer,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let expired = table.expire(ttl, Instant::now()).await;
        if !expired.is_empty() {
            info!("Expired endpoints: {}", expired.join(", "));
            debouncer.signal();
        }
    }
    debug!("Sweeper stopped");
}
