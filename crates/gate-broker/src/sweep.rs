//! Background expiry sweep.
//!
//! Runs [`crate::broker::LockBroker::sweep_once`] on a fixed cadence
//! (`lease_ms / 4` by default) until shutdown. Reclaims grants whose lease
//! lapsed without a heartbeat, force-reclaims grants past their absolute
//! hold cap, and prunes tombstones and aged audit rows.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::broker::SharedBroker;
use crate::server::Shutdown;

/// Run the sweep loop until `shutdown` triggers. Store errors are logged and
/// retried on the next tick; a sweep failure never takes the broker down.
pub async fn run(broker: SharedBroker, interval: Duration, shutdown: Arc<Shutdown>) {
    info!(interval_ms = interval.as_millis() as u64, "expiry sweep started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so a fresh broker does not
    // sweep grants it restored moments ago.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if shutdown.is_triggered() {
            break;
        }
        match broker.sweep_once().await {
            Ok(stats) => {
                if stats.lease_expired > 0 || stats.force_expired > 0 {
                    info!(
                        lease_expired = stats.lease_expired,
                        force_expired = stats.force_expired,
                        "sweep reclaimed grants"
                    );
                }
            }
            Err(e) => error!("sweep pass failed: {e}"),
        }
    }
    info!("expiry sweep stopped");
}
