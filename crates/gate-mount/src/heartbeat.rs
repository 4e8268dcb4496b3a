//! Background lease heartbeats for open handles.
//!
//! One thread walks the handle table at `lease_ms / 3` and refreshes every
//! open handle's lock. A handle whose heartbeat comes back `not_held` or
//! `expired` is marked lost: the editor sees `EIO` on its next operation
//! instead of silently writing without the lock. Transport errors are
//! retried on the next tick — the lease decides when a flaky broker link
//! becomes fatal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use gate_core::client::{BrokerClient, HeartbeatOutcome};
use tracing::{debug, warn};

use crate::handle::HandleTable;

/// Granularity of shutdown checks between heartbeat rounds.
const POLL_STEP: Duration = Duration::from_millis(100);

/// Running heartbeat task. Stops and joins on drop.
pub struct HeartbeatTask {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl HeartbeatTask {
    /// Spawn the heartbeat thread.
    #[must_use]
    pub fn spawn(
        client: BrokerClient,
        handles: Arc<Mutex<HandleTable>>,
        interval: Duration,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("gate-heartbeat".to_string())
            .spawn(move || run(&client, &handles, interval, &thread_stop))
            .expect("failed to spawn heartbeat thread");
        Self {
            stop,
            thread: Some(thread),
        }
    }

    /// Request the thread to stop and wait for it.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for HeartbeatTask {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run(
    client: &BrokerClient,
    handles: &Arc<Mutex<HandleTable>>,
    interval: Duration,
    stop: &AtomicBool,
) {
    debug!(interval_ms = interval.as_millis() as u64, "heartbeat task started");
    loop {
        // Sleep in small steps so shutdown is prompt even with long leases.
        let mut slept = Duration::ZERO;
        while slept < interval {
            if stop.load(Ordering::SeqCst) {
                debug!("heartbeat task stopped");
                return;
            }
            let step = POLL_STEP.min(interval - slept);
            std::thread::sleep(step);
            slept += step;
        }

        let targets = handles.lock().expect("handle table lock").heartbeat_targets();
        for (fh, key, owner) in targets {
            match client.heartbeat(&key, &owner) {
                Ok(HeartbeatOutcome::Ok) => {}
                Ok(HeartbeatOutcome::NotHeld | HeartbeatOutcome::Expired) => {
                    warn!(key, fh, "lock lost; failing handle");
                    handles.lock().expect("handle table lock").mark_lost(fh);
                }
                Err(e) => {
                    warn!(key, fh, "heartbeat failed, will retry: {e}");
                }
            }
        }
    }
}
