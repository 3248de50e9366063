//! Background reaper for expired leases.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info};

use super::lock::LockCoordinator;

pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);

/// Periodically sweeps expired leases so a crashed holder cannot block a
/// workflow past its TTL.
///
/// The interval is independent of the lease TTL. Sweeps run on the blocking
/// pool because they touch the filesystem under the store's write guard.
pub struct Watchdog {
    locks: Arc<LockCoordinator>,
    interval: Duration,
    shutdown_tx: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn new(locks: Arc<LockCoordinator>, interval: Duration) -> Self {
        Self {
            locks,
            interval,
            shutdown_tx: None,
            handle: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Spawn the sweep loop. Calling this while already running does nothing.
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        let (tx, rx) = watch::channel(false);
        let locks = self.locks.clone();
        let period = self.interval;
        self.handle = Some(tokio::spawn(run(locks, period, rx)));
        self.shutdown_tx = Some(tx);
        info!(interval_secs = period.as_secs_f64(), "Watchdog started");
    }

    /// Signal shutdown and wait for the loop to exit. No sweep starts after
    /// this returns.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
            && !e.is_cancelled()
        {
            error!(error = %e, "Watchdog task panicked");
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn run(locks: Arc<LockCoordinator>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let locks = locks.clone();
                match tokio::task::spawn_blocking(move || locks.sweep_expired()).await {
                    Ok(Ok(0)) => {}
                    Ok(Ok(n)) => debug!(reclaimed = n, "Watchdog sweep"),
                    Ok(Err(e)) => error!(error = %e, "Watchdog sweep failed"),
                    Err(e) => error!(error = %e, "Watchdog sweep task failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Watchdog shutting down");
                    break;
                }
            }
        }
    }
}
