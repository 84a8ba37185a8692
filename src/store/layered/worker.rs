//! Background worker of the layered store.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::State;
use crate::error::{Error, Result};

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Periodic flush and cleanup, with one last flush on shutdown.
pub(super) struct Worker {
    stop: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl Worker {
    pub(super) fn spawn(state: Arc<State>, persist: Duration, cleanup: Duration) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run(
            state,
            persist.max(MIN_INTERVAL),
            cleanup.max(MIN_INTERVAL),
            stop_rx,
        ));
        Self {
            stop,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Stops the loop and waits for the final flush. Later calls return
    /// `Ok(())` at once.
    pub(super) async fn shutdown(&self) -> Result<()> {
        let _ = self.stop.send(true);
        let handle = self.handle.lock().take();
        match handle {
            Some(handle) => handle
                .await
                .map_err(|e| Error::backend(anyhow::anyhow!("layered store worker failed: {e}")))?,
            None => Ok(()),
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}

async fn run(
    state: Arc<State>,
    persist: Duration,
    cleanup: Duration,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    let start = Instant::now();
    let mut persist_tick = time::interval_at(start + persist, persist);
    let mut cleanup_tick = time::interval_at(start + cleanup, cleanup);
    persist_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    cleanup_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let table = state.back.name().to_string();
    loop {
        tokio::select! {
            _ = persist_tick.tick() => match state.flush().await {
                Ok(0) => {},
                Ok(persisted) => debug!(%table, persisted, "Flushed layered store"),
                Err(e) => warn!(%table, error = %e, "Layered store flush failed; will retry"),
            },
            _ = cleanup_tick.tick() => match state.cleanup_expired().await {
                Ok(0) => {},
                Ok(removed) => debug!(%table, removed, "Removed expired rows"),
                Err(e) => warn!(%table, error = %e, "Layered store cleanup failed"),
            },
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            },
        }
    }

    let persisted = state.flush().await?;
    debug!(%table, persisted, "Final flush complete");
    Ok(())
}
