//! Periodic background sweep.
//!
//! Owns one tokio task that runs a tick closure on a fixed interval until it
//! is stopped or the closure reports its owner is gone.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub(crate) struct Sweeper {
    name: &'static str,
    stop: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Sweeper {
    /// Starts a sweep task. `tick` returns `false` when there is nothing left
    /// to sweep (the owning backend was dropped).
    ///
    /// Returns `None` outside a tokio runtime; expired entries are then only
    /// removed lazily.
    pub(crate) fn spawn<F, Fut>(name: &'static str, every: Duration, mut tick: F) -> Option<Self>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send,
    {
        if every.is_zero() {
            return None;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(sweeper = name, "No tokio runtime, background sweep disabled");
            return None;
        };

        let (stop, mut stopped) = watch::channel(false);
        let handle = runtime.spawn(async move {
            let mut interval = tokio::time::interval(every);
            // The first tick completes immediately.
            interval.tick().await;
            info!(sweeper = name, interval = ?every, "Starting sweep loop");

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if !tick().await {
                            debug!(sweeper = name, "Owner dropped, sweep loop exiting");
                            break;
                        }
                    },
                    _ = stopped.changed() => break,
                }
            }
        });

        Some(Self {
            name,
            stop,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Signals the task and waits for it to finish. Idempotent.
    pub(crate) async fn stop(&self) {
        let _ = self.stop.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(sweeper = self.name, error = %e, "Sweep task ended abnormally");
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_sweeper_ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let sweeper = Sweeper::spawn("test", Duration::from_millis(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            }
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        sweeper.stop().await;
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several ticks, saw {seen}");

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
        sweeper.stop().await;
    }

    #[tokio::test]
    async fn test_zero_interval_disables_sweep() {
        assert!(Sweeper::spawn("test", Duration::ZERO, || async { true }).is_none());
    }

    #[test]
    fn test_no_runtime_disables_sweep() {
        assert!(Sweeper::spawn("test", Duration::from_secs(1), || async { true }).is_none());
    }
}
