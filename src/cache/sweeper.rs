//! Periodic cleanup of expired local entries.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Something holding expiring in-process state.
pub trait Sweep: Send + Sync + 'static {
    fn sweep(&self);
}

impl Sweep for super::CacheService {
    fn sweep(&self) {
        super::CacheService::sweep(self);
    }
}

/// Background task calling [`Sweep::sweep`] every `interval` until stopped.
pub struct Sweeper {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    pub fn spawn(name: &'static str, interval: Duration, target: Arc<dyn Sweep>) -> Self {
        let (shutdown, mut signal) = watch::channel(false);
        let period = interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // first tick completes immediately

            loop {
                tokio::select! {
                    _ = ticker.tick() => target.sweep(),
                    changed = signal.changed() => {
                        if changed.is_err() || *signal.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(target: "strata::cache::sweeper", sweeper = name, "sweeper stopped");
        });

        debug!(
            target: "strata::cache::sweeper",
            sweeper = name,
            interval_ms = period.as_millis() as u64,
            "sweeper started"
        );
        Self {
            name,
            shutdown,
            handle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signal the task and wait for it to finish its current sweep.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.handle.await {
            warn!(
                target: "strata::cache::sweeper",
                sweeper = self.name,
                error = %err,
                "sweeper task ended abnormally"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct Counting(AtomicUsize);

    impl Sweep for Counting {
        fn sweep(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sweeps_on_every_tick_until_stopped() {
        let target = Arc::new(Counting::default());
        let sweeper = Sweeper::spawn("test", Duration::from_secs(10), target.clone());

        tokio::time::sleep(Duration::from_secs(35)).await;
        let swept = target.0.load(Ordering::SeqCst);
        assert!(swept >= 3, "expected at least three sweeps, got {swept}");

        sweeper.stop().await;
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(target.0.load(Ordering::SeqCst), swept);
    }

    #[tokio::test(start_paused = true)]
    async fn no_sweep_before_first_interval() {
        let target = Arc::new(Counting::default());
        let sweeper = Sweeper::spawn("test", Duration::from_secs(10), target.clone());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(target.0.load(Ordering::SeqCst), 0);
        sweeper.stop().await;
    }
}
