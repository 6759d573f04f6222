//! Background eviction task.

use std::sync::Weak;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;

use super::PoolInner;

/// Running sweeper. Stops when [`Sweeper::stop`] is called, when dropped,
/// or once the pool it watches is gone.
#[derive(Debug)]
pub(crate) struct Sweeper {
    stop: Option<oneshot::Sender<()>>,
}

impl Sweeper {
    pub(crate) fn spawn(handle: &Handle, pool: Weak<PoolInner>, period: Duration) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let period = period.max(Duration::from_millis(1));

        handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let Some(pool) = pool.upgrade() else { break };
                        // The sweep takes slot locks and may dlclose.
                        let report = match tokio::task::spawn_blocking(move || pool.sweep()).await {
                            Ok(report) => report,
                            Err(e) => {
                                tracing::error!("Pool sweep failed: {}", e);
                                continue;
                            }
                        };
                        if report.evicted() > 0 {
                            tracing::info!(
                                "Pool sweep evicted {} idle and {} stale loaders, {} remain",
                                report.evicted_idle,
                                report.evicted_stale,
                                report.remaining
                            );
                        }
                    }
                }
            }
            tracing::debug!("Pool sweeper stopped");
        });

        tracing::debug!("Pool sweeper started (every {:?})", period);
        Self {
            stop: Some(stop_tx),
        }
    }

    pub(crate) fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}
