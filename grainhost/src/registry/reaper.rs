//! Background eviction of idle containers.

use super::ContainerRegistry;
use crate::container::ContainerStarter;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

impl<S: ContainerStarter> ContainerRegistry<S> {
    /// Run [`evict_idle`](Self::evict_idle) every `reap_interval` until `cancel` fires.
    pub fn spawn_reaper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        let period = self.options().reap_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately.
            ticker.tick().await;

            tracing::debug!(interval_secs = period.as_secs(), "Idle reaper started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = registry.evict_idle().await;
                        if !evicted.is_empty() {
                            tracing::info!(count = evicted.len(), grains = ?evicted, "Reaped idle grain containers");
                        }
                    }
                }
            }
            tracing::debug!("Idle reaper stopped");
        })
    }
}
