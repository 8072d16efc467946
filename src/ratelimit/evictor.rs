//! Background eviction of idle visitors.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::registry::KeyedRegistry;

/// Handle to the task that periodically sweeps a [`KeyedRegistry`].
///
/// Every `interval` the task removes visitors idle for longer than
/// `interval`. It runs until its cancellation token fires.
#[derive(Debug)]
pub struct Evictor {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Evictor {
    /// Spawn the sweep loop on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime or if `interval` is zero.
    pub fn spawn(
        registry: Arc<KeyedRegistry>,
        interval: Duration,
        token: CancellationToken,
    ) -> Self {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            info!(interval = ?interval, "Starting visitor evictor");

            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = registry.sweep(Instant::now(), interval);
                        debug!(removed = removed, tracked = registry.len(), "Evictor sweep finished");
                    }
                }
            }

            info!("Visitor evictor stopped");
        });

        Self { token, handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Ask the loop to stop without waiting for it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Stop the loop and wait for it to exit.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(err) = self.handle.await {
            error!(error = %err, "Visitor evictor exited abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::Limit;

    #[tokio::test(start_paused = true)]
    async fn test_evictor_sweeps_idle_visitors() {
        let registry = Arc::new(KeyedRegistry::new(Limit::per_second(1.0), 1));
        let evictor = Evictor::spawn(
            registry.clone(),
            Duration::from_secs(60),
            CancellationToken::new(),
        );

        registry.get_or_create("idle");
        tokio::time::sleep(Duration::from_secs(30)).await;
        registry.get_or_create("active");

        // First sweep at 60s: "idle" was seen 60s ago, exactly at the cutoff.
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(registry.contains("idle"));

        // Second sweep at 120s drops "idle" but keeps "active", refreshed at 61s.
        registry.get_or_create("active");
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!registry.contains("idle"));
        assert!(registry.contains("active"));

        evictor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_evictor_stops_on_cancel() {
        let registry = Arc::new(KeyedRegistry::new(Limit::per_second(1.0), 1));
        let token = CancellationToken::new();
        let evictor = Evictor::spawn(registry, Duration::from_secs(1), token.clone());
        assert!(evictor.is_running());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), evictor.stop())
            .await
            .expect("evictor did not stop");
    }

    #[tokio::test]
    #[should_panic(expected = "non-zero")]
    async fn test_zero_interval_panics_at_spawn() {
        let registry = Arc::new(KeyedRegistry::new(Limit::per_second(1.0), 1));
        Evictor::spawn(registry, Duration::ZERO, CancellationToken::new());
    }
}
