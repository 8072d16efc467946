//! Admission gate combining a global budget with per-caller budgets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::backend::AdmissionBackend;
use super::bucket::{Decision, Limit, Reservation, TokenBucket, WaitContext};
use super::evictor::Evictor;
use super::registry::KeyedRegistry;
use crate::config::LimiterConfig;
use crate::error::WaitError;

/// Default interval between sweeps of idle per-caller buckets.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Decides whether units of work may proceed.
///
/// Unkeyed calls draw from one global bucket. Keyed calls draw from a bucket
/// per caller key, created on first sight with the gate's current rate and
/// burst and evicted after a cleanup interval without traffic. The eviction
/// task is started by the first keyed call and stopped by [`shutdown`],
/// [`close`] or dropping the gate.
///
/// [`shutdown`]: AdmissionGate::shutdown
/// [`close`]: AdmissionGate::close
#[derive(Debug)]
pub struct AdmissionGate {
    global: TokenBucket,
    registry: Arc<KeyedRegistry>,
    cleanup_interval: Duration,
    shutdown: CancellationToken,
    evictor: Mutex<Option<Evictor>>,
    evictor_started: AtomicBool,
    runtime_warned: AtomicBool,
}

impl AdmissionGate {
    /// Create a gate with the default cleanup interval.
    pub fn new(limit: Limit, burst: u32) -> Self {
        Self::with_cleanup_interval(limit, burst, DEFAULT_CLEANUP_INTERVAL)
    }

    /// Create a gate that forgets callers idle for `cleanup_interval`.
    ///
    /// A zero interval falls back to [`DEFAULT_CLEANUP_INTERVAL`].
    pub fn with_cleanup_interval(limit: Limit, burst: u32, cleanup_interval: Duration) -> Self {
        let cleanup_interval = if cleanup_interval.is_zero() {
            warn!(
                default = ?DEFAULT_CLEANUP_INTERVAL,
                "Cleanup interval must be non-zero, using default"
            );
            DEFAULT_CLEANUP_INTERVAL
        } else {
            cleanup_interval
        };

        Self {
            global: TokenBucket::new(limit, burst),
            registry: Arc::new(KeyedRegistry::new(limit, burst)),
            cleanup_interval,
            shutdown: CancellationToken::new(),
            evictor: Mutex::new(None),
            evictor_started: AtomicBool::new(false),
            runtime_warned: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &LimiterConfig) -> Self {
        Self::with_cleanup_interval(config.limit(), config.burst, config.cleanup_interval())
    }

    /// Admit one unit of work against the global budget.
    pub fn admit(&self) -> bool {
        self.admit_n(Instant::now(), 1)
    }

    /// Admit `n` units of work at `t` against the global budget.
    pub fn admit_n(&self, t: Instant, n: u32) -> bool {
        let admitted = self.global.allow_n(t, n);
        trace!(requested = n, admitted = admitted, "Global admission");
        admitted
    }

    /// Admit one unit of work against `key`'s budget.
    pub fn admit_for(&self, key: &str) -> bool {
        self.admit_for_n(key, Instant::now(), 1)
    }

    pub fn admit_for_n(&self, key: &str, t: Instant, n: u32) -> bool {
        let admitted = self.bucket_for_at(key, t).allow_n(t, n);
        trace!(key = %key, requested = n, admitted = admitted, "Keyed admission");
        admitted
    }

    /// Like [`admit`](Self::admit), with a retry hint on rejection.
    pub fn check(&self) -> Decision {
        self.check_n(Instant::now(), 1)
    }

    pub fn check_n(&self, t: Instant, n: u32) -> Decision {
        let decision = self.global.check_n(t, n);
        if !decision.is_admitted() {
            debug!(retry_after = ?decision.retry_after(), "Global budget exhausted");
        }
        decision
    }

    /// Like [`admit_for`](Self::admit_for), with a retry hint on rejection.
    pub fn check_for(&self, key: &str) -> Decision {
        self.check_for_n(key, Instant::now(), 1)
    }

    pub fn check_for_n(&self, key: &str, t: Instant, n: u32) -> Decision {
        let decision = self.bucket_for_at(key, t).check_n(t, n);
        if !decision.is_admitted() {
            debug!(key = %key, retry_after = ?decision.retry_after(), "Caller budget exhausted");
        }
        decision
    }

    pub fn reserve(&self) -> Reservation {
        self.global.reserve()
    }

    pub fn reserve_n(&self, t: Instant, n: u32) -> Reservation {
        self.global.reserve_n(t, n)
    }

    pub fn reserve_for(&self, key: &str) -> Reservation {
        self.reserve_for_n(key, Instant::now(), 1)
    }

    pub fn reserve_for_n(&self, key: &str, t: Instant, n: u32) -> Reservation {
        self.bucket_for_at(key, t).reserve_n(t, n)
    }

    /// Wait for one token from the global budget.
    pub async fn wait(&self, cx: &WaitContext) -> Result<(), WaitError> {
        self.global.wait(cx).await
    }

    pub async fn wait_n(&self, cx: &WaitContext, n: u32) -> Result<(), WaitError> {
        self.global.wait_n(cx, n).await
    }

    /// Wait for one token from `key`'s budget.
    pub async fn wait_for(&self, key: &str, cx: &WaitContext) -> Result<(), WaitError> {
        self.wait_for_n(key, cx, 1).await
    }

    pub async fn wait_for_n(&self, key: &str, cx: &WaitContext, n: u32) -> Result<(), WaitError> {
        self.bucket_for(key).wait_n(cx, n).await
    }

    /// Time until one token is available in the global budget, without
    /// taking it. `None` if it never will be.
    pub fn retry_after(&self) -> Option<Duration> {
        self.global.delay_at(Instant::now(), 1)
    }

    /// Like [`retry_after`](Self::retry_after), for `key`'s budget.
    pub fn retry_after_for(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.bucket_for_at(key, now).delay_at(now, 1)
    }

    /// Change the rate of the global bucket and of caller buckets created
    /// from now on. Existing caller buckets keep their rate.
    pub fn set_limit(&self, limit: Limit) {
        self.set_limit_at(Instant::now(), limit);
    }

    pub fn set_limit_at(&self, t: Instant, limit: Limit) {
        // The defaults lock orders this against concurrent burst changes.
        self.registry.update_defaults(|default_limit, default_burst| {
            self.global.set_limit_at(t, limit);
            *default_limit = limit;
            *default_burst = self.global.burst();
        });
        info!(limit = %limit, "Updated admission rate");
    }

    /// Change the burst of the global bucket and of caller buckets created
    /// from now on. Existing caller buckets keep their burst.
    pub fn set_burst(&self, burst: u32) {
        self.set_burst_at(Instant::now(), burst);
    }

    pub fn set_burst_at(&self, t: Instant, burst: u32) {
        self.registry.update_defaults(|default_limit, default_burst| {
            self.global.set_burst_at(t, burst);
            *default_limit = self.global.limit();
            *default_burst = burst;
        });
        info!(burst = burst, "Updated admission burst");
    }

    pub fn limit(&self) -> Limit {
        self.global.limit()
    }

    pub fn burst(&self) -> u32 {
        self.global.burst()
    }

    pub fn cleanup_interval(&self) -> Duration {
        self.cleanup_interval
    }

    /// Number of caller keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.registry.len()
    }

    pub fn registry(&self) -> &Arc<KeyedRegistry> {
        &self.registry
    }

    /// Whether the eviction task is currently running.
    pub fn is_evicting(&self) -> bool {
        self.evictor
            .lock()
            .as_ref()
            .map(Evictor::is_running)
            .unwrap_or(false)
    }

    /// Stop the eviction task without waiting for it.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Stop the eviction task and wait for it to exit.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let evictor = self.evictor.lock().take();
        if let Some(evictor) = evictor {
            evictor.stop().await;
        }
    }

    fn bucket_for(&self, key: &str) -> TokenBucket {
        self.bucket_for_at(key, Instant::now())
    }

    fn bucket_for_at(&self, key: &str, t: Instant) -> TokenBucket {
        self.ensure_evictor();
        self.registry.get_or_create_at(key, t)
    }

    /// Start the eviction task once, on the first keyed call made inside a
    /// tokio runtime.
    fn ensure_evictor(&self) {
        if self.evictor_started.load(Ordering::Acquire) {
            return;
        }

        let mut slot = self.evictor.lock();
        if self.evictor_started.load(Ordering::Acquire) || self.shutdown.is_cancelled() {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            if !self.runtime_warned.swap(true, Ordering::Relaxed) {
                warn!("No tokio runtime available, deferring visitor eviction");
            }
            return;
        }

        *slot = Some(Evictor::spawn(
            self.registry.clone(),
            self.cleanup_interval,
            self.shutdown.child_token(),
        ));
        self.evictor_started.store(true, Ordering::Release);
    }
}

impl Drop for AdmissionGate {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl AdmissionBackend for AdmissionGate {
    fn check(&self, key: Option<&str>) -> Decision {
        match key {
            Some(key) => self.check_for(key),
            None => AdmissionGate::check(self),
        }
    }

    async fn wait(&self, key: Option<&str>, cx: &WaitContext) -> Result<(), WaitError> {
        match key {
            Some(key) => self.wait_for(key, cx).await,
            None => AdmissionGate::wait(self, cx).await,
        }
    }

    fn retry_after(&self, key: Option<&str>) -> Option<Duration> {
        match key {
            Some(key) => self.retry_after_for(key),
            None => AdmissionGate::retry_after(self),
        }
    }
}
