//! Request guard turning admission answers into transport verdicts.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::key::{KeySource, RequestMeta};
use crate::ratelimit::{AdmissionBackend, Decision, WaitContext};

/// Status reported for rejected requests (Too Many Requests).
pub const TOO_MANY_REQUESTS: u16 = 429;

/// How the guard treats requests over budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Reject immediately with a retry hint.
    Reject,
    /// Hold the request until a token is available, up to `max_wait`.
    Delay { max_wait: Duration },
}

/// What the transport should do with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Pass the request on to the downstream handler.
    Forward,
    /// Answer the request with `status`.
    Reject {
        status: u16,
        /// When the caller may retry. `None` if the request can never be admitted.
        retry_after: Option<Duration>,
    },
}

impl Verdict {
    pub fn is_forward(&self) -> bool {
        matches!(self, Verdict::Forward)
    }

    /// Retry hint in whole seconds, rounded up, for a `Retry-After` header.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Verdict::Reject {
                retry_after: Some(delay),
                ..
            } => {
                let secs = delay.as_secs();
                Some(if delay.subsec_nanos() > 0 { secs + 1 } else { secs })
            }
            _ => None,
        }
    }

    fn rejected(retry_after: Option<Duration>) -> Self {
        Verdict::Reject {
            status: TOO_MANY_REQUESTS,
            retry_after,
        }
    }
}

/// Guards a downstream handler with an admission backend.
pub struct RequestGuard<B: AdmissionBackend> {
    /// The admission backend
    backend: Arc<B>,
    /// How requests map to budgets
    source: KeySource,
    mode: Mode,
}

impl<B: AdmissionBackend> RequestGuard<B> {
    /// Create a guard that rejects requests over budget.
    pub fn new(backend: Arc<B>, source: KeySource) -> Self {
        Self {
            backend,
            source,
            mode: Mode::Reject,
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn source(&self) -> &KeySource {
        &self.source
    }

    /// Decide whether `req` may reach the downstream handler.
    #[instrument(skip(self, req), fields(source = %self.source))]
    pub async fn evaluate<R>(&self, req: &R) -> Verdict
    where
        R: RequestMeta + ?Sized,
    {
        let key = self.source.key_for(req);

        match self.mode {
            Mode::Reject => match self.backend.check(key.as_deref()) {
                Decision::Admitted { .. } => Verdict::Forward,
                Decision::Rejected { retry_after } => {
                    debug!(key = ?key, retry_after = ?retry_after, "Request over budget");
                    Verdict::rejected(retry_after)
                }
            },
            Mode::Delay { max_wait } => {
                let cx = WaitContext::with_timeout(max_wait);
                match self.backend.wait(key.as_deref(), &cx).await {
                    Ok(()) => Verdict::Forward,
                    Err(err) if err.is_permanent() => {
                        warn!(key = ?key, error = %err, "Request can never be admitted");
                        Verdict::rejected(None)
                    }
                    Err(err) => {
                        let retry_after = self.backend.retry_after(key.as_deref());
                        debug!(
                            key = ?key,
                            error = %err,
                            retry_after = ?retry_after,
                            "Request not admitted in time"
                        );
                        Verdict::rejected(retry_after)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::RequestInfo;
    use crate::ratelimit::{AdmissionGate, Limit};
    use tokio::time::Instant;

    fn from(addr: &str) -> RequestInfo {
        RequestInfo::new(Some(addr.parse().unwrap()))
    }

    fn gate(rate: f64, burst: u32) -> Arc<AdmissionGate> {
        Arc::new(AdmissionGate::new(Limit::per_second(rate), burst))
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_over_budget_by_remote_addr() {
        let guard = RequestGuard::new(gate(2.0, 1), KeySource::RemoteAddr);

        assert_eq!(guard.evaluate(&from("10.0.0.1:1000")).await, Verdict::Forward);
        // Same IP, different port: same budget.
        let verdict = guard.evaluate(&from("10.0.0.1:2000")).await;
        assert_eq!(
            verdict,
            Verdict::Reject {
                status: TOO_MANY_REQUESTS,
                retry_after: Some(Duration::from_millis(500)),
            }
        );
        assert_eq!(verdict.retry_after_secs(), Some(1));

        assert!(guard.evaluate(&from("10.0.0.2:1000")).await.is_forward());
    }

    #[tokio::test(start_paused = true)]
    async fn test_header_source() {
        let guard = RequestGuard::new(gate(1.0, 1), KeySource::header("X-Api-Key"));
        let alice = RequestInfo::default().with_header("X-Api-Key", "alice");
        let bob = RequestInfo::default().with_header("X-Api-Key", "bob");

        assert!(guard.evaluate(&alice).await.is_forward());
        assert!(!guard.evaluate(&alice).await.is_forward());
        assert!(guard.evaluate(&bob).await.is_forward());
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_source_shares_budget() {
        let guard = RequestGuard::new(gate(1.0, 1), KeySource::Global);
        assert!(guard.evaluate(&from("10.0.0.1:1")).await.is_forward());
        assert!(!guard.evaluate(&from("10.0.0.2:1")).await.is_forward());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_burst_is_never_admitted() {
        let guard = RequestGuard::new(gate(1.0, 0), KeySource::RemoteAddr);
        let verdict = guard.evaluate(&from("10.0.0.1:1")).await;
        assert_eq!(
            verdict,
            Verdict::Reject {
                status: TOO_MANY_REQUESTS,
                retry_after: None
            }
        );
        assert_eq!(verdict.retry_after_secs(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_mode_holds_request() {
        let guard = RequestGuard::new(gate(1.0, 1), KeySource::RemoteAddr).with_mode(Mode::Delay {
            max_wait: Duration::from_secs(2),
        });

        assert!(guard.evaluate(&from("10.0.0.1:1")).await.is_forward());
        let start = Instant::now();
        assert!(guard.evaluate(&from("10.0.0.1:1")).await.is_forward());
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_mode_rejects_past_max_wait() {
        let guard = RequestGuard::new(gate(1.0, 1), KeySource::Global).with_mode(Mode::Delay {
            max_wait: Duration::from_millis(300),
        });

        assert!(guard.evaluate(&RequestInfo::default()).await.is_forward());
        let verdict = guard.evaluate(&RequestInfo::default()).await;
        // The hint is the real time to the next token, not the wait bound.
        assert_eq!(
            verdict,
            Verdict::Reject {
                status: TOO_MANY_REQUESTS,
                retry_after: Some(Duration::from_secs(1)),
            }
        );
        assert_eq!(verdict.retry_after_secs(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_mode_hint_follows_caller_debt() {
        let gate = gate(1.0, 1);
        let guard = RequestGuard::new(gate.clone(), KeySource::RemoteAddr).with_mode(Mode::Delay {
            max_wait: Duration::from_millis(500),
        });
        // Two tokens owed by an earlier reservation for the same caller.
        let _first = gate.reserve_for("10.0.0.1");
        let _second = gate.reserve_for("10.0.0.1");

        let verdict = guard.evaluate(&from("10.0.0.1:1")).await;
        assert_eq!(verdict.retry_after_secs(), Some(2));
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let whole = Verdict::rejected(Some(Duration::from_secs(2)));
        assert_eq!(whole.retry_after_secs(), Some(2));
        let partial = Verdict::rejected(Some(Duration::from_millis(2001)));
        assert_eq!(partial.retry_after_secs(), Some(3));
        assert_eq!(Verdict::Forward.retry_after_secs(), None);
    }
}
