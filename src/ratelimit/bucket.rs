//! Token bucket implementation.
//!
//! A bucket of size `burst` starts full and is refilled at `limit` tokens
//! per second. Refill is computed lazily whenever the bucket is queried, so
//! there is no timer behind a bucket, only its last recomputed snapshot.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::WaitError;

/// Refill rate of a token bucket, in tokens per second.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Limit(f64);

impl Limit {
    /// Disables limiting entirely; burst checks are skipped.
    pub const INF: Limit = Limit(f64::INFINITY);

    /// A limit of `rate` tokens per second. Negative or NaN rates become zero.
    pub fn per_second(rate: f64) -> Self {
        if rate.is_nan() || rate <= 0.0 {
            Limit(0.0)
        } else {
            Limit(rate)
        }
    }

    /// A limit of one token every `interval`. A zero interval is unlimited.
    pub fn every(interval: Duration) -> Self {
        if interval.is_zero() {
            Self::INF
        } else {
            Limit(1.0 / interval.as_secs_f64())
        }
    }

    /// Tokens per second.
    pub fn as_f64(&self) -> f64 {
        self.0
    }

    pub fn is_unlimited(&self) -> bool {
        self.0.is_infinite()
    }

    /// Time needed to accumulate `tokens`, or `None` if that never happens.
    fn duration_from_tokens(&self, tokens: f64) -> Option<Duration> {
        if tokens <= 0.0 || self.is_unlimited() {
            return Some(Duration::ZERO);
        }
        if self.0 <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(tokens / self.0).ok()
    }

    fn tokens_from_duration(&self, elapsed: Duration) -> f64 {
        if self.0 <= 0.0 {
            return 0.0;
        }
        elapsed.as_secs_f64() * self.0
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unlimited() {
            write!(f, "unlimited")
        } else {
            write!(f, "{}/s", self.0)
        }
    }
}

/// The outcome of a non-blocking admission check.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The unit of work may proceed.
    Admitted {
        /// Whole tokens left after this admission; `u32::MAX` when unlimited.
        remaining: u32,
    },
    /// The unit of work was refused and nothing was debited.
    Rejected {
        /// How long until the same demand could succeed. `None` if it never can.
        retry_after: Option<Duration>,
    },
}

impl Decision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admitted { .. })
    }

    /// The retry hint of a rejection.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Decision::Rejected { retry_after } => *retry_after,
            Decision::Admitted { .. } => None,
        }
    }
}

#[derive(Debug)]
struct BucketState {
    limit: Limit,
    burst: u32,
    /// May be negative while reservations are outstanding.
    tokens: f64,
    /// When `tokens` was last recomputed.
    last: Instant,
    /// Latest `ok_at` handed out by a reservation.
    last_event: Instant,
}

impl BucketState {
    /// Token level at `t` without mutating the snapshot.
    fn advance(&self, t: Instant) -> f64 {
        let burst = f64::from(self.burst);
        if self.limit.is_unlimited() {
            return burst;
        }
        // An instant before `last` counts as no time passing.
        let elapsed = t.saturating_duration_since(self.last);
        (self.tokens + self.limit.tokens_from_duration(elapsed)).min(burst)
    }

    /// Store the token level at `t`. `last` never moves backwards, so an
    /// out-of-order `t` cannot credit the same interval twice.
    fn settle(&mut self, t: Instant) -> f64 {
        let tokens = self.advance(t);
        if t > self.last {
            self.last = t;
        }
        self.tokens = tokens;
        tokens
    }
}

/// A thread-safe token bucket.
///
/// `TokenBucket` is a cheap handle: clones share the same state. Every
/// operation runs its recompute-then-debit sequence under the bucket's own
/// lock, so distinct buckets never contend with each other.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    state: Arc<Mutex<BucketState>>,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(limit: Limit, burst: u32) -> Self {
        let now = Instant::now();
        Self {
            state: Arc::new(Mutex::new(BucketState {
                limit,
                burst,
                tokens: f64::from(burst),
                last: now,
                last_event: now,
            })),
        }
    }

    pub fn limit(&self) -> Limit {
        self.state.lock().limit
    }

    pub fn burst(&self) -> u32 {
        self.state.lock().burst
    }

    /// Current token level.
    pub fn tokens(&self) -> f64 {
        self.tokens_at(Instant::now())
    }

    /// Token level the bucket would have at `t`.
    pub fn tokens_at(&self, t: Instant) -> f64 {
        self.state.lock().advance(t)
    }

    /// Whether both handles refer to the same bucket.
    pub fn same_bucket(&self, other: &TokenBucket) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Whether any other handle, such as a pending reservation, refers to
    /// this bucket.
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.state) > 1
    }

    /// Whether reservations still owe tokens at `t`.
    pub fn in_debt_at(&self, t: Instant) -> bool {
        let state = self.state.lock();
        state.last_event > t || state.advance(t) < 0.0
    }

    /// Time from `t` until `n` tokens are available, without taking them.
    ///
    /// `None` if `n` exceeds the burst or the tokens can never accrue.
    pub fn delay_at(&self, t: Instant, n: u32) -> Option<Duration> {
        let state = self.state.lock();
        if state.limit.is_unlimited() {
            return Some(Duration::ZERO);
        }
        if n > state.burst {
            return None;
        }
        state.limit.duration_from_tokens(f64::from(n) - state.advance(t))
    }

    /// Shorthand for `allow_n(Instant::now(), 1)`.
    pub fn allow(&self) -> bool {
        self.allow_n(Instant::now(), 1)
    }

    /// Report whether `n` units of work may happen at `t`, consuming the
    /// tokens if so.
    pub fn allow_n(&self, t: Instant, n: u32) -> bool {
        self.check_n(t, n).is_admitted()
    }

    /// Shorthand for `check_n(Instant::now(), 1)`.
    pub fn check(&self) -> Decision {
        self.check_n(Instant::now(), 1)
    }

    /// Like [`allow_n`](Self::allow_n), but a rejection carries the delay
    /// until the same demand would be admitted.
    pub fn check_n(&self, t: Instant, n: u32) -> Decision {
        let mut state = self.state.lock();

        if state.limit.is_unlimited() {
            return Decision::Admitted { remaining: u32::MAX };
        }

        let tokens = state.settle(t);

        let demand = f64::from(n);
        if n <= state.burst && demand <= tokens {
            state.tokens = tokens - demand;
            return Decision::Admitted {
                remaining: state.tokens.max(0.0).floor() as u32,
            };
        }

        let retry_after = if n > state.burst {
            None
        } else {
            state.limit.duration_from_tokens(demand - tokens)
        };
        trace!(
            requested = n,
            tokens = tokens,
            retry_after = ?retry_after,
            "Token bucket rejected demand"
        );
        Decision::Rejected { retry_after }
    }

    /// Shorthand for `reserve_n(Instant::now(), 1)`.
    pub fn reserve(&self) -> Reservation {
        self.reserve_n(Instant::now(), 1)
    }

    /// Reserve `n` tokens at `t`.
    ///
    /// The tokens are debited right away, possibly driving the bucket into
    /// debt, and the returned reservation says when the caller may act. The
    /// reservation is invalid (and nothing is debited) when `n` exceeds the
    /// burst under a finite rate, or when the tokens can never accrue.
    pub fn reserve_n(&self, t: Instant, n: u32) -> Reservation {
        match self.reserve_within(t, n, Duration::MAX) {
            Ok(reservation) => reservation,
            Err(_) => Reservation {
                bucket: self.clone(),
                ok: false,
                tokens: 0,
                ok_at: t,
                limit: self.limit(),
            },
        }
    }

    /// Reserve `n` tokens, refusing if they would not be available within
    /// `max_wait` of `t`.
    fn reserve_within(
        &self,
        t: Instant,
        n: u32,
        max_wait: Duration,
    ) -> Result<Reservation, WaitError> {
        let mut state = self.state.lock();
        let limit = state.limit;

        if limit.is_unlimited() {
            return Ok(Reservation {
                bucket: self.clone(),
                ok: true,
                tokens: n,
                ok_at: t,
                limit,
            });
        }

        if n > state.burst {
            return Err(WaitError::ExceedsBurst {
                requested: n,
                burst: state.burst,
            });
        }

        let tokens = state.advance(t) - f64::from(n);
        let wait = limit
            .duration_from_tokens(-tokens)
            .ok_or(WaitError::Starved { requested: n })?;
        if wait > max_wait {
            return Err(WaitError::DeadlineExceeded { requested: n });
        }
        let ok_at = t
            .checked_add(wait)
            .ok_or(WaitError::Starved { requested: n })?;

        state.settle(t);
        state.tokens = tokens;
        state.last_event = ok_at;

        trace!(requested = n, tokens = tokens, wait = ?wait, "Reserved tokens");

        Ok(Reservation {
            bucket: self.clone(),
            ok: true,
            tokens: n,
            ok_at,
            limit,
        })
    }

    /// Shorthand for `wait_n(cx, 1)`.
    pub async fn wait(&self, cx: &WaitContext) -> Result<(), WaitError> {
        self.wait_n(cx, 1).await
    }

    /// Wait until `n` tokens are available and consume them.
    ///
    /// Fails without blocking when the demand can never be met or would not
    /// be met before the context deadline. If the context is cancelled while
    /// waiting, or the returned future is dropped, the reserved tokens are
    /// given back to the bucket.
    pub async fn wait_n(&self, cx: &WaitContext, n: u32) -> Result<(), WaitError> {
        let (limit, burst) = {
            let state = self.state.lock();
            (state.limit, state.burst)
        };
        if limit.is_unlimited() {
            return Ok(());
        }
        if n > burst {
            return Err(WaitError::ExceedsBurst { requested: n, burst });
        }
        if cx.is_cancelled() {
            return Err(WaitError::Cancelled);
        }

        let now = Instant::now();
        let max_wait = match cx.deadline() {
            Some(deadline) if deadline <= now => {
                return Err(WaitError::DeadlineExceeded { requested: n });
            }
            Some(deadline) => deadline - now,
            None => Duration::MAX,
        };

        let reservation = self.reserve_within(now, n, max_wait)?;
        let ok_at = reservation.ok_at;
        if ok_at <= now {
            return Ok(());
        }

        let pending = PendingReservation(Some(reservation));
        tokio::select! {
            _ = tokio::time::sleep_until(ok_at) => {
                pending.commit();
                Ok(())
            }
            _ = cx.cancelled() => {
                trace!(requested = n, "Wait cancelled, restoring tokens");
                drop(pending);
                Err(WaitError::Cancelled)
            }
        }
    }

    /// Shorthand for `set_limit_at(Instant::now(), limit)`.
    pub fn set_limit(&self, limit: Limit) {
        self.set_limit_at(Instant::now(), limit);
    }

    /// Change the refill rate, keeping the tokens accrued under the old rate
    /// up to `t`. Reservations made before the change keep their `ok_at`.
    pub fn set_limit_at(&self, t: Instant, limit: Limit) {
        let mut state = self.state.lock();
        state.settle(t);
        state.limit = limit;
    }

    /// Shorthand for `set_burst_at(Instant::now(), burst)`.
    pub fn set_burst(&self, burst: u32) {
        self.set_burst_at(Instant::now(), burst);
    }

    /// Change the burst size, keeping the tokens accrued up to `t` and
    /// clamping them to the new burst.
    pub fn set_burst_at(&self, t: Instant, burst: u32) {
        let mut state = self.state.lock();
        let tokens = state.settle(t);
        state.tokens = tokens.min(f64::from(burst));
        state.burst = burst;
    }
}

/// A promise from a bucket that `tokens` may be used at `ok_at`.
#[derive(Debug)]
pub struct Reservation {
    bucket: TokenBucket,
    ok: bool,
    tokens: u32,
    ok_at: Instant,
    /// Limit in force when the reservation was made.
    limit: Limit,
}

impl Reservation {
    /// Whether the bucket can honor this reservation at all.
    pub fn ok(&self) -> bool {
        self.ok
    }

    /// Tokens held by this reservation; zero once cancelled.
    pub fn tokens(&self) -> u32 {
        self.tokens
    }

    /// The earliest instant the caller may act, if the reservation is valid.
    pub fn ok_at(&self) -> Option<Instant> {
        self.ok.then_some(self.ok_at)
    }

    pub fn limit(&self) -> Limit {
        self.limit
    }

    /// Shorthand for `delay_from(Instant::now())`.
    pub fn delay(&self) -> Duration {
        self.delay_from(Instant::now())
    }

    /// How long the caller must wait from `t` before acting.
    /// `Duration::MAX` means never.
    pub fn delay_from(&self, t: Instant) -> Duration {
        if !self.ok {
            return Duration::MAX;
        }
        self.ok_at.saturating_duration_since(t)
    }

    /// Shorthand for `cancel_at(Instant::now())`.
    pub fn cancel(&mut self) {
        self.cancel_at(Instant::now());
    }

    /// Give the reserved tokens back to the bucket, as far as later
    /// reservations have not already built on them.
    ///
    /// No-op for invalid or already cancelled reservations, and for ones
    /// whose `ok_at` is before `t`.
    pub fn cancel_at(&mut self, t: Instant) {
        if !self.ok || self.tokens == 0 || self.ok_at < t {
            return;
        }
        let reserved = self.tokens;
        self.tokens = 0;

        let mut state = self.bucket.state.lock();
        if state.limit.is_unlimited() {
            return;
        }

        // Tokens consumed by reservations made after this one stay spent.
        let later = state.last_event.saturating_duration_since(self.ok_at);
        let restore = f64::from(reserved) - self.limit.tokens_from_duration(later);
        if restore <= 0.0 {
            return;
        }

        let tokens = (state.settle(t) + restore).min(f64::from(state.burst));
        state.tokens = tokens;

        if self.ok_at == state.last_event {
            let prev_event = self
                .limit
                .duration_from_tokens(f64::from(reserved))
                .and_then(|d| self.ok_at.checked_sub(d));
            if let Some(prev_event) = prev_event {
                if prev_event >= t {
                    state.last_event = prev_event;
                }
            }
        }

        trace!(restored = restore, tokens = tokens, "Cancelled reservation");
    }
}

/// Cancels its reservation when dropped unless committed.
struct PendingReservation(Option<Reservation>);

impl PendingReservation {
    fn commit(mut self) {
        self.0.take();
    }
}

impl Drop for PendingReservation {
    fn drop(&mut self) {
        if let Some(mut reservation) = self.0.take() {
            reservation.cancel();
        }
    }
}

/// Cancellation signal and optional deadline for a blocking wait.
#[derive(Debug, Clone)]
pub struct WaitContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl WaitContext {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// A context driven by an existing cancellation token.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self::background().until(deadline)
    }

    /// A context whose deadline is `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        let mut cx = Self::background();
        cx.deadline = Instant::now().checked_add(timeout);
        cx
    }

    /// Set the deadline, keeping the earlier one if already set.
    pub fn until(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

impl Default for WaitContext {
    fn default() -> Self {
        Self::background()
    }
}
