//! Transport-facing boundary of the admission gate.
//!
//! Transports describe an inbound request through [`RequestMeta`], choose how
//! requests map to budgets with a [`KeySource`], and ask a [`RequestGuard`]
//! for a [`Verdict`]. Nothing here depends on a particular HTTP stack.

mod guard;
mod key;

pub use guard::{Mode, RequestGuard, Verdict, TOO_MANY_REQUESTS};
pub use key::{KeySource, RequestInfo, RequestMeta};
