//! Admission trait consumed by the request boundary.

use std::time::Duration;

use async_trait::async_trait;

use super::bucket::{Decision, WaitContext};
use crate::error::WaitError;

/// Trait for admission backends.
///
/// The request guard only asks "may one unit of work for this key go
/// ahead?", so it can sit in front of an [`AdmissionGate`](super::AdmissionGate)
/// or any other implementation. `None` selects the global budget.
#[async_trait]
pub trait AdmissionBackend: Send + Sync {
    /// Admit or reject one unit of work without blocking.
    fn check(&self, key: Option<&str>) -> Decision;

    /// Wait until one unit of work may go ahead.
    async fn wait(&self, key: Option<&str>, cx: &WaitContext) -> Result<(), WaitError>;

    /// Time until one unit of work could go ahead, without admitting it.
    /// `None` if it never could.
    fn retry_after(&self, key: Option<&str>) -> Option<Duration>;
}
