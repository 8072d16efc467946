//! Error types for Tollgate.

use thiserror::Error;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A blocking admission failed
    #[error("Wait error: {0}")]
    Wait(#[from] WaitError),
}

/// Reasons a blocking wait on a token bucket can fail.
///
/// Every failure leaves the bucket as if the wait had never been attempted.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The demand is larger than the bucket can ever hold.
    #[error("wait for {requested} tokens exceeds burst of {burst}")]
    ExceedsBurst { requested: u32, burst: u32 },

    /// The bucket has a zero rate and not enough tokens left.
    #[error("wait for {requested} tokens can never be satisfied at a zero rate")]
    Starved { requested: u32 },

    /// The tokens would not be available before the context deadline.
    #[error("wait for {requested} tokens would exceed the context deadline")]
    DeadlineExceeded { requested: u32 },

    /// The context was cancelled before the tokens became available.
    #[error("wait cancelled")]
    Cancelled,
}

impl WaitError {
    /// Whether retrying the same demand can never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::ExceedsBurst { .. } | Self::Starved { .. })
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_classification() {
        assert!(WaitError::ExceedsBurst { requested: 3, burst: 2 }.is_permanent());
        assert!(WaitError::Starved { requested: 1 }.is_permanent());
        assert!(!WaitError::DeadlineExceeded { requested: 1 }.is_permanent());
        assert!(!WaitError::Cancelled.is_permanent());
    }

    #[test]
    fn test_wait_error_display() {
        let err = WaitError::ExceedsBurst { requested: 5, burst: 2 };
        assert_eq!(err.to_string(), "wait for 5 tokens exceeds burst of 2");

        let err: TollgateError = WaitError::Cancelled.into();
        assert_eq!(err.to_string(), "Wait error: wait cancelled");
    }
}
