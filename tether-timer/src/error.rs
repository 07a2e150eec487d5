//! Timer error types.

use thiserror::Error;

/// Result type for timer operations.
pub type TimerResult<T> = Result<T, TimerError>;

/// Timer service errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimerError {
    /// A queue was requested with a negative duration other than [`crate::INFINITE`].
    #[error("Invalid timer duration: {0}ms")]
    InvalidDuration(i32),
}
