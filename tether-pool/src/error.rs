//! Pool error types.

use std::io;
use std::sync::Arc;
use tether_timer::TimerError;
use thiserror::Error;

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Pool errors.
///
/// Errors carrying an `io::Error` hold it behind an `Arc`: when the pool is
/// aborted every waiter receives a clone of the same stored error, and
/// [`PoolError::cause`] lets callers check that identity.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    /// No stream became available within the creation timeout.
    #[error("Timed out waiting for a pooled connection")]
    Timeout,

    /// The pool was aborted.
    #[error("Connection pool aborted: {0}")]
    Aborted(Arc<io::Error>),

    /// The stream factory failed; the pool is in its error backoff window.
    #[error("Failed to create connection: {0}")]
    Create(Arc<io::Error>),

    /// Stream activation failed; the stream was destroyed.
    #[error("Failed to activate connection: {0}")]
    Activation(Arc<io::Error>),

    /// The pool is shutting down.
    #[error("Connection pool is shutting down")]
    ShuttingDown,

    /// Caller contract violation or broken internal invariant.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The async request worker could not be started.
    #[error("Async worker unavailable: {0}")]
    Worker(Arc<io::Error>),

    /// Timer service error.
    #[error("Timer error: {0}")]
    Timer(#[from] TimerError),
}

impl PoolError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PoolError::Timeout
                | PoolError::Aborted(_)
                | PoolError::Create(_)
                | PoolError::Activation(_)
                | PoolError::Worker(_)
        )
    }

    /// Check if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, PoolError::Timeout)
    }

    /// The shared underlying I/O error, if any.
    pub fn cause(&self) -> Option<&Arc<io::Error>> {
        match self {
            PoolError::Aborted(err)
            | PoolError::Create(err)
            | PoolError::Activation(err)
            | PoolError::Worker(err) => Some(err),
            _ => None,
        }
    }
}

impl From<PoolError> for io::Error {
    fn from(err: PoolError) -> Self {
        let kind = match &err {
            PoolError::Timeout => io::ErrorKind::TimedOut,
            PoolError::Aborted(_) => io::ErrorKind::ConnectionAborted,
            PoolError::Create(cause) | PoolError::Activation(cause) => cause.kind(),
            PoolError::ShuttingDown => io::ErrorKind::NotConnected,
            PoolError::InvalidOperation(_) | PoolError::Config(_) => io::ErrorKind::InvalidInput,
            PoolError::Worker(_) | PoolError::Timer(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
