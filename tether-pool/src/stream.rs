//! The pooled stream contract and endpoint identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::sync::Arc;

/// A reusable connection managed by a [`crate::ConnectionPool`].
///
/// Every hook has a no-op default. Hooks run on whichever thread drives the
/// pool operation and must not call back into the pool.
pub trait PooledStream: Send + 'static {
    /// Whether the stream may go back into the pool. Checked when the stream
    /// is created and again when it is returned.
    fn can_be_pooled(&self) -> bool {
        true
    }

    /// Called before the stream enters an idle stack.
    fn pre_push(&mut self) {}

    /// Called when the stream leaves the pool for a caller.
    fn post_pop(&mut self) {}

    /// Prepare the stream for a caller. An error destroys the stream and is
    /// reported as [`crate::PoolError::Activation`].
    fn activate(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Called when a caller returns the stream, unless the pool is shutting
    /// down.
    fn deactivate(&mut self) {}

    /// Release the underlying resource. Called exactly once, when the pool
    /// evicts the stream.
    fn dispose(&mut self) {}
}

/// Creates streams for an endpoint.
pub type StreamFactory<S> = Arc<dyn Fn(&Endpoint) -> io::Result<S> + Send + Sync>;

/// Identity of the remote endpoint a pool connects to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host name or address
    pub host: String,
    /// Port
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
