// Tether - HTTP/1.1 client plumbing for Rust
//
// This library bundles the pieces an HTTP/1.1 client keeps beneath its
// request API: countdown timers, a chunked body decoder, and connection pools.

// Re-export the timer service
pub use tether_timer::{INFINITE, Timer, TimerError, TimerQueue, TimerService, TimerServiceConfig};

// Re-export logging
pub use tether_log as log;

// Re-export optional crates
#[cfg(feature = "chunked")]
pub use tether_chunked;

#[cfg(feature = "pool")]
pub use tether_pool;

// Prelude for common imports
pub mod prelude {
    pub use crate::{INFINITE, Timer, TimerQueue, TimerService};

    #[cfg(feature = "chunked")]
    pub use tether_chunked::{ChunkError, ChunkedDecoder, DecoderConfig};

    #[cfg(feature = "pool")]
    pub use tether_pool::{
        ConnectionPool, Endpoint, Lease, PoolConfig, PoolError, PoolResult, PooledStream,
    };
}
