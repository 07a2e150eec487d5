//! # Tether Pool
//!
//! A bounded pool of reusable streams to a single endpoint.
//!
//! ## Features
//!
//! - Blocking checkout with a timeout ([`ConnectionPool::get_connection`])
//! - Callback-based checkout served by a background worker
//!   ([`ConnectionPool::get_connection_async`]) and an `async` wrapper
//!   ([`ConnectionPool::acquire`])
//! - Idle eviction driven by a [`tether_timer`] queue, never below the
//!   configured minimum size
//! - A shared error state after factory failures or [`ConnectionPool::abort`],
//!   so waiters fail fast instead of hammering a dead endpoint
//! - Recovery of leases that were dropped instead of returned
//!
//! ## Example
//!
//! ```rust
//! use std::io;
//! use tether_pool::{ConnectionPool, Endpoint, PoolConfig, PooledStream};
//! use tether_timer::TimerService;
//!
//! struct Loopback;
//! impl PooledStream for Loopback {}
//!
//! let timers = TimerService::new();
//! let pool = ConnectionPool::new(
//!     Endpoint::new("127.0.0.1", 9000),
//!     PoolConfig::builder().max_pool_size(2).build(),
//!     &timers,
//!     |_: &Endpoint| -> io::Result<Loopback> { Ok(Loopback) },
//! )
//! .unwrap();
//!
//! let lease = pool.get_connection(100).unwrap();
//! assert!(lease.is_fresh());
//! pool.put_connection(lease, true).unwrap();
//! assert_eq!(pool.idle_count(), 1);
//! ```

pub mod config;
pub mod error;
pub mod lease;
pub mod pool;
pub mod stats;
pub mod stream;
mod worker;

pub use config::{PoolConfig, PoolConfigBuilder};
pub use error::{PoolError, PoolResult};
pub use lease::Lease;
pub use pool::{ConnectionPool, PoolState};
pub use stats::{PoolStats, PoolStatsSnapshot};
pub use stream::{Endpoint, PooledStream, StreamFactory};
pub use worker::ConnectionCallback;
