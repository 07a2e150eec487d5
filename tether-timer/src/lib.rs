//! # Tether Timer
//!
//! Countdown timers grouped into fixed-duration queues, fired by one
//! background dispatcher thread.
//!
//! ## Model
//!
//! - [`TimerService`]: explicit service object; create one and share clones.
//! - [`TimerQueue`]: all timers of one duration. Because every timer in a
//!   queue has the same duration, insertion order is expiration order and the
//!   head of the queue is always the next to fire.
//! - [`Timer`]: handle to one countdown; `cancel()` races safely with firing.
//!   Exactly one of {callback runs, `cancel()` returns `true`} happens.
//!
//! Deadlines use a wrapping 32-bit millisecond counter and are compared with
//! [`is_tick_between`], never with plain subtraction.
//!
//! ## Example
//!
//! ```rust
//! use tether_timer::{TimerService, INFINITE};
//!
//! let service = TimerService::new();
//!
//! let cleanup = service.create_queue(30_000).unwrap();
//! let timer = cleanup.create_timer(|tick| println!("fired at {tick}"));
//! assert!(timer.cancel());
//!
//! let never = service.create_queue(INFINITE).unwrap();
//! assert!(!never.create_deadline().has_expired());
//! ```

pub mod error;
mod list;
pub mod queue;
pub mod service;
pub mod tick;

pub use error::{TimerError, TimerResult};
pub use list::{TimerCallback, TimerState};
pub use queue::{Timer, TimerQueue};
pub use service::{INFINITE, TimerService, TimerServiceConfig};
pub use tick::{ManualTicks, MonotonicTicks, TickSource, is_tick_between};
