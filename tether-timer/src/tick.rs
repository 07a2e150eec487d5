//! Millisecond tick counter and wraparound-safe comparisons.
//!
//! Timer arithmetic runs on a 32-bit millisecond counter that wraps roughly
//! every 49.7 days. Deadlines are never compared with plain `<`; instead every
//! check asks whether a tick lies inside the half-open window
//! `[start, expiration)`, which stays correct across a single wrap.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

/// Source of the wrapping millisecond counter.
pub trait TickSource: Send + Sync + 'static {
    /// Current tick in milliseconds. Wraps on overflow.
    fn now(&self) -> u32;
}

/// Ticks derived from [`Instant`], truncated to `u32`.
#[derive(Debug)]
pub struct MonotonicTicks {
    origin: Instant,
    offset: u32,
}

impl MonotonicTicks {
    /// Counter starting at zero.
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Counter whose first reading is `offset`. Useful to place the wrap point
    /// a few milliseconds into the future.
    pub fn starting_at(offset: u32) -> Self {
        Self {
            origin: Instant::now(),
            offset,
        }
    }
}

impl Default for MonotonicTicks {
    fn default() -> Self {
        Self::new()
    }
}

impl TickSource for MonotonicTicks {
    #[inline]
    fn now(&self) -> u32 {
        // Truncation is the wrap.
        let elapsed = self.origin.elapsed().as_millis() as u32;
        self.offset.wrapping_add(elapsed)
    }
}

/// Manually driven counter for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualTicks {
    now: AtomicU32,
}

impl ManualTicks {
    /// Counter reading `start`.
    pub fn new(start: u32) -> Self {
        Self {
            now: AtomicU32::new(start),
        }
    }

    /// Move the counter forward, wrapping on overflow.
    pub fn advance(&self, millis: u32) {
        let _ = self
            .now
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| {
                Some(t.wrapping_add(millis))
            });
    }

    /// Set the counter to an absolute value.
    pub fn set(&self, tick: u32) {
        self.now.store(tick, Ordering::SeqCst);
    }
}

impl TickSource for ManualTicks {
    #[inline]
    fn now(&self) -> u32 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Whether `comparand` lies in `[start, end)` on the wrapping counter.
///
/// Equal `start` and `end` describe an empty window. A comparand equal to
/// `start` means no time has passed; one equal to `end` means the end has
/// been reached.
#[inline]
pub fn is_tick_between(start: u32, end: u32, comparand: u32) -> bool {
    let (start, end, comparand) = (start as i32, end as i32, comparand as i32);
    ((start <= comparand) == (end <= comparand)) != (start <= end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_between_without_wrap() {
        assert!(is_tick_between(10, 20, 10));
        assert!(is_tick_between(10, 20, 19));
        assert!(!is_tick_between(10, 20, 20));
        assert!(!is_tick_between(10, 20, 9));
        assert!(!is_tick_between(10, 20, 25));
    }

    #[test]
    fn test_between_across_u32_wrap() {
        let start = u32::MAX - 5;
        let end = start.wrapping_add(10);
        assert_eq!(end, 4);
        assert!(is_tick_between(start, end, u32::MAX));
        assert!(is_tick_between(start, end, 0));
        assert!(is_tick_between(start, end, 3));
        assert!(!is_tick_between(start, end, 4));
        assert!(!is_tick_between(start, end, 100));
    }

    #[test]
    fn test_between_across_sign_boundary() {
        let start = i32::MAX as u32 - 2;
        let end = start.wrapping_add(5);
        assert!(is_tick_between(start, end, i32::MAX as u32));
        assert!(is_tick_between(start, end, i32::MIN as u32));
        assert!(!is_tick_between(start, end, end));
    }

    #[test]
    fn test_empty_window() {
        assert!(!is_tick_between(7, 7, 7));
        assert!(!is_tick_between(7, 7, 8));
    }

    #[test]
    fn test_manual_ticks_wrap() {
        let ticks = ManualTicks::new(u32::MAX - 1);
        ticks.advance(3);
        assert_eq!(ticks.now(), 1);
    }

    proptest::proptest! {
        #[test]
        fn prop_window_holds_for_any_start(
            start in proptest::prelude::any::<u32>(),
            duration in 1u32..=i32::MAX as u32,
            offset in proptest::prelude::any::<u32>(),
        ) {
            let end = start.wrapping_add(duration);
            let elapsed = offset % duration;
            proptest::prop_assert!(is_tick_between(start, end, start.wrapping_add(elapsed)));
            proptest::prop_assert!(!is_tick_between(start, end, end));
        }
    }
}
