//! Fixed-duration timer queues and timer handles.

use crate::list::{NodeRef, TimerCallback, TimerList, TimerState};
use crate::service::ServiceShared;
use crate::tick::{TickSource, is_tick_between};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tether_log::warn;

pub(crate) struct QueueInner {
    duration_ms: u32,
    list: Mutex<TimerList>,
    clock: Arc<dyn TickSource>,
    service: Weak<ServiceShared>,
}

impl QueueInner {
    pub(crate) fn new(
        duration_ms: u32,
        clock: Arc<dyn TickSource>,
        service: Weak<ServiceShared>,
    ) -> Self {
        Self {
            duration_ms,
            list: Mutex::new(TimerList::new()),
            clock,
            service,
        }
    }

    pub(crate) fn duration_ms(&self) -> u32 {
        self.duration_ms
    }

    pub(crate) fn pending(&self) -> usize {
        self.list.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }

    /// Fire every expired timer at the head of the queue. Callbacks run with
    /// the list unlocked. Returns the next pending expiration, if any.
    pub(crate) fn fire(&self, now: u32) -> Option<u32> {
        loop {
            let expired = {
                let mut list = self.list.lock();
                match list.pop_expired(now, is_tick_between) {
                    Ok(Some(expired)) => expired,
                    Ok(None) => return None,
                    Err(next) => return Some(next),
                }
            };

            if let Some(callback) = expired.callback {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    callback(now)
                }));
                if outcome.is_err() {
                    warn!(
                        target: "tether::timer",
                        "timer callback panicked (queue {}ms); dispatcher continues",
                        self.duration_ms
                    );
                }
            }
        }
    }
}

/// A queue of timers sharing one duration.
///
/// Obtained from [`crate::TimerService::create_queue`]. Cloning is cheap and
/// every clone refers to the same queue.
#[derive(Clone)]
pub struct TimerQueue {
    kind: QueueKind,
}

#[derive(Clone)]
enum QueueKind {
    Finite(Arc<QueueInner>),
    Infinite(Arc<dyn TickSource>),
}

impl TimerQueue {
    pub(crate) fn finite(inner: Arc<QueueInner>) -> Self {
        Self {
            kind: QueueKind::Finite(inner),
        }
    }

    pub(crate) fn infinite(clock: Arc<dyn TickSource>) -> Self {
        Self {
            kind: QueueKind::Infinite(clock),
        }
    }

    /// Duration of every timer in this queue, `None` for the infinite queue.
    pub fn duration_ms(&self) -> Option<u32> {
        match &self.kind {
            QueueKind::Finite(inner) => Some(inner.duration_ms),
            QueueKind::Infinite(_) => None,
        }
    }

    /// Whether this is the dummy queue whose timers never expire.
    pub fn is_infinite(&self) -> bool {
        matches!(self.kind, QueueKind::Infinite(_))
    }

    /// Number of timers currently waiting in this queue.
    pub fn pending(&self) -> usize {
        match &self.kind {
            QueueKind::Finite(inner) => inner.pending(),
            QueueKind::Infinite(_) => 0,
        }
    }

    /// Start a timer that runs `callback` when it expires.
    pub fn create_timer<F>(&self, callback: F) -> Timer
    where
        F: FnOnce(u32) + Send + 'static,
    {
        self.create(Some(Box::new(callback)))
    }

    /// Start a timer with no callback, used purely as a deadline.
    pub fn create_deadline(&self) -> Timer {
        self.create(None)
    }

    fn create(&self, callback: Option<TimerCallback>) -> Timer {
        match &self.kind {
            QueueKind::Infinite(clock) => Timer {
                start: clock.now(),
                expiration: None,
                kind: TimerKind::Infinite {
                    cancelled: AtomicBool::new(false),
                    clock: Arc::clone(clock),
                },
            },
            QueueKind::Finite(inner) => {
                let start = inner.clock.now();
                let expiration = start.wrapping_add(inner.duration_ms);
                let (node, first) = {
                    let mut list = inner.list.lock();
                    let first = list.is_empty();
                    (list.push_back(start, expiration, callback), first)
                };

                if first {
                    match inner.service.upgrade() {
                        Some(service) => service.activate(Arc::clone(inner)),
                        None => warn!(
                            target: "tether::timer",
                            "timer created on a queue whose service was dropped; it will never fire"
                        ),
                    }
                }

                Timer {
                    start,
                    expiration: Some(expiration),
                    kind: TimerKind::Queued {
                        queue: Arc::clone(inner),
                        node,
                    },
                }
            }
        }
    }
}

impl fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerQueue")
            .field("duration_ms", &self.duration_ms())
            .field("pending", &self.pending())
            .finish()
    }
}

/// Handle to a running timer. Holding it grants the right to cancel.
///
/// Dropping the handle does not cancel the timer.
pub struct Timer {
    start: u32,
    expiration: Option<u32>,
    kind: TimerKind,
}

enum TimerKind {
    Queued {
        queue: Arc<QueueInner>,
        node: NodeRef,
    },
    Infinite {
        cancelled: AtomicBool,
        clock: Arc<dyn TickSource>,
    },
}

impl Timer {
    /// Tick at which the timer was started.
    pub fn start_tick(&self) -> u32 {
        self.start
    }

    /// Tick at which the timer expires, `None` for infinite timers.
    pub fn expiration(&self) -> Option<u32> {
        self.expiration
    }

    /// Configured duration, `None` for infinite timers.
    pub fn duration_ms(&self) -> Option<u32> {
        match &self.kind {
            TimerKind::Queued { queue, .. } => Some(queue.duration_ms),
            TimerKind::Infinite { .. } => None,
        }
    }

    fn now(&self) -> u32 {
        match &self.kind {
            TimerKind::Queued { queue, .. } => queue.clock.now(),
            TimerKind::Infinite { clock, .. } => clock.now(),
        }
    }

    /// Whether the expiration tick has been reached.
    pub fn has_expired(&self) -> bool {
        match self.expiration {
            Some(expiration) => !is_tick_between(self.start, expiration, self.now()),
            None => false,
        }
    }

    /// Time left before expiry; zero once expired, `None` if the timer never
    /// expires.
    pub fn time_remaining(&self) -> Option<Duration> {
        let expiration = self.expiration?;
        let now = self.now();
        if !is_tick_between(self.start, expiration, now) {
            return Some(Duration::ZERO);
        }
        Some(Duration::from_millis(u64::from(expiration.wrapping_sub(now))))
    }

    /// Current state, as far as this handle can observe it.
    pub fn state(&self) -> TimerState {
        match &self.kind {
            TimerKind::Queued { queue, node } => {
                // A recycled slot no longer records how the node left the
                // list; report it as fired.
                queue.list.lock().state(*node).unwrap_or(TimerState::Fired)
            }
            TimerKind::Infinite { cancelled, .. } => {
                if cancelled.load(Ordering::Acquire) {
                    TimerState::Cancelled
                } else {
                    TimerState::Ready
                }
            }
        }
    }

    /// Cancel the timer. Returns `true` only if it was still ready; a timer
    /// that already fired, or was cancelled before, returns `false`.
    pub fn cancel(&self) -> bool {
        match &self.kind {
            TimerKind::Queued { queue, node } => {
                let removed = queue.list.lock().cancel(*node);
                // The callback is dropped here, outside the list lock.
                removed.is_some()
            }
            TimerKind::Infinite { cancelled, .. } => cancelled
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
        }
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("start", &self.start)
            .field("expiration", &self.expiration)
            .field("state", &self.state())
            .finish()
    }
}
