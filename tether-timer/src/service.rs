//! The timer service and its dispatcher thread.

use crate::error::{TimerError, TimerResult};
use crate::queue::{QueueInner, TimerQueue};
use crate::tick::{MonotonicTicks, TickSource};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tether_log::{debug, error};

/// Duration value meaning "never expires".
pub const INFINITE: i32 = -1;

/// Timer service configuration.
#[derive(Debug, Clone)]
pub struct TimerServiceConfig {
    /// How long the dispatcher lingers with no timers before its thread exits.
    pub idle_timeout: Duration,
    /// Upper bound on a single dispatcher sleep, even when the next deadline
    /// is further away.
    pub max_sleep: Duration,
    /// Name given to the dispatcher thread.
    pub thread_name: String,
}

impl Default for TimerServiceConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            max_sleep: Duration::from_secs(30),
            thread_name: "tether-timer".to_string(),
        }
    }
}

impl TimerServiceConfig {
    /// Set the dispatcher idle timeout.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Set the maximum single sleep.
    pub fn with_max_sleep(mut self, max_sleep: Duration) -> Self {
        self.max_sleep = max_sleep;
        self
    }
}

#[derive(Debug, Default)]
struct DispatchState {
    running: bool,
    signaled: bool,
    shutdown: bool,
    threads_started: u64,
}

pub(crate) struct ServiceShared {
    config: TimerServiceConfig,
    clock: Arc<dyn TickSource>,
    /// Every live queue, by duration. Weak so unused queues are torn down.
    queues: Mutex<HashMap<u32, Weak<QueueInner>>>,
    /// Queues that may hold ready timers. Strong while they do.
    active: Mutex<Vec<Arc<QueueInner>>>,
    dispatch: Mutex<DispatchState>,
    wake: Condvar,
    weak_self: Weak<ServiceShared>,
}

impl ServiceShared {
    /// Register a queue that just received its first timer and wake the
    /// dispatcher, starting its thread if it is idle.
    pub(crate) fn activate(&self, queue: Arc<QueueInner>) {
        {
            let mut active = self.active.lock();
            if !active.iter().any(|q| Arc::ptr_eq(q, &queue)) {
                active.push(queue);
            }
        }
        self.signal();
    }

    fn signal(&self) {
        let mut state = self.dispatch.lock();
        if state.shutdown {
            return;
        }
        state.signaled = true;
        if !state.running {
            let Some(shared) = self.weak_self.upgrade() else {
                return;
            };
            let spawned = std::thread::Builder::new()
                .name(self.config.thread_name.clone())
                .spawn(move || dispatch_loop(shared));
            match spawned {
                Ok(_) => {
                    state.running = true;
                    state.threads_started += 1;
                }
                Err(e) => {
                    error!(target: "tether::timer", "failed to start timer dispatcher: {}", e)
                }
            }
        }
        self.wake.notify_one();
    }

    /// Fire everything that has expired. Returns the delay until the next
    /// pending expiration across all queues.
    fn fire_pass(&self) -> Option<Duration> {
        let queues: Vec<Arc<QueueInner>> = self.active.lock().clone();

        let mut upcoming = Vec::with_capacity(queues.len());
        for queue in &queues {
            if let Some(expiration) = queue.fire(self.clock.now()) {
                upcoming.push(expiration);
            }
        }

        self.active.lock().retain(|q| !q.is_empty());

        let now = self.clock.now();
        upcoming
            .into_iter()
            .map(|expiration| {
                // Durations are below 2^31 ms, so the signed difference is exact.
                let delta = (expiration.wrapping_sub(now) as i32).max(0);
                Duration::from_millis(delta as u64)
            })
            .min()
    }

    fn has_active(&self) -> bool {
        !self.active.lock().is_empty()
    }
}

fn dispatch_loop(shared: Arc<ServiceShared>) {
    debug!(target: "tether::timer", "timer dispatcher started");

    loop {
        let next = shared.fire_pass();

        let mut state = shared.dispatch.lock();
        if state.shutdown {
            state.running = false;
            break;
        }
        if state.signaled {
            state.signaled = false;
            continue;
        }

        let timeout = match next {
            Some(delay) => delay.min(shared.config.max_sleep),
            None => shared.config.idle_timeout,
        };
        let result = shared.wake.wait_for(&mut state, timeout);

        if state.shutdown {
            state.running = false;
            break;
        }
        if next.is_none() && result.timed_out() && !state.signaled && !shared.has_active() {
            state.running = false;
            break;
        }
        state.signaled = false;
    }

    debug!(target: "tether::timer", "timer dispatcher stopped");
}

/// Process-wide countdown timer facility.
///
/// Construct one at startup and hand clones to every consumer. Timers are
/// grouped into queues by duration; a single background thread fires them
/// and exits on its own once no timers remain for
/// [`TimerServiceConfig::idle_timeout`]. Creating a timer restarts it.
///
/// ```rust
/// use tether_timer::TimerService;
/// use std::sync::mpsc;
///
/// let service = TimerService::new();
/// let queue = service.create_queue(10).unwrap();
/// let (tx, rx) = mpsc::channel();
/// let _timer = queue.create_timer(move |_tick| {
///     let _ = tx.send(());
/// });
/// rx.recv().unwrap();
/// ```
#[derive(Clone)]
pub struct TimerService {
    shared: Arc<ServiceShared>,
}

impl TimerService {
    /// Service with default configuration and a monotonic clock.
    pub fn new() -> Self {
        Self::with_config(TimerServiceConfig::default())
    }

    /// Service with custom configuration and a monotonic clock.
    pub fn with_config(config: TimerServiceConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicTicks::new()))
    }

    /// Service driven by a custom tick source.
    pub fn with_clock(config: TimerServiceConfig, clock: Arc<dyn TickSource>) -> Self {
        let shared = Arc::new_cyclic(|weak_self| ServiceShared {
            config,
            clock,
            queues: Mutex::new(HashMap::new()),
            active: Mutex::new(Vec::new()),
            dispatch: Mutex::new(DispatchState::default()),
            wake: Condvar::new(),
            weak_self: weak_self.clone(),
        });
        Self { shared }
    }

    /// Get the queue for `duration_ms`, creating it if no live queue with
    /// that duration exists.
    ///
    /// [`INFINITE`] yields a dummy queue whose timers never expire. Any other
    /// negative value is rejected.
    pub fn create_queue(&self, duration_ms: i32) -> TimerResult<TimerQueue> {
        if duration_ms == INFINITE {
            return Ok(TimerQueue::infinite(Arc::clone(&self.shared.clock)));
        }
        if duration_ms < 0 {
            return Err(TimerError::InvalidDuration(duration_ms));
        }
        let duration = duration_ms as u32;

        let mut queues = self.shared.queues.lock();
        if let Some(inner) = queues.get(&duration).and_then(Weak::upgrade) {
            return Ok(TimerQueue::finite(inner));
        }

        queues.retain(|_, queue| queue.strong_count() > 0);
        let inner = Arc::new(QueueInner::new(
            duration,
            Arc::clone(&self.shared.clock),
            Arc::downgrade(&self.shared),
        ));
        queues.insert(duration, Arc::downgrade(&inner));
        debug!(target: "tether::timer", "created timer queue for {}ms", duration);

        Ok(TimerQueue::finite(inner))
    }

    /// Current tick of the service clock.
    pub fn now(&self) -> u32 {
        self.shared.clock.now()
    }

    /// Ready timers across all active queues.
    pub fn pending(&self) -> usize {
        self.shared.active.lock().iter().map(|q| q.pending()).sum()
    }

    /// Number of live queues in the cache.
    pub fn queue_count(&self) -> usize {
        self.shared
            .queues
            .lock()
            .values()
            .filter(|q| q.strong_count() > 0)
            .count()
    }

    /// Whether the dispatcher thread is currently alive.
    pub fn is_dispatcher_running(&self) -> bool {
        self.shared.dispatch.lock().running
    }

    /// How many dispatcher threads have been started over the service's life.
    pub fn dispatcher_starts(&self) -> u64 {
        self.shared.dispatch.lock().threads_started
    }

    /// Wake the dispatcher so it re-evaluates deadlines immediately. Needed
    /// after moving a manual clock forward.
    pub fn poke(&self) {
        if self.shared.has_active() {
            self.shared.signal();
        }
    }

    /// Stop the dispatcher for good. Pending timers never fire afterwards.
    pub fn shutdown(&self) {
        let mut state = self.shared.dispatch.lock();
        state.shutdown = true;
        self.shared.wake.notify_all();
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TimerService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerService")
            .field("queues", &self.queue_count())
            .field("pending", &self.pending())
            .field("dispatcher_running", &self.is_dispatcher_running())
            .finish()
    }
}
