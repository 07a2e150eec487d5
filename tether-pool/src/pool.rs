//! The connection pool.
//!
//! # Model
//!
//! Idle streams live on two stacks. Returns push onto `new`; every sweep
//! first evicts from `old` (down to the minimum size) and then ages all of
//! `new` into `old`. A stream left unused is therefore evicted after at least
//! one and at most two sweep periods.
//!
//! Waiting callers block on three signals, checked in priority order:
//!
//! 1. an idle permit (a counting semaphore equal to `|new| + |old|`),
//! 2. the pool error state (set by an abort, cleared by a backoff timer or
//!    when the last waiter has observed it),
//! 3. the creation token, which serializes calls into the stream factory.
//!
//! All three live in one `WaitState` behind a single mutex and condvar; the
//! stacks, the object list, and the async request queue are locked
//! independently.

use crate::config::PoolConfig;
use crate::error::{PoolError, PoolResult};
use crate::lease::{Idle, Lease, PoolTag, Slot};
use crate::stats::{PoolStats, PoolStatsSnapshot};
use crate::stream::{Endpoint, PooledStream, StreamFactory};
use crate::worker::{AsyncQueue, AsyncRequest, ConnectionCallback};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tether_log::{debug, error, info, warn};
use tether_timer::{INFINITE, Timer, TimerQueue, TimerService};

// ============================================================================
// Lifecycle
// ============================================================================

/// Pool lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Being constructed.
    Initializing,
    /// Serving requests.
    Running,
    /// Shut down; acquisitions fail and returns destroy.
    ShuttingDown,
}

impl PoolState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PoolState::Initializing,
            1 => PoolState::Running,
            _ => PoolState::ShuttingDown,
        }
    }
}

/// Convert a millisecond timeout into a deadline. `INFINITE` has none.
pub(crate) fn deadline_after(timeout_ms: i32) -> PoolResult<Option<Instant>> {
    match timeout_ms {
        INFINITE => Ok(None),
        ms if ms < 0 => Err(PoolError::InvalidOperation(format!(
            "timeout must be >= 0 or INFINITE, got {ms}"
        ))),
        ms => Ok(Some(Instant::now() + Duration::from_millis(ms as u64))),
    }
}

// ============================================================================
// Wait state
// ============================================================================

enum Signal {
    Idle,
    Error(PoolError),
    Creation,
    Shutdown,
}

struct WaitState {
    /// Semaphore count; equals the number of idle streams at rest.
    idle_permits: usize,
    /// Stored error; `Some` means the pool is errored.
    error: Option<PoolError>,
    /// Bumped by every abort so stale reset timers cannot clear a newer error.
    error_epoch: u64,
    creation_free: bool,
    shutting_down: bool,
}

/// A stream handed to a caller, before activation.
pub(crate) struct Checkout<S> {
    idle: Idle<S>,
    fresh: bool,
}

/// Held while calling into the stream factory; releases the creation token on drop.
struct CreationToken<'a, S: PooledStream> {
    pool: &'a PoolInner<S>,
}

impl<S: PooledStream> Drop for CreationToken<'_, S> {
    fn drop(&mut self) {
        let mut wait = self.pool.wait.lock();
        wait.creation_free = true;
        self.pool.wake.notify_all();
    }
}

// ============================================================================
// Pool internals
// ============================================================================

pub(crate) struct PoolInner<S: PooledStream> {
    weak_self: Weak<Self>,
    pub(crate) endpoint: Endpoint,
    pub(crate) config: PoolConfig,
    factory: StreamFactory<S>,
    state: AtomicU8,

    /// Shared with every slot; identifies this pool's leases.
    tag: Arc<PoolTag>,
    /// Every stream the pool owns, idle or leased.
    objects: Mutex<Vec<Arc<Slot<S>>>>,
    total: AtomicUsize,
    next_slot: AtomicU64,

    stack_new: Mutex<Vec<Idle<S>>>,
    stack_old: Mutex<Vec<Idle<S>>>,

    wait: Mutex<WaitState>,
    wake: Condvar,
    pub(crate) waiters: AtomicUsize,

    error_queue: TimerQueue,
    error_timer: Mutex<Option<(Timer, u64)>>,
    cleanup_queue: TimerQueue,
    cleanup_timer: Mutex<Option<Timer>>,

    pub(crate) requests: Mutex<AsyncQueue<S>>,
    pub(crate) request_ready: Condvar,

    pub(crate) stats: PoolStats,
}

impl<S: PooledStream> PoolInner<S> {
    fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn is_shutting_down(&self) -> bool {
        self.state() == PoolState::ShuttingDown
    }

    fn count(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    fn at_capacity(&self) -> bool {
        let max = self.config.max_pool_size;
        max != 0 && self.count() >= max
    }

    // ------------------------------------------------------------------------
    // Signals
    // ------------------------------------------------------------------------

    /// Block until one of the signals fires or the deadline passes. Idle
    /// permits and the creation token are consumed; the error and shutdown
    /// states are only observed. Without `with_creation` the token is only
    /// taken once the pool drops below capacity.
    fn wait_any(&self, deadline: Option<Instant>, with_creation: bool) -> Option<Signal> {
        let mut wait = self.wait.lock();
        let mut timed_out = false;
        loop {
            if wait.shutting_down {
                return Some(Signal::Shutdown);
            }
            if wait.idle_permits > 0 {
                wait.idle_permits -= 1;
                return Some(Signal::Idle);
            }
            if let Some(err) = &wait.error {
                return Some(Signal::Error(err.clone()));
            }
            if wait.creation_free && (with_creation || !self.at_capacity()) {
                wait.creation_free = false;
                return Some(Signal::Creation);
            }
            if timed_out {
                return None;
            }
            match deadline {
                Some(deadline) => {
                    timed_out = self.wake.wait_until(&mut wait, deadline).timed_out();
                }
                None => self.wake.wait(&mut wait),
            }
        }
    }

    fn try_take_permit(&self) -> bool {
        let mut wait = self.wait.lock();
        if wait.idle_permits > 0 {
            wait.idle_permits -= 1;
            true
        } else {
            false
        }
    }

    fn release_permit(&self) {
        let mut wait = self.wait.lock();
        wait.idle_permits += 1;
        self.wake.notify_all();
    }

    /// Wait for the creation token alone.
    fn acquire_creation(&self, deadline: Option<Instant>) -> Option<CreationToken<'_, S>> {
        let mut wait = self.wait.lock();
        loop {
            if wait.creation_free {
                wait.creation_free = false;
                return Some(CreationToken { pool: self });
            }
            match deadline {
                Some(deadline) => {
                    let timed_out = self.wake.wait_until(&mut wait, deadline).timed_out();
                    if timed_out && !wait.creation_free {
                        return None;
                    }
                }
                None => self.wake.wait(&mut wait),
            }
        }
    }

    fn is_errored(&self) -> bool {
        self.wait.lock().error.is_some()
    }

    // ------------------------------------------------------------------------
    // Acquisition
    // ------------------------------------------------------------------------

    /// Resolve one acquisition. The caller is already counted in `waiters`;
    /// every outcome unregisters it except a probe that found nothing, which
    /// leaves the registration to the queued async request.
    pub(crate) fn wait_for_stream(
        &self,
        deadline: Option<Instant>,
        probe: bool,
    ) -> PoolResult<Option<Checkout<S>>> {
        let mut with_creation = true;
        loop {
            let Some(signal) = self.wait_any(deadline, with_creation) else {
                if probe {
                    return Ok(None);
                }
                self.unregister_waiter();
                PoolStats::bump(&self.stats.timeouts);
                return Err(PoolError::Timeout);
            };

            match signal {
                Signal::Shutdown => {
                    self.unregister_waiter();
                    return Err(PoolError::ShuttingDown);
                }
                Signal::Error(err) => {
                    if self.unregister_waiter() == 0 {
                        self.cancel_error_reset();
                    }
                    return Err(err);
                }
                Signal::Idle => {
                    self.unregister_waiter();
                    return self.get_from_pool().map(Some);
                }
                Signal::Creation => {
                    let token = CreationToken { pool: self };
                    let created = self.user_create_request();
                    if let Some(mut checkout) = created {
                        drop(token);
                        checkout.idle.stream.post_pop();
                        self.unregister_waiter();
                        return Ok(Some(checkout));
                    }
                    if self.at_capacity() && !self.reclaim_emancipated() {
                        with_creation = false;
                    }
                    drop(token);
                }
            }

            if probe {
                return Ok(None);
            }
        }
    }

    /// Returns the remaining number of waiters.
    pub(crate) fn unregister_waiter(&self) -> usize {
        self.waiters.fetch_sub(1, Ordering::AcqRel) - 1
    }

    fn pop_idle(&self) -> Option<Idle<S>> {
        let popped = self.stack_new.lock().pop();
        popped.or_else(|| self.stack_old.lock().pop())
    }

    /// Pop an idle stream after taking a permit.
    fn get_from_pool(&self) -> PoolResult<Checkout<S>> {
        match self.pop_idle() {
            Some(mut idle) => {
                idle.stream.post_pop();
                Ok(Checkout { idle, fresh: false })
            }
            None => Err(PoolError::InvalidOperation(
                "idle permit acquired with both idle stacks empty".to_string(),
            )),
        }
    }

    /// Create a stream on behalf of a caller holding the creation token.
    fn user_create_request(&self) -> Option<Checkout<S>> {
        if self.is_errored() || self.at_capacity() {
            return None;
        }
        // With an even count, try to recover abandoned streams first; if any
        // come back there is no need to create.
        if self.count() & 1 == 1 || !self.reclaim_emancipated() {
            return self.create();
        }
        None
    }

    fn create(&self) -> Option<Checkout<S>> {
        match (self.factory)(&self.endpoint) {
            Ok(stream) if stream.can_be_pooled() => {
                let slot = Slot::new(self.next_slot.fetch_add(1, Ordering::Relaxed), &self.tag);
                {
                    let mut objects = self.objects.lock();
                    objects.push(Arc::clone(&slot));
                    self.total.store(objects.len(), Ordering::Release);
                }
                PoolStats::bump(&self.stats.created);
                debug!(
                    target: "tether::pool",
                    "created stream {} for {}",
                    slot.id,
                    self.endpoint
                );
                Some(Checkout {
                    idle: Idle { slot, stream },
                    fresh: true,
                })
            }
            Ok(mut stream) => {
                stream.dispose();
                warn!(
                    target: "tether::pool",
                    "factory for {} returned a stream that cannot be pooled",
                    self.endpoint
                );
                let cause =
                    io::Error::other("stream factory returned a stream that cannot be pooled");
                self.abort_with_error(PoolError::Create(Arc::new(cause)));
                None
            }
            Err(err) => {
                warn!(
                    target: "tether::pool",
                    "failed to create stream for {}: {}",
                    self.endpoint,
                    err
                );
                self.abort_with_error(PoolError::Create(Arc::new(err)));
                None
            }
        }
    }

    /// Activate a checked-out stream. On failure the stream is destroyed.
    pub(crate) fn activate(&self, checkout: Checkout<S>) -> PoolResult<Lease<S>> {
        let Checkout { mut idle, fresh } = checkout;
        match idle.stream.activate() {
            Ok(()) => Ok(Lease::new(idle, fresh)),
            Err(err) => {
                debug!(
                    target: "tether::pool",
                    "activation of stream {} failed: {}",
                    idle.slot.id,
                    err
                );
                self.put_stream(idle, false);
                Err(PoolError::Activation(Arc::new(err)))
            }
        }
    }

    // ------------------------------------------------------------------------
    // Return and destruction
    // ------------------------------------------------------------------------

    pub(crate) fn put_stream(&self, mut idle: Idle<S>, can_reuse: bool) {
        idle.stream.pre_push();

        if self.is_shutting_down() {
            self.destroy(idle);
            return;
        }

        idle.stream.deactivate();
        if self.waiters.load(Ordering::Acquire) == 0 {
            self.cancel_error_reset();
        }

        if can_reuse && idle.stream.can_be_pooled() {
            self.put_new(idle);
            return;
        }

        self.destroy(idle);

        // Replace the unpoolable stream so a waiter is not starved.
        if self.waiters.load(Ordering::Acquire) > 0 {
            let deadline = deadline_after(self.config.creation_timeout_ms).unwrap_or(None);
            match self.acquire_creation(deadline) {
                None => self.abort(),
                Some(_token) => {
                    if let Some(checkout) = self.user_create_request() {
                        let mut idle = checkout.idle;
                        idle.stream.pre_push();
                        self.put_new(idle);
                    }
                }
            }
        }
    }

    fn put_new(&self, idle: Idle<S>) {
        self.stack_new.lock().push(idle);
        self.release_permit();
    }

    fn destroy(&self, idle: Idle<S>) {
        let Idle { slot, mut stream } = idle;
        {
            let mut objects = self.objects.lock();
            objects.retain(|s| !Arc::ptr_eq(s, &slot));
            self.total.store(objects.len(), Ordering::Release);
        }
        stream.dispose();
        PoolStats::bump(&self.stats.destroyed);
        debug!(
            target: "tether::pool",
            "destroyed stream {} for {}",
            slot.id,
            self.endpoint
        );

        // Capacity freed: waiters parked on idle permits may create again.
        let _wait = self.wait.lock();
        self.wake.notify_all();
    }

    /// Return abandoned streams to the pool. Slots whose lock is contended are
    /// skipped. Returns whether anything was reclaimed.
    ///
    /// Runs while the caller holds the creation token, so a reclaimed stream
    /// that cannot be pooled is destroyed without a replacement.
    fn reclaim_emancipated(&self) -> bool {
        let slots: Vec<Arc<Slot<S>>> = self.objects.lock().clone();
        let mut reclaimed = false;

        for slot in slots {
            let Some(stream) = slot.try_take_abandoned() else {
                continue;
            };
            reclaimed = true;
            PoolStats::bump(&self.stats.reclaimed);
            debug!(target: "tether::pool", "reclaimed abandoned stream {}", slot.id);

            let mut idle = Idle { slot, stream };
            idle.stream.pre_push();
            if self.is_shutting_down() {
                self.destroy(idle);
                continue;
            }
            idle.stream.deactivate();
            if idle.stream.can_be_pooled() {
                self.put_new(idle);
            } else {
                self.destroy(idle);
            }
        }

        reclaimed
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// One idle sweep: evict aged streams above the minimum size, then age
    /// the recently returned ones.
    pub(crate) fn sweep(&self) {
        while self.count() > self.config.min_pool_size {
            if !self.try_take_permit() {
                break;
            }
            let popped = self.stack_old.lock().pop();
            match popped {
                Some(idle) => {
                    PoolStats::bump(&self.stats.evicted);
                    self.destroy(idle);
                }
                None => {
                    self.release_permit();
                    break;
                }
            }
        }

        if self.try_take_permit() {
            {
                let mut new = self.stack_new.lock();
                let mut old = self.stack_old.lock();
                old.append(&mut new);
            }
            self.release_permit();
        }
    }

    fn force_cleanup(&self) {
        while self.count() > 0 {
            if !self.try_take_permit() {
                break;
            }
            match self.pop_idle() {
                Some(idle) => self.destroy(idle),
                None => break,
            }
        }
    }

    fn arm_cleanup(&self) {
        let weak = Weak::clone(&self.weak_self);
        let timer = self.cleanup_queue.create_timer(move |_| {
            if let Some(pool) = weak.upgrade() {
                pool.on_cleanup_timer();
            }
        });
        *self.cleanup_timer.lock() = Some(timer);
    }

    fn on_cleanup_timer(&self) {
        if self.is_shutting_down() {
            return;
        }
        self.sweep();
        self.arm_cleanup();
    }

    // ------------------------------------------------------------------------
    // Error state
    // ------------------------------------------------------------------------

    pub(crate) fn abort(&self) {
        let cause = io::Error::new(io::ErrorKind::ConnectionAborted, "the request was aborted");
        self.abort_with(cause);
    }

    pub(crate) fn abort_with(&self, cause: io::Error) {
        self.abort_with_error(PoolError::Aborted(Arc::new(cause)));
    }

    /// Enter the error state. An error already stored is kept, so every
    /// waiter in one window sees the same cause.
    fn abort_with_error(&self, err: PoolError) {
        let epoch = {
            let mut wait = self.wait.lock();
            if wait.error.is_none() {
                wait.error = Some(err);
            }
            wait.error_epoch += 1;
            self.wake.notify_all();
            wait.error_epoch
        };
        PoolStats::bump(&self.stats.aborts);
        info!(target: "tether::pool", "pool for {} entered error state", self.endpoint);

        let weak = Weak::clone(&self.weak_self);
        let timer = self.error_queue.create_timer(move |_| {
            if let Some(pool) = weak.upgrade() {
                pool.clear_error(epoch);
            }
        });
        let previous = self.error_timer.lock().replace((timer, epoch));
        if let Some((previous, _)) = previous {
            previous.cancel();
        }
    }

    fn clear_error(&self, epoch: u64) {
        let mut wait = self.wait.lock();
        if wait.error_epoch == epoch && wait.error.is_some() {
            wait.error = None;
            debug!(target: "tether::pool", "pool for {} left error state", self.endpoint);
        }
    }

    /// Clear the error state early if the backoff timer can still be cancelled.
    fn cancel_error_reset(&self) {
        let pending = self.error_timer.lock().take();
        if let Some((timer, epoch)) = pending
            && timer.cancel()
        {
            self.clear_error(epoch);
        }
    }
}

impl<S: PooledStream> Drop for PoolInner<S> {
    fn drop(&mut self) {
        self.tag.close();
        for mut idle in self.stack_new.get_mut().drain(..) {
            idle.stream.dispose();
        }
        for mut idle in self.stack_old.get_mut().drain(..) {
            idle.stream.dispose();
        }
        for slot in self.objects.get_mut().drain(..) {
            if let Some(mut stream) = slot.take_abandoned() {
                stream.dispose();
            }
        }
    }
}

// ============================================================================
// Public handle
// ============================================================================

/// A bounded pool of streams to one endpoint.
///
/// Cloning is cheap; every clone refers to the same pool. Streams come from
/// the factory given at construction and are handed out as [`Lease`]s.
///
/// ```rust,no_run
/// use std::io;
/// use std::net::TcpStream;
/// use tether_pool::{ConnectionPool, Endpoint, PoolConfig, PooledStream};
/// use tether_timer::TimerService;
///
/// struct Conn(TcpStream);
/// impl PooledStream for Conn {}
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let timers = TimerService::new();
/// let pool = ConnectionPool::new(
///     Endpoint::new("localhost", 8080),
///     PoolConfig::new(4),
///     &timers,
///     |ep: &Endpoint| -> io::Result<Conn> {
///         Ok(Conn(TcpStream::connect((ep.host.as_str(), ep.port))?))
///     },
/// )?;
///
/// let lease = pool.get_connection(1_000)?;
/// // ... use the stream ...
/// pool.put_connection(lease, true)?;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionPool<S: PooledStream> {
    inner: Arc<PoolInner<S>>,
}

impl<S: PooledStream> Clone for ConnectionPool<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: PooledStream> ConnectionPool<S> {
    /// Create a pool. Timer queues for the idle sweep and the error backoff
    /// are taken from `timers`.
    pub fn new<F>(
        endpoint: Endpoint,
        config: PoolConfig,
        timers: &TimerService,
        factory: F,
    ) -> PoolResult<Self>
    where
        F: Fn(&Endpoint) -> io::Result<S> + Send + Sync + 'static,
    {
        config.validate()?;
        let cleanup_queue = timers.create_queue(config.sweep_period_ms())?;
        let error_queue = timers.create_queue(config.error_backoff_ms)?;
        let factory: StreamFactory<S> = Arc::new(factory);

        let inner = Arc::new_cyclic(|weak_self| PoolInner {
            weak_self: Weak::clone(weak_self),
            endpoint,
            config,
            factory,
            state: AtomicU8::new(PoolState::Initializing as u8),
            tag: Arc::new(PoolTag::default()),
            objects: Mutex::new(Vec::new()),
            total: AtomicUsize::new(0),
            next_slot: AtomicU64::new(1),
            stack_new: Mutex::new(Vec::new()),
            stack_old: Mutex::new(Vec::new()),
            wait: Mutex::new(WaitState {
                idle_permits: 0,
                error: None,
                error_epoch: 0,
                creation_free: true,
                shutting_down: false,
            }),
            wake: Condvar::new(),
            waiters: AtomicUsize::new(0),
            error_queue,
            error_timer: Mutex::new(None),
            cleanup_queue,
            cleanup_timer: Mutex::new(None),
            requests: Mutex::new(AsyncQueue::default()),
            request_ready: Condvar::new(),
            stats: PoolStats::default(),
        });

        inner.arm_cleanup();
        inner
            .state
            .store(PoolState::Running as u8, Ordering::Release);
        info!(
            target: "tether::pool",
            "pool for {} running (max {}, min {})",
            inner.endpoint,
            inner.config.max_pool_size,
            inner.config.min_pool_size
        );

        Ok(Self { inner })
    }

    fn ensure_running(&self) -> PoolResult<()> {
        match self.inner.state() {
            PoolState::Running => Ok(()),
            PoolState::ShuttingDown => Err(PoolError::ShuttingDown),
            PoolState::Initializing => Err(PoolError::InvalidOperation(
                "pool is still initializing".to_string(),
            )),
        }
    }

    // ------------------------------------------------------------------------
    // Acquisition
    // ------------------------------------------------------------------------

    /// Check out a stream, blocking up to `timeout_ms` (or forever with
    /// [`INFINITE`]).
    ///
    /// Reuses an idle stream when one exists, otherwise creates one while
    /// the pool is below its maximum size. Fails fast with the stored error
    /// while the pool is errored.
    pub fn get_connection(&self, timeout_ms: i32) -> PoolResult<Lease<S>> {
        self.ensure_running()?;
        let deadline = deadline_after(timeout_ms)?;
        self.inner.waiters.fetch_add(1, Ordering::AcqRel);

        let checkout = self
            .inner
            .wait_for_stream(deadline, false)?
            .ok_or(PoolError::Timeout)?;
        self.inner.activate(checkout)
    }

    /// Check out a stream without blocking on an empty pool.
    ///
    /// Returns `Ok(Some(lease))` when a stream was available immediately.
    /// Otherwise the request is queued, `Ok(None)` is returned, and
    /// `callback` later receives the outcome on the pool's worker thread.
    pub fn get_connection_async<F>(
        &self,
        timeout_ms: i32,
        callback: F,
    ) -> PoolResult<Option<Lease<S>>>
    where
        F: FnOnce(PoolResult<Lease<S>>) + Send + 'static,
    {
        self.ensure_running()?;
        let deadline = deadline_after(timeout_ms)?;
        self.inner.waiters.fetch_add(1, Ordering::AcqRel);

        if let Some(checkout) = self.inner.wait_for_stream(Some(Instant::now()), true)? {
            return self.inner.activate(checkout).map(Some);
        }

        let callback: ConnectionCallback<S> = Box::new(callback);
        self.inner.queue_request(AsyncRequest { deadline, callback });
        Ok(None)
    }

    /// Check out a stream from async code.
    ///
    /// The wait happens on the pool's worker thread, so the calling task
    /// never blocks its executor.
    pub async fn acquire(&self, timeout_ms: i32) -> PoolResult<Lease<S>> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let pool = self.clone();
        let immediate = self.get_connection_async(timeout_ms, move |result| {
            if let Err(Ok(lease)) = tx.send(result) {
                // The awaiting task went away; hand the stream back.
                let _ = pool.put_connection(lease, true);
            }
        })?;

        if let Some(lease) = immediate {
            return Ok(lease);
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(PoolError::ShuttingDown),
        }
    }

    // ------------------------------------------------------------------------
    // Return
    // ------------------------------------------------------------------------

    /// Return a leased stream. With `can_reuse` false, or when the stream
    /// reports it cannot be pooled, the stream is destroyed.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidOperation`] when the lease was handed out by a
    /// different pool. The stream is then parked with the pool that owns it,
    /// as if the lease had been dropped.
    pub fn put_connection(&self, lease: Lease<S>, can_reuse: bool) -> PoolResult<()> {
        if !lease.belongs_to(&self.inner.tag) {
            error!(
                target: "tether::pool",
                "lease {} returned to the pool for {}, which did not hand it out",
                lease.id(),
                self.inner.endpoint
            );
            let id = lease.id();
            drop(lease);
            return Err(PoolError::InvalidOperation(format!(
                "lease {id} belongs to another pool"
            )));
        }
        if let Some(idle) = lease.into_idle() {
            self.inner.put_stream(idle, can_reuse);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// Destroy every idle stream. Leased streams are unaffected.
    pub fn force_cleanup(&self) {
        self.inner.force_cleanup();
    }

    /// Run one idle sweep now instead of waiting for the timer.
    pub fn sweep(&self) {
        self.inner.sweep();
    }

    /// Put the pool into the error state: every waiter fails with
    /// [`PoolError::Aborted`] until the backoff expires or no one is left
    /// waiting.
    pub fn abort(&self) {
        self.inner.abort();
    }

    /// Like [`abort`](Self::abort), with a specific cause.
    pub fn abort_with(&self, cause: io::Error) {
        self.inner.abort_with(cause);
    }

    /// Shut the pool down. Waiters fail with [`PoolError::ShuttingDown`],
    /// idle streams are destroyed, and streams returned later are destroyed
    /// on return.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        let previous = inner
            .state
            .swap(PoolState::ShuttingDown as u8, Ordering::AcqRel);
        if PoolState::from_u8(previous) == PoolState::ShuttingDown {
            return;
        }

        {
            let mut wait = inner.wait.lock();
            wait.shutting_down = true;
            inner.wake.notify_all();
        }
        inner.request_ready.notify_all();

        if let Some(timer) = inner.cleanup_timer.lock().take() {
            timer.cancel();
        }
        if let Some((timer, _)) = inner.error_timer.lock().take() {
            timer.cancel();
        }

        inner.force_cleanup();
        info!(target: "tether::pool", "pool for {} shut down", inner.endpoint);
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    /// Streams owned by the pool, idle or leased.
    pub fn count(&self) -> usize {
        self.inner.count()
    }

    /// Streams available for immediate checkout.
    pub fn idle_count(&self) -> usize {
        self.inner.wait.lock().idle_permits
    }

    /// Callers currently waiting, including queued async requests.
    pub fn waiters(&self) -> usize {
        self.inner.waiters.load(Ordering::Acquire)
    }

    /// Whether the pool is in the error state.
    pub fn is_errored(&self) -> bool {
        self.inner.is_errored()
    }

    /// The endpoint streams connect to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// The pool's configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Lifecycle state.
    pub fn state(&self) -> PoolState {
        self.inner.state()
    }

    /// Counters and current sizes.
    pub fn stats(&self) -> PoolStatsSnapshot {
        self.inner
            .stats
            .snapshot(self.count(), self.idle_count(), self.waiters())
    }
}

impl<S: PooledStream> fmt::Debug for ConnectionPool<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.inner.state())
            .field("count", &self.count())
            .field("idle", &self.idle_count())
            .field("waiters", &self.waiters())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[derive(Default)]
    struct Counters {
        created: AtomicUsize,
        disposed: AtomicUsize,
        fail_create: AtomicBool,
        fail_activate: AtomicBool,
        close_on_return: AtomicBool,
    }

    struct TestStream {
        poolable: bool,
        fail_activate: bool,
        close_on_return: bool,
        counters: Arc<Counters>,
    }

    impl PooledStream for TestStream {
        fn can_be_pooled(&self) -> bool {
            self.poolable
        }

        fn activate(&mut self) -> io::Result<()> {
            if self.fail_activate {
                Err(io::Error::other("handshake failed"))
            } else {
                Ok(())
            }
        }

        fn deactivate(&mut self) {
            if self.close_on_return {
                self.poolable = false;
            }
        }

        fn dispose(&mut self) {
            self.counters.disposed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool_with(config: PoolConfig) -> (ConnectionPool<TestStream>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let factory_counters = Arc::clone(&counters);
        let timers = TimerService::new();
        let pool = ConnectionPool::new(
            Endpoint::new("localhost", 80),
            config,
            &timers,
            move |_: &Endpoint| {
                if factory_counters.fail_create.load(Ordering::SeqCst) {
                    return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
                }
                factory_counters.created.fetch_add(1, Ordering::SeqCst);
                Ok(TestStream {
                    poolable: true,
                    fail_activate: factory_counters.fail_activate.load(Ordering::SeqCst),
                    close_on_return: factory_counters.close_on_return.load(Ordering::SeqCst),
                    counters: Arc::clone(&factory_counters),
                })
            },
        )
        .unwrap();
        (pool, counters)
    }

    fn manual_sweep_config(max: usize) -> PoolConfig {
        PoolConfig::builder()
            .max_pool_size(max)
            .idle_timeout_ms(INFINITE)
            .build()
    }

    #[test]
    fn test_returned_stream_is_reused() {
        let (pool, counters) = pool_with(PoolConfig::new(2));
        assert_eq!(pool.state(), PoolState::Running);

        let lease = pool.get_connection(100).unwrap();
        assert!(lease.is_fresh());
        let id = lease.id();
        pool.put_connection(lease, true).unwrap();
        assert_eq!(pool.idle_count(), 1);

        let lease = pool.get_connection(100).unwrap();
        assert!(!lease.is_fresh());
        assert_eq!(lease.id(), id);
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.count(), 1);
        assert_eq!(pool.waiters(), 0);
    }

    #[test]
    fn test_full_pool_times_out() {
        let (pool, _) = pool_with(PoolConfig::new(1));
        let _held = pool.get_connection(100).unwrap();

        let started = Instant::now();
        let err = pool.get_connection(30).unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(pool.stats().timeouts, 1);
        assert_eq!(pool.waiters(), 0);
    }

    #[test]
    fn test_negative_timeout_rejected() {
        let (pool, _) = pool_with(PoolConfig::new(1));
        assert!(matches!(
            pool.get_connection(-7),
            Err(PoolError::InvalidOperation(_))
        ));
        assert_eq!(pool.waiters(), 0);
    }

    #[test]
    fn test_factory_failure_surfaces_and_resets() {
        let (pool, counters) = pool_with(PoolConfig::new(2));
        counters.fail_create.store(true, Ordering::SeqCst);

        let err = pool.get_connection(100).unwrap_err();
        assert!(matches!(err, PoolError::Create(_)));
        assert_eq!(err.cause().unwrap().kind(), io::ErrorKind::ConnectionRefused);
        // The only waiter observed the error, so the pool is usable again.
        assert!(!pool.is_errored());

        counters.fail_create.store(false, Ordering::SeqCst);
        assert!(pool.get_connection(100).is_ok());
    }

    #[test]
    fn test_abort_fails_next_waiter_once() {
        let (pool, _) = pool_with(PoolConfig::new(2));
        pool.abort();
        assert!(pool.is_errored());

        let err = pool.get_connection(100).unwrap_err();
        assert!(matches!(err, PoolError::Aborted(_)));
        assert!(!pool.is_errored());
        assert!(pool.get_connection(100).is_ok());
        assert_eq!(pool.stats().aborts, 1);
    }

    #[test]
    fn test_abort_with_cause() {
        let (pool, _) = pool_with(PoolConfig::new(2));
        pool.abort_with(io::Error::new(io::ErrorKind::TimedOut, "upstream stalled"));
        let err = pool.get_connection(100).unwrap_err();
        assert_eq!(err.cause().unwrap().kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_unreusable_return_destroys() {
        let (pool, counters) = pool_with(PoolConfig::new(2));
        let lease = pool.get_connection(100).unwrap();
        pool.put_connection(lease, false).unwrap();

        assert_eq!(pool.count(), 0);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(counters.disposed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_activation_failure_destroys_stream() {
        let (pool, counters) = pool_with(PoolConfig::new(2));
        counters.fail_activate.store(true, Ordering::SeqCst);

        let err = pool.get_connection(100).unwrap_err();
        assert!(matches!(err, PoolError::Activation(_)));
        assert_eq!(pool.count(), 0);
        assert_eq!(counters.disposed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_two_sweeps_evict_idle_streams() {
        let (pool, counters) = pool_with(manual_sweep_config(4));
        let a = pool.get_connection(100).unwrap();
        let b = pool.get_connection(100).unwrap();
        pool.put_connection(a, true).unwrap();
        pool.put_connection(b, true).unwrap();

        pool.sweep();
        assert_eq!(pool.count(), 2);
        assert_eq!(pool.idle_count(), 2);

        pool.sweep();
        assert_eq!(pool.count(), 0);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.stats().evicted, 2);
        assert_eq!(counters.disposed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_sweep_keeps_minimum() {
        let config = PoolConfig::builder()
            .max_pool_size(4)
            .min_pool_size(1)
            .idle_timeout_ms(INFINITE)
            .build();
        let (pool, _) = pool_with(config);
        let leases: Vec<_> = (0..3).map(|_| pool.get_connection(100).unwrap()).collect();
        for lease in leases {
            pool.put_connection(lease, true).unwrap();
        }

        pool.sweep();
        pool.sweep();
        pool.sweep();
        assert_eq!(pool.count(), 1);
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn test_recently_used_stream_survives_sweep() {
        let (pool, _) = pool_with(manual_sweep_config(4));
        let lease = pool.get_connection(100).unwrap();
        pool.put_connection(lease, true).unwrap();
        pool.sweep();

        // Checking the stream out and back in moves it to the new stack.
        let lease = pool.get_connection(100).unwrap();
        pool.put_connection(lease, true).unwrap();
        pool.sweep();
        assert_eq!(pool.count(), 1);
    }

    #[test]
    fn test_force_cleanup_spares_leases() {
        let (pool, counters) = pool_with(manual_sweep_config(4));
        let held = pool.get_connection(100).unwrap();
        let a = pool.get_connection(100).unwrap();
        let b = pool.get_connection(100).unwrap();
        pool.put_connection(a, true).unwrap();
        pool.put_connection(b, true).unwrap();

        pool.force_cleanup();
        assert_eq!(pool.count(), 1);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(counters.disposed.load(Ordering::SeqCst), 2);
        pool.put_connection(held, true).unwrap();
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn test_abandoned_lease_is_reclaimed_at_capacity() {
        let (pool, counters) = pool_with(PoolConfig::new(1));
        let lease = pool.get_connection(100).unwrap();
        let id = lease.id();
        drop(lease);

        let lease = pool.get_connection(100).unwrap();
        assert_eq!(lease.id(), id);
        assert!(!lease.is_fresh());
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().reclaimed, 1);
    }

    #[test]
    fn test_reclaimed_stream_closed_on_return_is_replaced() {
        let config = PoolConfig::builder()
            .max_pool_size(1)
            .creation_timeout_ms(300)
            .idle_timeout_ms(INFINITE)
            .build();
        let (pool, counters) = pool_with(config);
        counters.close_on_return.store(true, Ordering::SeqCst);
        let lease = pool.get_connection(100).unwrap();
        drop(lease);

        let started = Instant::now();
        let lease = pool.get_connection(2_000).unwrap();
        assert!(started.elapsed() < Duration::from_millis(300));
        assert!(lease.is_fresh());
        assert!(!pool.is_errored());
        assert_eq!(counters.created.load(Ordering::SeqCst), 2);
        assert_eq!(counters.disposed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().reclaimed, 1);
        assert_eq!(pool.count(), 1);
    }

    #[test]
    fn test_lease_from_another_pool_is_rejected() {
        let (a, _) = pool_with(PoolConfig::new(1));
        let (b, _) = pool_with(PoolConfig::new(1));
        let lease = a.get_connection(100).unwrap();

        assert!(matches!(
            b.put_connection(lease, true),
            Err(PoolError::InvalidOperation(_))
        ));
        assert_eq!(b.count(), 0);
        assert_eq!(b.idle_count(), 0);

        // The stream went back to the pool that owns it.
        let lease = a.get_connection(50).unwrap();
        assert!(!lease.is_fresh());
        assert_eq!(a.count(), 1);
        a.put_connection(lease, true).unwrap();
        assert_eq!(a.idle_count(), 1);
    }

    #[test]
    fn test_lease_outliving_pool_disposes_stream() {
        let (pool, counters) = pool_with(PoolConfig::new(2));
        let lease = pool.get_connection(100).unwrap();
        drop(pool);
        assert_eq!(counters.disposed.load(Ordering::SeqCst), 0);

        drop(lease);
        assert_eq!(counters.disposed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_waiter_at_capacity_creates_once_capacity_frees() {
        let (pool, counters) = pool_with(manual_sweep_config(1));
        let held = pool.get_connection(100).unwrap();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.get_connection(5_000))
        };
        while pool.waiters() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(20));

        // Destroy directly so nothing but the waiter can create.
        let idle = held.into_idle().unwrap();
        pool.inner.destroy(idle);
        assert_eq!(pool.count(), 0);

        let lease = waiter.join().unwrap().unwrap();
        assert!(lease.is_fresh());
        assert_eq!(counters.created.load(Ordering::SeqCst), 2);
        assert_eq!(pool.count(), 1);
        assert_eq!(pool.waiters(), 0);
    }

    #[test]
    fn test_even_count_reclaims_before_creating() {
        let (pool, counters) = pool_with(PoolConfig::new(4));
        let a = pool.get_connection(100).unwrap();
        let b = pool.get_connection(100).unwrap();
        let abandoned = b.id();
        drop(b);

        let c = pool.get_connection(100).unwrap();
        assert_eq!(c.id(), abandoned);
        assert_eq!(counters.created.load(Ordering::SeqCst), 2);
        pool.put_connection(a, true).unwrap();
        pool.put_connection(c, true).unwrap();
    }

    #[test]
    fn test_shutdown_fails_waiters_and_destroys_returns() {
        let (pool, counters) = pool_with(PoolConfig::new(1));
        let held = pool.get_connection(100).unwrap();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.get_connection(INFINITE))
        };
        while pool.waiters() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        pool.shutdown();

        assert!(matches!(waiter.join().unwrap(), Err(PoolError::ShuttingDown)));
        assert_eq!(pool.state(), PoolState::ShuttingDown);
        assert!(matches!(
            pool.get_connection(10),
            Err(PoolError::ShuttingDown)
        ));

        pool.put_connection(held, true).unwrap();
        assert_eq!(pool.count(), 0);
        assert_eq!(counters.disposed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_contended_checkouts_respect_max() {
        let (pool, _) = pool_with(PoolConfig::new(3));
        let in_use = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let in_use = Arc::clone(&in_use);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    for _ in 0..25 {
                        let lease = pool.get_connection(INFINITE).unwrap();
                        let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        thread::yield_now();
                        in_use.fetch_sub(1, Ordering::SeqCst);
                        pool.put_connection(lease, true).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(pool.count() <= 3);
        assert_eq!(pool.idle_count(), pool.count());
        assert_eq!(pool.waiters(), 0);
    }

    #[test]
    fn test_dropping_last_handle_disposes_idle() {
        let (pool, counters) = pool_with(PoolConfig::new(2));
        let lease = pool.get_connection(100).unwrap();
        pool.put_connection(lease, true).unwrap();
        drop(pool);
        assert_eq!(counters.disposed.load(Ordering::SeqCst), 1);
    }
}
