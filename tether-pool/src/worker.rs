//! Background worker serving queued async acquisitions.
//!
//! Requests that cannot be satisfied immediately wait in a FIFO. A single
//! thread, started on demand, resolves them one at a time and exits after
//! the queue has been empty for `async_worker_idle_ms`.

use crate::error::{PoolError, PoolResult};
use crate::lease::Lease;
use crate::pool::PoolInner;
use crate::stream::PooledStream;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tether_log::{debug, error, warn};

/// Receives the outcome of a queued acquisition.
pub type ConnectionCallback<S> = Box<dyn FnOnce(PoolResult<Lease<S>>) + Send + 'static>;

pub(crate) struct AsyncRequest<S: PooledStream> {
    pub(crate) deadline: Option<Instant>,
    pub(crate) callback: ConnectionCallback<S>,
}

pub(crate) struct AsyncQueue<S: PooledStream> {
    pending: VecDeque<AsyncRequest<S>>,
    worker_running: bool,
}

impl<S: PooledStream> Default for AsyncQueue<S> {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
            worker_running: false,
        }
    }
}

const WORKER_THREAD_NAME: &str = "tether-pool-async";

impl<S: PooledStream> PoolInner<S> {
    /// Queue a request for the worker, starting the worker if it is idle.
    /// The request's caller must already be counted in `waiters`.
    pub(crate) fn queue_request(self: &Arc<Self>, request: AsyncRequest<S>) {
        let mut queue = self.requests.lock();
        queue.pending.push_back(request);
        if queue.worker_running {
            self.request_ready.notify_one();
            return;
        }

        let pool = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || pool.run_worker());

        match spawned {
            Ok(_) => queue.worker_running = true,
            Err(err) => {
                error!(target: "tether::pool", "failed to start async worker: {}", err);
                let failed: Vec<AsyncRequest<S>> = queue.pending.drain(..).collect();
                drop(queue);

                let err = PoolError::Worker(Arc::new(err));
                for request in failed {
                    self.unregister_waiter();
                    deliver(request.callback, Err(err.clone()));
                }
            }
        }
    }

    fn run_worker(self: Arc<Self>) {
        debug!(target: "tether::pool", "async worker started for {}", self.endpoint);
        let idle = Duration::from_millis(self.config.async_worker_idle_ms);

        loop {
            let request = {
                let mut queue = self.requests.lock();
                loop {
                    if let Some(request) = queue.pending.pop_front() {
                        break request;
                    }
                    let timed_out = self.request_ready.wait_for(&mut queue, idle).timed_out();
                    if timed_out && queue.pending.is_empty() {
                        queue.worker_running = false;
                        debug!(
                            target: "tether::pool",
                            "async worker for {} idle; exiting",
                            self.endpoint
                        );
                        return;
                    }
                }
            };
            self.serve(request);
        }
    }

    fn serve(&self, request: AsyncRequest<S>) {
        let AsyncRequest { deadline, callback } = request;
        let result = self
            .wait_for_stream(deadline, false)
            .and_then(|checkout| checkout.ok_or(PoolError::Timeout))
            .and_then(|checkout| self.activate(checkout));
        deliver(callback, result);
    }
}

fn deliver<S: PooledStream>(callback: ConnectionCallback<S>, result: PoolResult<Lease<S>>) {
    if catch_unwind(AssertUnwindSafe(|| callback(result))).is_err() {
        warn!(target: "tether::pool", "connection callback panicked; async worker continues");
    }
}
