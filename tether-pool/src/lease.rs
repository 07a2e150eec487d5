//! Checkout tokens and per-stream bookkeeping slots.
//!
//! Every stream the pool owns has a [`Slot`] in the pool's object list. While
//! a caller holds the stream through a [`Lease`], the slot is empty. A lease
//! dropped without being returned parks its stream in the slot, where an
//! emancipation scan can find it and put it back into circulation. Once the
//! owning pool is gone there is nothing left to reclaim it, so the lease
//! disposes of the stream instead.

use crate::stream::PooledStream;
use parking_lot::Mutex;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tether_log::debug;

/// Identity of one pool, shared by the slots of every stream it creates.
#[derive(Debug, Default)]
pub(crate) struct PoolTag {
    closed: AtomicBool,
}

impl PoolTag {
    /// Mark the pool as gone. Streams parked after this point are disposed
    /// by the lease that parked them.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Bookkeeping entry for one stream owned by the pool.
pub(crate) struct Slot<S> {
    pub(crate) id: u64,
    owner: Arc<PoolTag>,
    abandoned: Mutex<Option<S>>,
}

impl<S> Slot<S> {
    pub(crate) fn new(id: u64, owner: &Arc<PoolTag>) -> Arc<Self> {
        Arc::new(Self {
            id,
            owner: Arc::clone(owner),
            abandoned: Mutex::new(None),
        })
    }

    /// Take a parked stream without blocking. A slot whose lock is contended
    /// is skipped.
    pub(crate) fn try_take_abandoned(&self) -> Option<S> {
        self.abandoned.try_lock().and_then(|mut parked| parked.take())
    }

    /// Take a parked stream, blocking on the slot lock.
    pub(crate) fn take_abandoned(&self) -> Option<S> {
        self.abandoned.lock().take()
    }

    fn park(&self, stream: S) {
        *self.abandoned.lock() = Some(stream);
    }
}

/// A stream at rest in, or on its way through, the pool.
pub(crate) struct Idle<S> {
    pub(crate) slot: Arc<Slot<S>>,
    pub(crate) stream: S,
}

/// Exclusive use of a pooled stream.
///
/// Return it with [`crate::ConnectionPool::put_connection`]. Dropping a lease
/// instead leaves the stream abandoned: the pool reclaims it the next time it
/// runs out of capacity. A lease that outlives its pool disposes of the
/// stream when dropped.
pub struct Lease<S: PooledStream> {
    stream: Option<S>,
    slot: Arc<Slot<S>>,
    fresh: bool,
}

impl<S: PooledStream> Lease<S> {
    pub(crate) fn new(idle: Idle<S>, fresh: bool) -> Self {
        Self {
            stream: Some(idle.stream),
            slot: idle.slot,
            fresh,
        }
    }

    /// Whether the stream was created for this checkout rather than reused.
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    /// Identifier of the stream's bookkeeping slot, stable across checkouts.
    pub fn id(&self) -> u64 {
        self.slot.id
    }

    /// Whether the lease was handed out by the pool identified by `owner`.
    pub(crate) fn belongs_to(&self, owner: &Arc<PoolTag>) -> bool {
        Arc::ptr_eq(&self.slot.owner, owner)
    }

    pub(crate) fn into_idle(mut self) -> Option<Idle<S>> {
        let stream = self.stream.take()?;
        Some(Idle {
            slot: Arc::clone(&self.slot),
            stream,
        })
    }
}

impl<S: PooledStream> Deref for Lease<S> {
    type Target = S;

    fn deref(&self) -> &S {
        match &self.stream {
            Some(stream) => stream,
            None => unreachable!("lease stream is only taken when the lease is consumed"),
        }
    }
}

impl<S: PooledStream> DerefMut for Lease<S> {
    fn deref_mut(&mut self) -> &mut S {
        match &mut self.stream {
            Some(stream) => stream,
            None => unreachable!("lease stream is only taken when the lease is consumed"),
        }
    }
}

impl<S: PooledStream> Drop for Lease<S> {
    fn drop(&mut self) {
        let Some(stream) = self.stream.take() else {
            return;
        };
        self.slot.park(stream);

        // The pool drains parked streams when it drops; whichever side takes
        // the stream first disposes of it.
        if self.slot.owner.is_closed() {
            if let Some(mut stream) = self.slot.take_abandoned() {
                stream.dispose();
                debug!(
                    target: "tether::pool",
                    "lease {} dropped after its pool was gone; stream disposed",
                    self.slot.id
                );
            }
        } else {
            debug!(
                target: "tether::pool",
                "lease {} dropped without being returned; stream parked for reclaim",
                self.slot.id
            );
        }
    }
}

impl<S: PooledStream> fmt::Debug for Lease<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.slot.id)
            .field("fresh", &self.fresh)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy(u32);
    impl PooledStream for Dummy {}

    struct Counted(Arc<AtomicBool>);
    impl PooledStream for Counted {
        fn dispose(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_dropped_lease_parks_stream() {
        let owner = Arc::new(PoolTag::default());
        let slot = Slot::new(7, &owner);
        let lease = Lease::new(
            Idle {
                slot: Arc::clone(&slot),
                stream: Dummy(42),
            },
            true,
        );
        assert_eq!(lease.0, 42);
        assert_eq!(lease.id(), 7);
        drop(lease);

        let parked = slot.try_take_abandoned().unwrap();
        assert_eq!(parked.0, 42);
        assert!(slot.try_take_abandoned().is_none());
    }

    #[test]
    fn test_consumed_lease_parks_nothing() {
        let owner = Arc::new(PoolTag::default());
        let slot = Slot::new(1, &owner);
        let lease = Lease::new(
            Idle {
                slot: Arc::clone(&slot),
                stream: Dummy(1),
            },
            false,
        );
        let idle = lease.into_idle().unwrap();
        assert_eq!(idle.stream.0, 1);
        assert!(slot.take_abandoned().is_none());
    }

    #[test]
    fn test_contended_slot_is_skipped() {
        let slot: Arc<Slot<Dummy>> = Slot::new(3, &Arc::new(PoolTag::default()));
        slot.park(Dummy(9));
        let _held = slot.abandoned.lock();
        assert!(slot.try_take_abandoned().is_none());
    }

    #[test]
    fn test_lease_dropped_after_pool_closed_disposes() {
        let owner = Arc::new(PoolTag::default());
        let slot = Slot::new(5, &owner);
        let disposed = Arc::new(AtomicBool::new(false));
        let lease = Lease::new(
            Idle {
                slot: Arc::clone(&slot),
                stream: Counted(Arc::clone(&disposed)),
            },
            true,
        );

        owner.close();
        drop(lease);

        assert!(disposed.load(Ordering::SeqCst));
        assert!(slot.take_abandoned().is_none());
    }

    #[test]
    fn test_lease_ownership() {
        let owner = Arc::new(PoolTag::default());
        let other = Arc::new(PoolTag::default());
        let lease = Lease::new(
            Idle {
                slot: Slot::new(2, &owner),
                stream: Dummy(0),
            },
            false,
        );
        assert!(lease.belongs_to(&owner));
        assert!(!lease.belongs_to(&other));
    }
}
