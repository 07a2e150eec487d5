//! Arena-backed intrusive timer list.
//!
//! Nodes live in a `Vec` and link to each other by index. Slot 0 is the
//! sentinel: it is both head and tail, so an empty list is a sentinel whose
//! `next` and `prev` point at itself and no link is ever optional. Freed slots
//! are recycled through a free list; each reuse bumps the slot generation so a
//! stale handle can never touch a node it does not own.

/// Callback run by the dispatcher when a timer fires. Receives the tick at
/// which expiry was noticed.
pub type TimerCallback = Box<dyn FnOnce(u32) + Send + 'static>;

const SENTINEL: usize = 0;

/// Lifecycle of a timer node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// Linked into its queue, waiting to expire.
    Ready,
    /// Expired and handed to the dispatcher.
    Fired,
    /// Removed by its owner before expiring.
    Cancelled,
    /// The list head/tail.
    Sentinel,
}

pub(crate) struct Node {
    prev: usize,
    next: usize,
    generation: u64,
    state: TimerState,
    start: u32,
    expiration: u32,
    callback: Option<TimerCallback>,
}

impl Node {
    fn sentinel() -> Self {
        Self {
            prev: SENTINEL,
            next: SENTINEL,
            generation: 0,
            state: TimerState::Sentinel,
            start: 0,
            expiration: 0,
            callback: None,
        }
    }
}

/// Handle to a linked node: slot index plus the generation it was issued at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodeRef {
    pub slot: usize,
    pub generation: u64,
}

/// Expired node removed from the list.
pub(crate) struct Expired {
    pub callback: Option<TimerCallback>,
}

pub(crate) struct TimerList {
    nodes: Vec<Node>,
    free: Vec<usize>,
    len: usize,
}

impl TimerList {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::sentinel()],
            free: Vec::new(),
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes[SENTINEL].next == SENTINEL
    }

    /// Link a new ready node at the tail.
    pub fn push_back(
        &mut self,
        start: u32,
        expiration: u32,
        callback: Option<TimerCallback>,
    ) -> NodeRef {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.nodes.push(Node::sentinel());
                self.nodes.len() - 1
            }
        };

        let tail = self.nodes[SENTINEL].prev;
        let generation = self.nodes[slot].generation.wrapping_add(1);
        self.nodes[slot] = Node {
            prev: tail,
            next: SENTINEL,
            generation,
            state: TimerState::Ready,
            start,
            expiration,
            callback,
        };
        self.nodes[tail].next = slot;
        self.nodes[SENTINEL].prev = slot;
        self.len += 1;

        NodeRef { slot, generation }
    }

    /// State of the node `node` refers to, or `None` once its slot has been
    /// recycled.
    pub fn state(&self, node: NodeRef) -> Option<TimerState> {
        self.nodes
            .get(node.slot)
            .filter(|n| n.generation == node.generation)
            .map(|n| n.state)
    }

    /// Unlink a ready node and mark it cancelled. Returns its callback so the
    /// caller can drop it outside the lock, or `None` if the node was no
    /// longer ready.
    pub fn cancel(&mut self, node: NodeRef) -> Option<Option<TimerCallback>> {
        match self.state(node) {
            Some(TimerState::Ready) => {}
            _ => return None,
        }
        let callback = self.unlink(node.slot, TimerState::Cancelled);
        Some(callback)
    }

    /// Unlink the head if it has expired at `now`. `Err(expiration)` reports
    /// the head's deadline when it is still pending, `Ok(None)` an empty list.
    pub fn pop_expired(
        &mut self,
        now: u32,
        still_pending: impl Fn(u32, u32, u32) -> bool,
    ) -> Result<Option<Expired>, u32> {
        let head = self.nodes[SENTINEL].next;
        if head == SENTINEL {
            return Ok(None);
        }
        let node = &self.nodes[head];
        if still_pending(node.start, node.expiration, now) {
            return Err(node.expiration);
        }
        let callback = self.unlink(head, TimerState::Fired);
        Ok(Some(Expired { callback }))
    }

    fn unlink(&mut self, slot: usize, terminal: TimerState) -> Option<TimerCallback> {
        let (prev, next) = (self.nodes[slot].prev, self.nodes[slot].next);
        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;

        let node = &mut self.nodes[slot];
        node.prev = slot;
        node.next = slot;
        node.state = terminal;
        let callback = node.callback.take();

        self.free.push(slot);
        self.len -= 1;
        callback
    }
}
