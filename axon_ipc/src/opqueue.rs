//! In-process operation queue feeding the drain loop.
//!
//! Any thread may enqueue; only the drain loop consumes, one operation per
//! iteration, in arrival order. That total ordering is what makes all
//! shared-segment mutation race-free within a process without a lock around
//! every memory access. Purely local: no shared memory, no cross-process
//! primitives.

use crate::error::IpcResult;
use crate::segment::SharedSegment;
use crate::shutdown::ShutdownToken;
use axon::consts::WAIT_SLICE_MS;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;

/// Factory executed by the drain loop to build a payload in the segment.
pub type AllocFactory = Box<dyn FnOnce(&SharedSegment) -> IpcResult<u64> + Send>;

/// A pending unit of work for the drain loop.
pub enum Operation {
    /// Build an object in the segment on behalf of another thread.
    Allocate {
        /// Completion ticket the requesting thread is blocked on.
        ticket: u64,
        /// Closure performing the allocation and initialization.
        factory: AllocFactory,
    },
    /// Dispatch an object that arrived on the in-queue.
    Recv {
        /// Segment handle of the received object.
        handle: u64,
        /// Message type discriminant.
        type_id: u32,
    },
    /// Publish a locally built object on the out-queue.
    PushBack {
        /// Segment handle of the object.
        handle: u64,
        /// Message type discriminant.
        type_id: u32,
    },
    /// Return an object's slot to the segment allocator.
    Destroy {
        /// Segment handle of the object.
        handle: u64,
    },
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Allocate { ticket, .. } => {
                f.debug_struct("Allocate").field("ticket", ticket).finish()
            }
            Operation::Recv { handle, type_id } => f
                .debug_struct("Recv")
                .field("handle", handle)
                .field("type_id", type_id)
                .finish(),
            Operation::PushBack { handle, type_id } => f
                .debug_struct("PushBack")
                .field("handle", handle)
                .field("type_id", type_id)
                .finish(),
            Operation::Destroy { handle } => {
                f.debug_struct("Destroy").field("handle", handle).finish()
            }
        }
    }
}

/// FIFO bridging arbitrary caller threads to the single drain loop.
pub struct OperationQueue {
    inner: Mutex<VecDeque<Operation>>,
    available: Condvar,
    token: ShutdownToken,
}

impl OperationQueue {
    /// Create an empty queue observing the given shutdown token.
    pub fn new(token: ShutdownToken) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            token,
        }
    }

    /// Enqueue an operation, waking one waiter on the empty-to-one
    /// transition.
    pub fn push_back(&self, op: Operation) {
        let mut queue = self.inner.lock();
        let was_empty = queue.is_empty();
        queue.push_back(op);
        if was_empty {
            self.available.notify_one();
        }
    }

    /// Block until an operation is available or a shutdown wake occurs.
    ///
    /// Returns `None` when released with the queue still empty and the
    /// token cancelled.
    pub fn pop_front(&self) -> Option<Operation> {
        let mut queue = self.inner.lock();
        loop {
            if let Some(op) = queue.pop_front() {
                return Some(op);
            }
            if self.token.is_cancelled() {
                return None;
            }
            self.available
                .wait_for(&mut queue, Duration::from_millis(WAIT_SLICE_MS));
        }
    }

    /// Non-blocking pop.
    pub fn try_pop_front(&self) -> Option<Operation> {
        self.inner.lock().pop_front()
    }

    /// Shutdown wake, mirroring the shared queue's pattern.
    pub fn wake_up_if_empty(&self) {
        let _queue = self.inner.lock();
        self.available.notify_all();
    }

    /// Locked snapshot of the current length.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Locked snapshot emptiness check.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
