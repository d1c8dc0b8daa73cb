//! Shared-memory object construction routed through the drain loop.
//!
//! Every physical segment allocation in a process happens on exactly one
//! thread - the drain loop - while `construct` stays a synchronous call on
//! any thread: a non-drain caller enqueues an `Allocate` operation carrying
//! a completion ticket and a factory closure, then blocks on a local
//! condition variable until the drain loop has executed precisely that
//! ticket and recorded its result.

use crate::error::{IpcError, IpcResult};
use crate::messages::Payload;
use crate::opqueue::{Operation, OperationQueue};
use crate::segment::SharedSegment;
use crate::shutdown::ShutdownToken;
use axon::consts::WAIT_SLICE_MS;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::thread::ThreadId;
use std::time::Duration;
use tracing::warn;

/// Owning reference to a payload slot in the shared segment.
///
/// Dropping an `Owned` enqueues a `Destroy` for its slot; publishing it via
/// [`ConstructHelper::push_back`] transfers ownership to the out-queue (and
/// ultimately to the peer process) instead.
pub struct Owned<T: Payload> {
    handle: u64,
    segment: Arc<SharedSegment>,
    ops: Arc<OperationQueue>,
    _marker: PhantomData<T>,
}

impl<T: Payload> Owned<T> {
    /// Opaque segment handle of the slot.
    pub fn handle(&self) -> u64 {
        self.handle
    }

    /// Copy the payload out of the segment.
    pub fn read(&self) -> IpcResult<T> {
        self.segment.read(self.handle)
    }

    /// Overwrite the payload in place.
    pub fn write(&self, value: T) -> IpcResult<()> {
        self.segment.write(self.handle, value)
    }

    fn into_handle(self) -> u64 {
        let this = std::mem::ManuallyDrop::new(self);
        this.handle
    }
}

impl<T: Payload> Drop for Owned<T> {
    fn drop(&mut self) {
        self.ops.push_back(Operation::Destroy {
            handle: self.handle,
        });
    }
}

impl<T: Payload> std::fmt::Debug for Owned<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Owned")
            .field("handle", &self.handle)
            .field("type_id", &T::TYPE_ID)
            .finish()
    }
}

struct HelperInner {
    segment: Arc<SharedSegment>,
    ops: Arc<OperationQueue>,
    drain_thread: OnceLock<ThreadId>,
    ready: AtomicBool,
    next_ticket: AtomicU64,
    /// `None` = still pending; `Some(result)` = completed by the drain loop.
    pending: Mutex<HashMap<u64, Option<IpcResult<u64>>>>,
    completed: Condvar,
    token: ShutdownToken,
}

/// Cloneable front door for segment construction/destruction requests.
#[derive(Clone)]
pub struct ConstructHelper {
    inner: Arc<HelperInner>,
}

impl ConstructHelper {
    /// Build a helper over the process's segment and operation queue.
    pub fn new(
        segment: Arc<SharedSegment>,
        ops: Arc<OperationQueue>,
        token: ShutdownToken,
    ) -> Self {
        Self {
            inner: Arc::new(HelperInner {
                segment,
                ops,
                drain_thread: OnceLock::new(),
                ready: AtomicBool::new(false),
                next_ticket: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                completed: Condvar::new(),
                token,
            }),
        }
    }

    /// Record the drain loop's thread and open the helper for business.
    /// Called once from the drain loop itself as it starts.
    pub(crate) fn mark_drain_thread(&self) {
        let _ = self.inner.drain_thread.set(std::thread::current().id());
        self.inner.ready.store(true, Ordering::Release);
    }

    /// Release every blocked `construct` caller during shutdown.
    pub(crate) fn wake_all(&self) {
        let _pending = self.inner.pending.lock();
        self.inner.completed.notify_all();
    }

    fn check_ready(&self) -> IpcResult<()> {
        if self.inner.token.is_cancelled() {
            return Err(IpcError::ShuttingDown);
        }
        if !self.inner.ready.load(Ordering::Acquire) {
            return Err(IpcError::ServiceNotReady);
        }
        Ok(())
    }

    fn on_drain_thread(&self) -> bool {
        self.inner.drain_thread.get() == Some(&std::thread::current().id())
    }

    /// Construct a payload in the shared segment.
    ///
    /// On the drain-loop thread this allocates directly; on any other
    /// thread it blocks until the drain loop has executed the request and
    /// returns exactly that result.
    pub fn construct<T: Payload>(&self, value: T) -> IpcResult<Owned<T>> {
        self.check_ready()?;

        let handle = if self.on_drain_thread() {
            allocate_in(&self.inner.segment, value)?
        } else {
            let ticket = self.inner.next_ticket.fetch_add(1, Ordering::AcqRel);
            self.inner.pending.lock().insert(ticket, None);
            self.inner.ops.push_back(Operation::Allocate {
                ticket,
                factory: Box::new(move |segment| allocate_in(segment, value)),
            });
            self.wait_for(ticket)?
        };

        Ok(Owned {
            handle,
            segment: self.inner.segment.clone(),
            ops: self.inner.ops.clone(),
            _marker: PhantomData,
        })
    }

    fn wait_for(&self, ticket: u64) -> IpcResult<u64> {
        let mut pending = self.inner.pending.lock();
        loop {
            match pending.get(&ticket) {
                Some(Some(_)) => {
                    // Completed; take the recorded result.
                    return pending
                        .remove(&ticket)
                        .flatten()
                        .expect("checked completed above");
                }
                Some(None) => {}
                None => return Err(IpcError::ShuttingDown),
            }
            if self.inner.token.is_cancelled() {
                pending.remove(&ticket);
                return Err(IpcError::ShuttingDown);
            }
            self.inner
                .completed
                .wait_for(&mut pending, Duration::from_millis(WAIT_SLICE_MS));
        }
    }

    /// Record a ticket's result; drain-loop side of the rendezvous.
    pub(crate) fn complete(&self, ticket: u64, result: IpcResult<u64>) {
        let mut pending = self.inner.pending.lock();
        if pending.insert(ticket, Some(result)).is_none() {
            // Requester already gave up (shutdown); reclaim the slot.
            if let Some(Some(Ok(handle))) = pending.remove(&ticket) {
                warn!(ticket, handle, "completing abandoned construct request");
                self.inner.ops.push_back(Operation::Destroy { handle });
            }
            return;
        }
        self.inner.completed.notify_all();
    }

    /// Queue a slot for deallocation by the drain loop. Fire-and-forget.
    pub fn destroy(&self, handle: u64) -> IpcResult<()> {
        self.check_ready()?;
        self.inner.ops.push_back(Operation::Destroy { handle });
        Ok(())
    }

    /// Publish a constructed payload on the out-queue.
    ///
    /// Ownership of the slot transfers to the queue; the consuming process
    /// destroys it after its handler runs.
    pub fn push_back<T: Payload>(&self, owned: Owned<T>) -> IpcResult<()> {
        self.check_ready()?;
        let handle = owned.into_handle();
        self.inner.ops.push_back(Operation::PushBack {
            handle,
            type_id: T::TYPE_ID,
        });
        Ok(())
    }

    /// Segment shared with the drain loop; used by the service executor.
    pub(crate) fn segment(&self) -> &Arc<SharedSegment> {
        &self.inner.segment
    }
}

fn allocate_in<T: Payload>(segment: &SharedSegment, value: T) -> IpcResult<u64> {
    let handle = segment.allocate(std::mem::size_of::<T>())?;
    segment.write(handle, value)?;
    Ok(handle)
}
