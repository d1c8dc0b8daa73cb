//! Bounded cross-process FIFO of message handles.
//!
//! The ring lives in its own `/dev/shm/<ns>.<base>` mapping. All mutation
//! happens under the bookkeeper mutex `<base>.mutex`; waiters park on the
//! bookkeeper conditions `<base>.empty_cond` / `<base>.full_cond`, which
//! are valid across the process boundary.
//!
//! Waits are timed ([`axon::consts::WAIT_SLICE_MS`]) and re-check the
//! shutdown token each slice, so a waiter released by
//! [`SharedQueue::wake_up_if_empty`] - or one whose wake was lost to a
//! crashed peer - never blocks indefinitely past shutdown.

use crate::bookkeeper::{Bookkeeper, NamedCondition, NamedMutex};
use crate::error::{IpcError, IpcResult};
use crate::platform::create_or_open_mapping;
use crate::shutdown::ShutdownToken;
use axon::consts::{CACHE_LINE_SIZE, QUEUE_MAGIC, WAIT_SLICE_MS};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const WAIT_SLICE: Duration = Duration::from_millis(WAIT_SLICE_MS);
const RING_START: usize = CACHE_LINE_SIZE;

/// Distinguishes a fresh payload from one being recycled back to its
/// allocating side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum OpTag {
    /// Newly constructed payload.
    NewObject = 0,
    /// Payload travelling back for reuse/teardown by its creator.
    RecycleObject = 1,
}

impl OpTag {
    fn from_raw(raw: u32) -> OpTag {
        match raw {
            1 => OpTag::RecycleObject,
            _ => OpTag::NewObject,
        }
    }
}

/// One queue element: an opaque segment handle plus routing metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueElement {
    /// Opaque offset into the shared segment.
    pub handle: u64,
    /// Message type discriminant (see `axon_common::type_ids`).
    pub type_id: u32,
    /// Transfer tag.
    pub tag: OpTag,
}

#[repr(C)]
struct RawSlot {
    handle: u64,
    type_id: u32,
    op_tag: u32,
}

#[repr(C, align(64))]
struct QueueHeader {
    magic: u64,
    capacity: u64,
    len: u64,
    head: u64,
}

static_assertions::const_assert!(std::mem::size_of::<QueueHeader>() <= RING_START);
static_assertions::const_assert_eq!(std::mem::size_of::<RawSlot>(), 16);

/// Bounded FIFO of message handles in a shared-memory segment.
pub struct SharedQueue {
    qualified_name: String,
    map: memmap2::MmapMut,
    mutex: Option<NamedMutex>,
    empty_cond: Option<NamedCondition>,
    full_cond: Option<NamedCondition>,
    bk: Arc<Bookkeeper>,
    capacity: usize,
    token: ShutdownToken,
}

impl SharedQueue {
    /// Create or attach the queue `<ns>.<base>` with the given capacity.
    pub fn open(
        bk: Arc<Bookkeeper>,
        base: &str,
        capacity: usize,
        token: ShutdownToken,
    ) -> IpcResult<Self> {
        let qualified_name = format!("{}.{}", bk.namespace(), base);
        if capacity == 0 {
            return Err(IpcError::resource_init(&qualified_name, "capacity is 0"));
        }

        let mutex = bk.acquire_named_mutex(&format!("{base}.mutex"))?;
        let empty_cond = bk.acquire_named_condition(&format!("{base}.empty_cond"))?;
        let full_cond = bk.acquire_named_condition(&format!("{base}.full_cond"))?;

        let total = RING_START + capacity * std::mem::size_of::<RawSlot>();
        let (map, created) = create_or_open_mapping(&qualified_name, total)?;

        let queue = Self {
            qualified_name,
            map,
            mutex: Some(mutex),
            empty_cond: Some(empty_cond),
            full_cond: Some(full_cond),
            bk,
            capacity,
            token,
        };

        {
            let _guard = queue.mutex().lock()?;
            let hdr = queue.header_ptr();
            if created {
                unsafe {
                    (*hdr).magic = QUEUE_MAGIC;
                    (*hdr).capacity = capacity as u64;
                    (*hdr).len = 0;
                    (*hdr).head = 0;
                }
                debug!(name = %queue.qualified_name, capacity, "created shared queue");
            } else {
                let (magic, existing) = unsafe { ((*hdr).magic, (*hdr).capacity) };
                if magic != QUEUE_MAGIC {
                    return Err(IpcError::resource_init(
                        &queue.qualified_name,
                        "bad queue magic",
                    ));
                }
                if existing != capacity as u64 {
                    return Err(IpcError::resource_init(
                        &queue.qualified_name,
                        format!("capacity mismatch: queue has {existing}, settings say {capacity}"),
                    ));
                }
                debug!(name = %queue.qualified_name, "attached shared queue");
            }
        }

        Ok(queue)
    }

    fn mutex(&self) -> &NamedMutex {
        self.mutex.as_ref().expect("mutex present until drop")
    }

    fn empty_cond(&self) -> &NamedCondition {
        self.empty_cond.as_ref().expect("cond present until drop")
    }

    fn full_cond(&self) -> &NamedCondition {
        self.full_cond.as_ref().expect("cond present until drop")
    }

    fn header_ptr(&self) -> *mut QueueHeader {
        self.map.as_ptr() as *mut QueueHeader
    }

    fn slot_ptr(&self, index: u64) -> *mut RawSlot {
        unsafe {
            (self.map.as_ptr() as *mut u8)
                .add(RING_START + index as usize * std::mem::size_of::<RawSlot>())
                as *mut RawSlot
        }
    }

    /// Bounded capacity this queue was opened with.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an element, blocking while the queue is full.
    pub fn push_back(&self, element: QueueElement) -> IpcResult<()> {
        let guard = self.mutex().lock()?;
        let hdr = self.header_ptr();
        loop {
            if unsafe { (*hdr).len } < self.capacity as u64 {
                break;
            }
            if self.token.is_cancelled() {
                return Err(IpcError::ShuttingDown);
            }
            self.full_cond().wait_timeout(&guard, WAIT_SLICE)?;
        }

        unsafe {
            let index = ((*hdr).head + (*hdr).len) % self.capacity as u64;
            *self.slot_ptr(index) = RawSlot {
                handle: element.handle,
                type_id: element.type_id,
                op_tag: element.tag as u32,
            };
            (*hdr).len += 1;
            if (*hdr).len == 1 {
                self.empty_cond().signal();
            }
        }
        Ok(())
    }

    /// Remove and return the front element, blocking while empty.
    ///
    /// Returns [`IpcError::ShuttingDown`] if released by a shutdown wake
    /// with the queue still empty.
    pub fn pop_front(&self) -> IpcResult<QueueElement> {
        let guard = self.mutex().lock()?;
        let hdr = self.header_ptr();
        loop {
            if unsafe { (*hdr).len } > 0 {
                break;
            }
            if self.token.is_cancelled() {
                return Err(IpcError::ShuttingDown);
            }
            self.empty_cond().wait_timeout(&guard, WAIT_SLICE)?;
        }
        Ok(self.take_front(hdr))
    }

    /// Remove and return the front element if one is present.
    pub fn try_pop_front(&self) -> IpcResult<Option<QueueElement>> {
        let _guard = self.mutex().lock()?;
        let hdr = self.header_ptr();
        if unsafe { (*hdr).len } == 0 {
            return Ok(None);
        }
        Ok(Some(self.take_front(hdr)))
    }

    fn take_front(&self, hdr: *mut QueueHeader) -> QueueElement {
        unsafe {
            let was_full = (*hdr).len == self.capacity as u64;
            let slot = &*self.slot_ptr((*hdr).head);
            let element = QueueElement {
                handle: slot.handle,
                type_id: slot.type_id,
                tag: OpTag::from_raw(slot.op_tag),
            };
            (*hdr).head = ((*hdr).head + 1) % self.capacity as u64;
            (*hdr).len -= 1;
            if was_full {
                self.full_cond().signal();
            }
            element
        }
    }

    /// Signal "not-empty" with no element present, solely to release a
    /// waiter for cooperative shutdown. The released waiter observes an
    /// empty queue plus the cancelled token and reports
    /// [`IpcError::ShuttingDown`].
    pub fn wake_up_if_empty(&self) {
        // Taking the mutex orders the wake after any in-flight pop's wait
        // registration; waking a non-empty queue is harmless.
        if let Ok(_guard) = self.mutex().lock() {
            self.empty_cond().broadcast();
        }
    }

    /// Release every waiter on both conditions; shutdown path for producers
    /// blocked on a full queue as well as consumers on an empty one.
    pub fn wake_all(&self) {
        if let Ok(_guard) = self.mutex().lock() {
            self.empty_cond().broadcast();
            self.full_cond().broadcast();
        }
    }

    /// Locked snapshot of the current length.
    pub fn size(&self) -> IpcResult<usize> {
        let _guard = self.mutex().lock()?;
        Ok(unsafe { (*self.header_ptr()).len } as usize)
    }

    /// Locked snapshot emptiness check.
    pub fn empty(&self) -> IpcResult<bool> {
        Ok(self.size()? == 0)
    }
}

impl Drop for SharedQueue {
    fn drop(&mut self) {
        if let Some(cond) = self.full_cond.take()
            && let Err(e) = self.bk.release_named_condition(cond)
        {
            warn!(name = %self.qualified_name, error = %e, "failed to release full_cond");
        }
        if let Some(cond) = self.empty_cond.take()
            && let Err(e) = self.bk.release_named_condition(cond)
        {
            warn!(name = %self.qualified_name, error = %e, "failed to release empty_cond");
        }
        if let Some(mutex) = self.mutex.take()
            && let Err(e) = self.bk.release_named_mutex(mutex)
        {
            warn!(name = %self.qualified_name, error = %e, "failed to release queue mutex");
        }
    }
}
