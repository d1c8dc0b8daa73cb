//! Shared payload segment and slot allocator.
//!
//! One mapping per namespace (`<ns>.segment`) holds every message payload
//! exchanged between the two processes. The data area is a fixed array of
//! equally sized slots threaded onto an intrusive free list; allocation and
//! free are O(1) list operations under the bookkeeper mutex
//! `segment.mutex`, so both processes may allocate concurrently.
//!
//! Handles are opaque byte offsets from the segment base - never pointers.
//! A handle is only meaningful together with a process's own mapping, and
//! [`SharedSegment::resolve`] is the single place that turns one into a
//! typed pointer, after bounds and alignment checks.

use crate::bookkeeper::{Bookkeeper, NamedMutex};
use crate::error::{IpcError, IpcResult};
use crate::platform::create_or_open_mapping;
use axon::consts::{PAGE_SIZE, SEGMENT_MAGIC};
use std::sync::Arc;
use tracing::{debug, warn};

/// Registry name of the allocator mutex.
const SEGMENT_MUTEX: &str = "segment.mutex";
/// Resource name of the segment mapping (qualified by the namespace).
const SEGMENT_RESOURCE: &str = "segment";

/// Offset of the slot array; one page keeps slots page-aligned and leaves
/// the header its own cache lines.
const DATA_START: u64 = PAGE_SIZE as u64;

#[repr(C, align(64))]
struct SegmentHeader {
    magic: u64,
    slot_size: u64,
    slot_count: u64,
    /// Offset of the first free slot; 0 means exhausted.
    free_head: u64,
    in_use: u64,
}

static_assertions::const_assert!(std::mem::size_of::<SegmentHeader>() <= PAGE_SIZE);

/// Shared-memory payload segment, attachable from both processes.
pub struct SharedSegment {
    qualified_name: String,
    map: memmap2::MmapMut,
    mutex: Option<NamedMutex>,
    bk: Arc<Bookkeeper>,
    slot_size: usize,
    slot_count: usize,
}

impl SharedSegment {
    /// Create or attach the namespace's segment.
    ///
    /// The creating process initializes the header and free list; an
    /// attaching process verifies geometry against its own settings.
    pub fn open(bk: Arc<Bookkeeper>, slot_size: usize, slot_count: usize) -> IpcResult<Self> {
        let qualified_name = format!("{}.{}", bk.namespace(), SEGMENT_RESOURCE);
        if slot_size < 8 || slot_size % 8 != 0 {
            return Err(IpcError::resource_init(
                &qualified_name,
                "slot_size must be a multiple of 8 and at least 8",
            ));
        }
        if slot_count == 0 {
            return Err(IpcError::resource_init(&qualified_name, "slot_count is 0"));
        }

        let mutex = bk.acquire_named_mutex(SEGMENT_MUTEX)?;
        let total = PAGE_SIZE + slot_size * slot_count;
        let (map, created) = create_or_open_mapping(&qualified_name, total)?;

        let segment = Self {
            qualified_name,
            map,
            mutex: Some(mutex),
            bk,
            slot_size,
            slot_count,
        };

        {
            // Initialization and geometry checks run under the allocator
            // mutex so an attacher cannot observe a half-built free list.
            let _guard = segment.mutex().lock()?;
            let hdr = segment.header_ptr();
            if created {
                unsafe {
                    (*hdr).magic = SEGMENT_MAGIC;
                    (*hdr).slot_size = slot_size as u64;
                    (*hdr).slot_count = slot_count as u64;
                    (*hdr).in_use = 0;
                }
                segment.init_free_list();
                debug!(name = %segment.qualified_name, slot_size, slot_count, "created segment");
            } else {
                let (magic, existing_size, existing_count) =
                    unsafe { ((*hdr).magic, (*hdr).slot_size, (*hdr).slot_count) };
                if magic != SEGMENT_MAGIC {
                    return Err(IpcError::resource_init(
                        &segment.qualified_name,
                        "bad segment magic",
                    ));
                }
                if existing_size != slot_size as u64 || existing_count != slot_count as u64 {
                    return Err(IpcError::resource_init(
                        &segment.qualified_name,
                        format!(
                            "geometry mismatch: segment has {existing_count}x{existing_size}, \
                             settings say {slot_count}x{slot_size}"
                        ),
                    ));
                }
                debug!(name = %segment.qualified_name, "attached segment");
            }
        }

        Ok(segment)
    }

    fn mutex(&self) -> &NamedMutex {
        self.mutex.as_ref().expect("mutex present until drop")
    }

    fn header_ptr(&self) -> *mut SegmentHeader {
        self.map.as_ptr() as *mut SegmentHeader
    }

    fn slot_ptr(&self, offset: u64) -> *mut u8 {
        unsafe { (self.map.as_ptr() as *mut u8).add(offset as usize) }
    }

    fn init_free_list(&self) {
        let hdr = self.header_ptr();
        for i in 0..self.slot_count as u64 {
            let offset = DATA_START + i * self.slot_size as u64;
            let next = if i + 1 < self.slot_count as u64 {
                offset + self.slot_size as u64
            } else {
                0
            };
            unsafe { *(self.slot_ptr(offset) as *mut u64) = next };
        }
        unsafe { (*hdr).free_head = DATA_START };
    }

    /// Configured slot size in bytes.
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Slots currently allocated (locked snapshot).
    pub fn in_use(&self) -> IpcResult<usize> {
        let _guard = self.mutex().lock()?;
        Ok(unsafe { (*self.header_ptr()).in_use } as usize)
    }

    /// Allocate one slot for a payload of `size` bytes.
    pub fn allocate(&self, size: usize) -> IpcResult<u64> {
        if size > self.slot_size {
            return Err(IpcError::PayloadTooLarge {
                size,
                slot_size: self.slot_size,
            });
        }
        let _guard = self.mutex().lock()?;
        let hdr = self.header_ptr();
        let handle = unsafe { (*hdr).free_head };
        if handle == 0 {
            return Err(IpcError::SegmentFull);
        }
        unsafe {
            (*hdr).free_head = *(self.slot_ptr(handle) as *const u64);
            (*hdr).in_use += 1;
        }
        Ok(handle)
    }

    /// Return a slot to the free list.
    pub fn free(&self, handle: u64) -> IpcResult<()> {
        self.check_handle(handle)?;
        let _guard = self.mutex().lock()?;
        let hdr = self.header_ptr();
        unsafe {
            *(self.slot_ptr(handle) as *mut u64) = (*hdr).free_head;
            (*hdr).free_head = handle;
            (*hdr).in_use -= 1;
        }
        Ok(())
    }

    fn check_handle(&self, handle: u64) -> IpcResult<()> {
        let end = DATA_START + (self.slot_size * self.slot_count) as u64;
        let in_range = handle >= DATA_START && handle < end;
        let aligned = in_range && (handle - DATA_START) % self.slot_size as u64 == 0;
        if !aligned {
            return Err(IpcError::InvalidHandle { handle });
        }
        Ok(())
    }

    /// Resolve an opaque handle to a typed pointer into this process's
    /// mapping. Valid only while the segment is mapped; callers copy data
    /// out rather than retaining the pointer.
    pub fn resolve<T>(&self, handle: u64) -> IpcResult<*mut T> {
        self.check_handle(handle)?;
        if std::mem::size_of::<T>() > self.slot_size {
            return Err(IpcError::PayloadTooLarge {
                size: std::mem::size_of::<T>(),
                slot_size: self.slot_size,
            });
        }
        // The concrete address must satisfy T's alignment; slot_size is only
        // required to be a multiple of 8, so a wider-aligned T can land on a
        // slot boundary the type cannot live at.
        let ptr = self.slot_ptr(handle);
        if (ptr as usize) % std::mem::align_of::<T>() != 0 {
            return Err(IpcError::InvalidHandle { handle });
        }
        Ok(ptr as *mut T)
    }

    /// Copy a value into an allocated slot.
    pub fn write<T: Copy>(&self, handle: u64, value: T) -> IpcResult<()> {
        let ptr = self.resolve::<T>(handle)?;
        unsafe { ptr.write(value) };
        Ok(())
    }

    /// Copy a value out of a slot.
    pub fn read<T: Copy>(&self, handle: u64) -> IpcResult<T> {
        let ptr = self.resolve::<T>(handle)?;
        Ok(unsafe { ptr.read() })
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        if let Some(mutex) = self.mutex.take()
            && let Err(e) = self.bk.release_named_mutex(mutex)
        {
            warn!(name = %self.qualified_name, error = %e, "failed to release segment mutex");
        }
        // The backing file persists for reattach after restart; the util
        // role's reset removes it.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::current_pid;

    fn test_segment(tag: &str, slot_size: usize, slot_count: usize) -> SharedSegment {
        let ns = format!("axon_test_seg_{}_{}", current_pid(), tag);
        let bk = Arc::new(Bookkeeper::new(&ns).unwrap());
        SharedSegment::open(bk, slot_size, slot_count).unwrap()
    }

    fn teardown(segment: SharedSegment) {
        let bk = segment.bk.clone();
        drop(segment);
        bk.reset();
    }

    #[test]
    fn test_allocate_write_read_free() {
        let segment = test_segment("rw", 64, 8);

        let handle = segment.allocate(std::mem::size_of::<u64>()).unwrap();
        segment.write::<u64>(handle, 0xDEAD_BEEF).unwrap();
        assert_eq!(segment.read::<u64>(handle).unwrap(), 0xDEAD_BEEF);
        assert_eq!(segment.in_use().unwrap(), 1);

        segment.free(handle).unwrap();
        assert_eq!(segment.in_use().unwrap(), 0);
        teardown(segment);
    }

    #[test]
    fn test_exhaustion_and_reuse() {
        let segment = test_segment("full", 64, 4);

        let handles: Vec<u64> = (0..4).map(|_| segment.allocate(8).unwrap()).collect();
        assert!(matches!(segment.allocate(8), Err(IpcError::SegmentFull)));

        segment.free(handles[2]).unwrap();
        let again = segment.allocate(8).unwrap();
        assert_eq!(again, handles[2]);
        teardown(segment);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let segment = test_segment("oversize", 64, 4);
        assert!(matches!(
            segment.allocate(65),
            Err(IpcError::PayloadTooLarge { .. })
        ));
        teardown(segment);
    }

    #[test]
    fn test_bogus_handles_rejected() {
        let segment = test_segment("handles", 64, 4);
        for bogus in [0u64, 17, DATA_START + 1, DATA_START + 64 * 4] {
            assert!(matches!(
                segment.resolve::<u64>(bogus),
                Err(IpcError::InvalidHandle { .. })
            ));
        }
        teardown(segment);
    }

    #[test]
    fn test_resolve_rejects_misaligned_type() {
        #[repr(C, align(16))]
        #[derive(Clone, Copy)]
        struct Wide([u8; 16]);

        // slot_size 24 is a legal geometry, but every odd slot sits at an
        // 8-mod-16 offset from the page-aligned base, where a 16-aligned
        // type cannot live.
        let segment = test_segment("align", 24, 8);
        let first = segment.allocate(16).unwrap();
        let second = segment.allocate(16).unwrap();
        assert_eq!(first, DATA_START);
        assert_eq!(second, DATA_START + 24);

        assert!(segment.resolve::<Wide>(first).is_ok());
        assert!(matches!(
            segment.resolve::<Wide>(second),
            Err(IpcError::InvalidHandle { .. })
        ));
        teardown(segment);
    }

    #[test]
    fn test_two_attachments_share_slots() {
        let ns = format!("axon_test_seg_{}_shared", current_pid());
        let bk_a = Arc::new(Bookkeeper::new(&ns).unwrap());
        let bk_b = Arc::new(Bookkeeper::new(&ns).unwrap());
        let a = SharedSegment::open(bk_a, 64, 8).unwrap();
        let b = SharedSegment::open(bk_b, 64, 8).unwrap();

        let handle = a.allocate(8).unwrap();
        a.write::<u64>(handle, 42).unwrap();
        assert_eq!(b.read::<u64>(handle).unwrap(), 42);
        assert_eq!(b.in_use().unwrap(), 1);

        b.free(handle).unwrap();
        assert_eq!(a.in_use().unwrap(), 0);

        let bk = a.bk.clone();
        drop(a);
        drop(b);
        bk.reset();
    }

    #[test]
    fn test_geometry_mismatch_rejected() {
        let ns = format!("axon_test_seg_{}_geometry", current_pid());
        let bk = Arc::new(Bookkeeper::new(&ns).unwrap());
        let first = SharedSegment::open(bk.clone(), 64, 8).unwrap();
        let second = SharedSegment::open(bk.clone(), 128, 8);
        assert!(matches!(second, Err(IpcError::ResourceInit { .. })));
        teardown(first);
    }
}
