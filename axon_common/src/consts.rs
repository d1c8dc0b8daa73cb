//! IPC layout and timing constants.
//!
//! These constants define the fundamental parameters for the AXON
//! shared-memory substrate. They are the single source of truth - all other
//! crates should import from here.

/// Directory holding every AXON shared-memory backing file.
pub const SHM_DIR: &str = "/dev/shm";

/// Default namespace prefix for segment, queue, and primitive names.
///
/// Every backing file is named `<namespace>.<resource>`, so two independent
/// deployments on the same host only need distinct namespaces.
pub const DEFAULT_NAMESPACE: &str = "axon";

/// Memory page size; backing files for named primitives are one page.
pub const PAGE_SIZE: usize = 4096;

/// CPU cache line size in bytes, used to align shared headers so the hot
/// counters of two processes never share a line.
pub const CACHE_LINE_SIZE: usize = 64;

/// Magic tag at the start of every named-primitive backing file.
pub const RESOURCE_MAGIC: u64 = 0x4158_4F4E_5253_4331; // "AXONRSC1"

/// Magic tag at the start of the payload segment.
pub const SEGMENT_MAGIC: u64 = 0x4158_4F4E_5345_4731; // "AXONSEG1"

/// Magic tag at the start of a shared queue mapping.
pub const QUEUE_MAGIC: u64 = 0x4158_4F4E_5155_4531; // "AXONQUE1"

/// Default bounded capacity of each direction's shared queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default size of one payload slot in the shared segment.
///
/// Every message payload must fit in one slot; the registry in
/// [`crate::type_ids`] only admits payloads checked against this bound.
pub const DEFAULT_SLOT_SIZE: usize = 256;

/// Default number of payload slots in the shared segment.
pub const DEFAULT_SLOT_COUNT: usize = 4096;

/// Heartbeat period between the two peer processes.
pub const HEARTBEAT_INTERVAL_MS: u64 = 1000;

/// Consecutive missed heartbeats before the peer is declared dead.
pub const HEARTBEAT_MISS_THRESHOLD: u32 = 8;

/// Upper bound on how long a blocking wait sleeps between shutdown-flag
/// re-checks. A missed wake can therefore never stall a thread longer than
/// this past shutdown.
pub const WAIT_SLICE_MS: u64 = 100;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_fits_in_page() {
        assert!(DEFAULT_SLOT_SIZE <= PAGE_SIZE);
        assert_eq!(PAGE_SIZE % DEFAULT_SLOT_SIZE, 0);
    }

    #[test]
    fn test_magics_are_distinct() {
        assert_ne!(RESOURCE_MAGIC, SEGMENT_MAGIC);
        assert_ne!(SEGMENT_MAGIC, QUEUE_MAGIC);
        assert_ne!(RESOURCE_MAGIC, QUEUE_MAGIC);
    }

    #[test]
    fn test_wait_slice_shorter_than_heartbeat() {
        assert!(WAIT_SLICE_MS < HEARTBEAT_INTERVAL_MS);
    }
}
