//! Error types for the IPC substrate.

use thiserror::Error;

/// Errors that can occur across the shared-memory substrate.
#[derive(Error, Debug)]
pub enum IpcError {
    /// A segment, queue, or named primitive could not be allocated at
    /// construction time. Fatal; startup must abort.
    #[error("resource init failed for {name}: {reason}")]
    ResourceInit {
        /// Name of the resource that failed.
        name: String,
        /// Human-readable cause.
        reason: String,
    },

    /// The peer missed too many consecutive heartbeats.
    #[error("session timeout: peer missed {missed} consecutive heartbeats")]
    SessionTimeout {
        /// Number of intervals the peer was silent for.
        missed: u32,
    },

    /// An operation was attempted before the service started running, or
    /// after it began shutting down.
    #[error("service is not running")]
    ServiceNotReady,

    /// A registered per-type callback panicked while handling a message.
    #[error("handler for type_id {type_id} panicked")]
    HandlerPanic {
        /// Type id of the message being handled.
        type_id: u32,
    },

    /// A message arrived with a type_id nobody registered a handler for.
    #[error("no handler registered for type_id {type_id}")]
    UnknownType {
        /// Offending type id.
        type_id: u32,
    },

    /// A handle failed bounds or alignment checks against the segment.
    #[error("invalid segment handle {handle:#x}")]
    InvalidHandle {
        /// Offending handle value.
        handle: u64,
    },

    /// The payload does not fit in one segment slot.
    #[error("payload of {size} bytes exceeds slot size {slot_size}")]
    PayloadTooLarge {
        /// Requested payload size.
        size: usize,
        /// Configured slot size.
        slot_size: usize,
    },

    /// The segment's slot allocator is exhausted.
    #[error("shared segment is out of free slots")]
    SegmentFull,

    /// A blocking wait was released by the shutdown signal instead of data.
    #[error("shutting down")]
    ShuttingDown,

    /// IO error.
    #[error("IO error: {source}")]
    Io {
        /// Source IO error.
        #[from]
        source: std::io::Error,
    },

    /// Nix system call error.
    #[error("system call error: {source}")]
    Nix {
        /// Source nix error.
        #[from]
        source: nix::Error,
    },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {source}")]
    Json {
        /// Source JSON error.
        #[from]
        source: serde_json::Error,
    },
}

impl IpcError {
    /// Shorthand for a [`IpcError::ResourceInit`] with a formatted reason.
    pub fn resource_init(name: impl Into<String>, reason: impl ToString) -> Self {
        IpcError::ResourceInit {
            name: name.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for IPC operations.
pub type IpcResult<T> = Result<T, IpcError>;
