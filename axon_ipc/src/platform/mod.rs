//! Platform-specific shared-memory plumbing.

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "linux")]
pub use linux::{
    create_or_open_mapping, current_pid, is_process_alive, open_existing_mapping, shm_path,
};
