//! Linux-specific shared memory operations.
//!
//! All AXON cross-process state lives in files under `/dev/shm`, mapped with
//! `memmap2`. A mapping created here is page-backed tmpfs memory: two
//! processes opening the same path observe the same bytes.

use crate::error::{IpcError, IpcResult};
use axon::consts::SHM_DIR;
use memmap2::{MmapMut, MmapOptions};
use nix::unistd::getpid;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

/// Backing-file path for a namespaced resource name.
pub fn shm_path(name: &str) -> PathBuf {
    PathBuf::from(SHM_DIR).join(name)
}

/// Create the backing file if absent, size it, and map it.
///
/// Returns the mapping plus whether this call created the file. Creation is
/// atomic (`O_CREAT | O_EXCL`), so exactly one of several racing processes
/// observes `created == true` and is responsible for initializing the
/// mapped structure.
pub fn create_or_open_mapping(name: &str, size: usize) -> IpcResult<(MmapMut, bool)> {
    let path = shm_path(name);

    let create_attempt = OpenOptions::new()
        .create_new(true)
        .read(true)
        .write(true)
        .mode(0o600)
        .open(&path);

    match create_attempt {
        Ok(file) => {
            file.set_len(size as u64)
                .map_err(|e| IpcError::resource_init(name, e))?;
            let mmap = unsafe { MmapOptions::new().map_mut(&file) }
                .map_err(|e| IpcError::resource_init(name, e))?;
            Ok((mmap, true))
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            let mmap = open_existing_mapping(name)?;
            Ok((mmap, false))
        }
        Err(e) => Err(IpcError::resource_init(name, e)),
    }
}

/// Map an existing backing file; fails if it does not exist.
pub fn open_existing_mapping(name: &str) -> IpcResult<MmapMut> {
    let path = shm_path(name);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|e| IpcError::resource_init(name, e))?;

    let mmap =
        unsafe { MmapOptions::new().map_mut(&file) }.map_err(|e| IpcError::resource_init(name, e))?;
    Ok(mmap)
}

/// Check if a process is alive using `kill(pid, 0)`.
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // kill(0, ...) would address the process group, not a process.
    if pid == 0 {
        return false;
    }

    // A null signal tests for existence without delivering anything.
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(nix::Error::ESRCH) => false,
        Err(nix::Error::EPERM) => true,
        Err(_) => false,
    }
}

/// Get current process ID.
pub fn current_pid() -> u32 {
    getpid().as_raw() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(name: &str) -> String {
        format!("axon_test_{}_{}", current_pid(), name)
    }

    #[test]
    fn test_create_then_open() {
        let name = unique("platform_create");
        let (mut mmap, created) = create_or_open_mapping(&name, 4096).unwrap();
        assert!(created);
        mmap[0] = 0xA5;

        let (other, created_again) = create_or_open_mapping(&name, 4096).unwrap();
        assert!(!created_again);
        assert_eq!(other[0], 0xA5);

        std::fs::remove_file(shm_path(&name)).unwrap();
    }

    #[test]
    fn test_open_missing_fails() {
        let result = open_existing_mapping(&unique("platform_missing"));
        assert!(matches!(result, Err(IpcError::ResourceInit { .. })));
    }

    #[test]
    fn test_own_process_is_alive() {
        assert!(is_process_alive(current_pid()));
    }
}
