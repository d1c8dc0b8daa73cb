//! Refcounted registry of named OS synchronization primitives.
//!
//! Each named resource is a one-page `/dev/shm/<ns>.<name>` file holding a
//! [`ResourceHeader`] (magic, kind, cross-process refcount) followed by the
//! primitive object itself: a robust process-shared `pthread_mutex_t`, a
//! process-shared `pthread_cond_t`, or an unnamed `sem_t`.
//!
//! Lifetime discipline: a primitive is created on the first acquire of its
//! name and destroyed (object + file) exactly when the last holder releases.
//! Every acquire/release runs under one registry-wide lock so the
//! exists/init/refcount sequence is race-free across processes. That lock is
//! an `flock` on a dedicated lock file rather than a tracked primitive,
//! which sidesteps the bootstrap problem of who would guard the registry's
//! own mutex, and is released by the kernel if a holder crashes.

use crate::error::{IpcError, IpcResult};
use crate::platform::{create_or_open_mapping, shm_path};
use crate::sync;
use axon::consts::{CACHE_LINE_SIZE, PAGE_SIZE, RESOURCE_MAGIC, SHM_DIR};
use memmap2::MmapMut;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Kind tag stored in every resource header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResourceKind {
    /// Robust process-shared mutex.
    Mutex = 1,
    /// Process-shared counting semaphore.
    Semaphore = 2,
    /// Process-shared condition variable.
    Condition = 3,
}

/// Header at the start of every named-primitive backing file.
///
/// The primitive object itself starts at the next cache line.
#[repr(C, align(64))]
struct ResourceHeader {
    magic: u64,
    kind: u32,
    refcount: AtomicU32,
}

const PRIMITIVE_OFFSET: usize = CACHE_LINE_SIZE;

static_assertions::const_assert!(std::mem::size_of::<ResourceHeader>() <= PRIMITIVE_OFFSET);

fn header(map: &MmapMut) -> &ResourceHeader {
    unsafe { &*(map.as_ptr() as *const ResourceHeader) }
}

fn primitive_ptr<T>(map: &MmapMut) -> *mut T {
    unsafe { map.as_ptr().add(PRIMITIVE_OFFSET) as *mut T }
}

/// Owned handle to a named robust mutex.
pub struct NamedMutex {
    name: String,
    map: MmapMut,
}

/// RAII guard for a held [`NamedMutex`]; unlocks on drop.
pub struct SharedGuard<'a> {
    mutex: &'a NamedMutex,
}

impl NamedMutex {
    fn raw(&self) -> *mut libc::pthread_mutex_t {
        primitive_ptr(&self.map)
    }

    /// Lock, recovering the mutex if its previous owner died.
    pub fn lock(&self) -> IpcResult<SharedGuard<'_>> {
        unsafe { sync::mutex_lock(self.raw())? };
        Ok(SharedGuard { mutex: self })
    }

    /// Registry name this handle was acquired under.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        // An unlock failure here means the mutex state is torn; nothing a
        // destructor can do beyond recording it.
        if let Err(e) = unsafe { sync::mutex_unlock(self.mutex.raw()) } {
            warn!(name = %self.mutex.name, error = %e, "failed to unlock shared mutex");
        }
    }
}

/// Owned handle to a named process-shared condition variable.
pub struct NamedCondition {
    name: String,
    map: MmapMut,
}

impl NamedCondition {
    fn raw(&self) -> *mut libc::pthread_cond_t {
        primitive_ptr(&self.map)
    }

    /// Wait for a signal with the paired mutex held, bounded by `timeout`.
    ///
    /// Returns `true` on timeout. The guard must come from the mutex that
    /// consistently pairs with this condition; the substrate pairs
    /// `<base>.mutex` with `<base>.empty_cond` / `<base>.full_cond`.
    pub fn wait_timeout(&self, guard: &SharedGuard<'_>, timeout: Duration) -> IpcResult<bool> {
        unsafe { sync::cond_timedwait(self.raw(), guard.mutex.raw(), timeout) }
    }

    /// Wake one waiter.
    pub fn signal(&self) {
        unsafe { sync::cond_signal(self.raw()) }
    }

    /// Wake every waiter.
    pub fn broadcast(&self) {
        unsafe { sync::cond_broadcast(self.raw()) }
    }

    /// Registry name this handle was acquired under.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Owned handle to a named process-shared semaphore.
pub struct NamedSemaphore {
    name: String,
    map: MmapMut,
}

impl NamedSemaphore {
    fn raw(&self) -> *mut libc::sem_t {
        primitive_ptr(&self.map)
    }

    /// Post one signal.
    pub fn post(&self) -> IpcResult<()> {
        unsafe { sync::sem_post(self.raw()) }
    }

    /// Consume one signal if available, without blocking.
    pub fn try_wait(&self) -> IpcResult<bool> {
        unsafe { sync::sem_trywait(self.raw()) }
    }

    /// Registry name this handle was acquired under.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Refcounting registry governing cross-process lifetime of named
/// primitives.
pub struct Bookkeeper {
    namespace: String,
    lock_file: File,
    // flock is per open-file-description, so it only serializes processes;
    // this serializes acquire/release between threads of this process.
    local: Mutex<()>,
}

impl Bookkeeper {
    /// Open (or create) the registry for a namespace.
    pub fn new(namespace: &str) -> IpcResult<Self> {
        let lock_name = format!("{namespace}.bookkeeper.lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .mode(0o600)
            .open(shm_path(&lock_name))
            .map_err(|e| IpcError::resource_init(&lock_name, e))?;

        Ok(Self {
            namespace: namespace.to_string(),
            lock_file,
            local: Mutex::new(()),
        })
    }

    /// Namespace this registry serves.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn qualified(&self, name: &str) -> String {
        format!("{}.{}", self.namespace, name)
    }

    fn with_table_lock<R>(&self, f: impl FnOnce() -> IpcResult<R>) -> IpcResult<R> {
        let _local = self.local.lock();
        let fd = self.lock_file.as_raw_fd();
        if unsafe { libc::flock(fd, libc::LOCK_EX) } != 0 {
            return Err(IpcError::Io {
                source: std::io::Error::last_os_error(),
            });
        }
        let result = f();
        unsafe { libc::flock(fd, libc::LOCK_UN) };
        result
    }

    /// Create-or-attach a named primitive under the table lock.
    fn acquire_raw(
        &self,
        name: &str,
        kind: ResourceKind,
        init: impl FnOnce(&MmapMut) -> IpcResult<()>,
    ) -> IpcResult<MmapMut> {
        let qualified = self.qualified(name);
        self.with_table_lock(|| {
            let (map, created) = create_or_open_mapping(&qualified, PAGE_SIZE)?;
            if created {
                init(&map)?;
                let hdr = unsafe { &mut *(map.as_ptr() as *mut ResourceHeader) };
                hdr.magic = RESOURCE_MAGIC;
                hdr.kind = kind as u32;
                hdr.refcount = AtomicU32::new(1);
                debug!(name = %qualified, ?kind, "created named primitive");
            } else {
                let hdr = header(&map);
                if hdr.magic != RESOURCE_MAGIC || hdr.kind != kind as u32 {
                    return Err(IpcError::resource_init(
                        &qualified,
                        format!("existing resource is not a {kind:?}"),
                    ));
                }
                let previous = hdr.refcount.fetch_add(1, Ordering::AcqRel);
                debug!(name = %qualified, refcount = previous + 1, "attached named primitive");
            }
            Ok(map)
        })
    }

    /// Decrement under the table lock; destroy and unlink at zero.
    fn release_raw(
        &self,
        name: &str,
        map: MmapMut,
        destroy: impl FnOnce(&MmapMut),
    ) -> IpcResult<()> {
        let qualified = self.qualified(name);
        self.with_table_lock(|| {
            let path = shm_path(&qualified);
            if !path.exists() {
                // Unknown name: already torn down (e.g. by reset); no-op.
                return Ok(());
            }
            let previous = header(&map).refcount.fetch_sub(1, Ordering::AcqRel);
            if previous == 1 {
                destroy(&map);
                drop(map);
                std::fs::remove_file(&path)?;
                debug!(name = %qualified, "destroyed named primitive");
            }
            Ok(())
        })
    }

    /// Acquire a named robust mutex, creating it on first acquire.
    pub fn acquire_named_mutex(&self, name: &str) -> IpcResult<NamedMutex> {
        let map = self.acquire_raw(name, ResourceKind::Mutex, |map| unsafe {
            sync::mutex_init(primitive_ptr(map))
        })?;
        Ok(NamedMutex {
            name: name.to_string(),
            map,
        })
    }

    /// Acquire a named process-shared condition variable.
    pub fn acquire_named_condition(&self, name: &str) -> IpcResult<NamedCondition> {
        let map = self.acquire_raw(name, ResourceKind::Condition, |map| unsafe {
            sync::cond_init(primitive_ptr(map))
        })?;
        Ok(NamedCondition {
            name: name.to_string(),
            map,
        })
    }

    /// Acquire a named process-shared semaphore (initial count zero).
    pub fn acquire_named_semaphore(&self, name: &str) -> IpcResult<NamedSemaphore> {
        let map = self.acquire_raw(name, ResourceKind::Semaphore, |map| unsafe {
            sync::sem_init(primitive_ptr(map))
        })?;
        Ok(NamedSemaphore {
            name: name.to_string(),
            map,
        })
    }

    /// Release a mutex handle; destroys the mutex on last release.
    pub fn release_named_mutex(&self, handle: NamedMutex) -> IpcResult<()> {
        let NamedMutex { name, map } = handle;
        self.release_raw(&name, map, |map| unsafe {
            sync::mutex_destroy(primitive_ptr(map))
        })
    }

    /// Release a condition handle; destroys it on last release.
    pub fn release_named_condition(&self, handle: NamedCondition) -> IpcResult<()> {
        let NamedCondition { name, map } = handle;
        self.release_raw(&name, map, |map| unsafe {
            sync::cond_destroy(primitive_ptr(map))
        })
    }

    /// Release a semaphore handle; destroys it on last release.
    pub fn release_named_semaphore(&self, handle: NamedSemaphore) -> IpcResult<()> {
        let NamedSemaphore { name, map } = handle;
        self.release_raw(&name, map, |map| unsafe {
            sync::sem_destroy(primitive_ptr(map))
        })
    }

    /// Best-effort force-teardown of every file in this namespace.
    ///
    /// Crash-recovery tooling only: takes the table lock opportunistically
    /// and proceeds even when it cannot, because the point of reset is that
    /// a previous holder may have died without releasing anything.
    /// Returns the number of files removed.
    pub fn reset(&self) -> usize {
        let _local = self.local.lock();
        let fd = self.lock_file.as_raw_fd();
        let locked = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) } == 0;
        if !locked {
            warn!(namespace = %self.namespace, "reset proceeding without table lock");
        }

        let prefix = format!("{}.", self.namespace);
        let lock_name = format!("{}.bookkeeper.lock", self.namespace);
        let mut removed = 0;

        if let Ok(entries) = std::fs::read_dir(SHM_DIR) {
            for entry in entries.flatten() {
                let file_name = entry.file_name();
                let Some(name) = file_name.to_str() else {
                    continue;
                };
                if !name.starts_with(&prefix) || name == lock_name {
                    continue;
                }
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => {
                        info!(resource = %name, "reset removed resource");
                        removed += 1;
                    }
                    Err(e) => warn!(resource = %name, error = %e, "reset failed to remove"),
                }
            }
        }

        if locked {
            unsafe { libc::flock(fd, libc::LOCK_UN) };
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::current_pid;
    use std::sync::Arc;

    fn test_bookkeeper(tag: &str) -> Bookkeeper {
        Bookkeeper::new(&format!("axon_test_bk_{}_{}", current_pid(), tag)).unwrap()
    }

    #[test]
    fn test_acquire_release_deletes_file() {
        let bk = test_bookkeeper("lifecycle");
        let m1 = bk.acquire_named_mutex("m").unwrap();
        let m2 = bk.acquire_named_mutex("m").unwrap();
        let path = shm_path(&bk.qualified("m"));
        assert!(path.exists());

        bk.release_named_mutex(m1).unwrap();
        assert!(path.exists());
        bk.release_named_mutex(m2).unwrap();
        assert!(!path.exists());

        // A fresh acquire creates a new object, not a stale reattach.
        let m3 = bk.acquire_named_mutex("m").unwrap();
        assert_eq!(header(&m3.map).refcount.load(Ordering::Acquire), 1);
        bk.release_named_mutex(m3).unwrap();
        bk.reset();
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let bk = test_bookkeeper("kinds");
        let sem = bk.acquire_named_semaphore("shared_name").unwrap();
        let err = bk.acquire_named_mutex("shared_name");
        assert!(matches!(err, Err(IpcError::ResourceInit { .. })));
        bk.release_named_semaphore(sem).unwrap();
        bk.reset();
    }

    #[test]
    fn test_release_unknown_is_noop() {
        let bk = test_bookkeeper("unknown");
        let m = bk.acquire_named_mutex("gone").unwrap();
        // Simulate an out-of-band teardown.
        std::fs::remove_file(shm_path(&bk.qualified("gone"))).unwrap();
        assert!(bk.release_named_mutex(m).is_ok());
        bk.reset();
    }

    #[test]
    fn test_concurrent_refcount_discipline() {
        let bk = Arc::new(test_bookkeeper("concurrent"));
        let threads = 8;
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let bk = bk.clone();
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        let sem = bk.acquire_named_semaphore("contended").unwrap();
                        // Use the primitive to prove it is live while held.
                        sem.post().unwrap();
                        assert!(sem.try_wait().unwrap());
                        bk.release_named_semaphore(sem).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(!shm_path(&bk.qualified("contended")).exists());
        bk.reset();
    }

    #[test]
    fn test_mutex_guard_excludes() {
        let bk = test_bookkeeper("guard");
        let m = Arc::new(bk.acquire_named_mutex("guarded").unwrap());
        let shared = Arc::new(std::sync::atomic::AtomicU64::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = m.clone();
                let shared = shared.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let _guard = m.lock().unwrap();
                        let v = shared.load(Ordering::Relaxed);
                        std::thread::yield_now();
                        shared.store(v + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(shared.load(Ordering::Relaxed), 400);

        let m = Arc::into_inner(m).unwrap();
        bk.release_named_mutex(m).unwrap();
        bk.reset();
    }

    #[test]
    fn test_reset_sweeps_namespace() {
        let bk = test_bookkeeper("reset");
        let _m = bk.acquire_named_mutex("a").unwrap();
        let _c = bk.acquire_named_condition("b").unwrap();
        let removed = bk.reset();
        assert!(removed >= 2);
        assert!(!shm_path(&bk.qualified("a")).exists());
        assert!(!shm_path(&bk.qualified("b")).exists());
    }
}
