//! Raw process-shared synchronization primitives.
//!
//! Thin unsafe wrappers over `pthread_mutex_t` / `pthread_cond_t` /
//! `sem_t` objects that live inside a shared mapping. Mutexes are created
//! `PTHREAD_MUTEX_ROBUST`: if the owning process dies inside a critical
//! section, the next locker observes `EOWNERDEAD`, marks the state
//! consistent, and proceeds instead of deadlocking the peer.
//!
//! Callers must guarantee the pointee lives in memory shared by every
//! participating process and outlives all use; the [`crate::bookkeeper`]
//! handle types are the only intended callers.

use crate::error::{IpcError, IpcResult};
use std::io;
use std::time::Duration;

fn os_err(code: i32) -> IpcError {
    IpcError::Io {
        source: io::Error::from_raw_os_error(code),
    }
}

/// Initialize a robust, process-shared mutex in place.
///
/// # Safety
/// `mutex` must point to uninitialized, writable memory inside a shared
/// mapping, aligned for `pthread_mutex_t`.
pub unsafe fn mutex_init(mutex: *mut libc::pthread_mutex_t) -> IpcResult<()> {
    unsafe {
        let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
        let rc = libc::pthread_mutexattr_init(&mut attr);
        if rc != 0 {
            return Err(os_err(rc));
        }
        libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST);
        let rc = libc::pthread_mutex_init(mutex, &attr);
        libc::pthread_mutexattr_destroy(&mut attr);
        if rc != 0 {
            return Err(os_err(rc));
        }
    }
    Ok(())
}

/// Lock a shared mutex, recovering it if the previous owner died.
///
/// # Safety
/// `mutex` must point to a mutex initialized by [`mutex_init`].
pub unsafe fn mutex_lock(mutex: *mut libc::pthread_mutex_t) -> IpcResult<()> {
    unsafe {
        match libc::pthread_mutex_lock(mutex) {
            0 => Ok(()),
            libc::EOWNERDEAD => {
                // Previous owner crashed mid-section; the protected state is
                // a fixed-layout header that is always valid, so recover.
                let rc = libc::pthread_mutex_consistent(mutex);
                if rc != 0 { Err(os_err(rc)) } else { Ok(()) }
            }
            rc => Err(os_err(rc)),
        }
    }
}

/// Unlock a shared mutex.
///
/// # Safety
/// The calling thread must currently hold `mutex`.
pub unsafe fn mutex_unlock(mutex: *mut libc::pthread_mutex_t) -> IpcResult<()> {
    let rc = unsafe { libc::pthread_mutex_unlock(mutex) };
    if rc != 0 { Err(os_err(rc)) } else { Ok(()) }
}

/// Destroy a shared mutex. Last-release only.
///
/// # Safety
/// No thread in any process may hold or wait on `mutex`.
pub unsafe fn mutex_destroy(mutex: *mut libc::pthread_mutex_t) {
    unsafe {
        libc::pthread_mutex_destroy(mutex);
    }
}

/// Initialize a process-shared condition variable on the monotonic clock.
///
/// # Safety
/// Same placement requirements as [`mutex_init`].
pub unsafe fn cond_init(cond: *mut libc::pthread_cond_t) -> IpcResult<()> {
    unsafe {
        let mut attr: libc::pthread_condattr_t = std::mem::zeroed();
        let rc = libc::pthread_condattr_init(&mut attr);
        if rc != 0 {
            return Err(os_err(rc));
        }
        libc::pthread_condattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        libc::pthread_condattr_setclock(&mut attr, libc::CLOCK_MONOTONIC);
        let rc = libc::pthread_cond_init(cond, &attr);
        libc::pthread_condattr_destroy(&mut attr);
        if rc != 0 {
            return Err(os_err(rc));
        }
    }
    Ok(())
}

/// Wait on `cond` with `mutex` held, for at most `timeout`.
///
/// Returns `Ok(true)` on timeout, `Ok(false)` on wakeup. In both cases the
/// mutex is held again on return; an `EOWNERDEAD` on re-acquisition is
/// recovered like in [`mutex_lock`].
///
/// # Safety
/// The calling thread must hold `mutex`; both pointers must be initialized
/// shared primitives.
pub unsafe fn cond_timedwait(
    cond: *mut libc::pthread_cond_t,
    mutex: *mut libc::pthread_mutex_t,
    timeout: Duration,
) -> IpcResult<bool> {
    unsafe {
        let mut now: libc::timespec = std::mem::zeroed();
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut now);

        let nanos = now.tv_nsec as u64 + timeout.subsec_nanos() as u64;
        let abstime = libc::timespec {
            tv_sec: now.tv_sec + timeout.as_secs() as libc::time_t + (nanos / 1_000_000_000) as libc::time_t,
            tv_nsec: (nanos % 1_000_000_000) as libc::c_long,
        };

        match libc::pthread_cond_timedwait(cond, mutex, &abstime) {
            0 => Ok(false),
            libc::ETIMEDOUT => Ok(true),
            libc::EOWNERDEAD => {
                let rc = libc::pthread_mutex_consistent(mutex);
                if rc != 0 { Err(os_err(rc)) } else { Ok(false) }
            }
            rc => Err(os_err(rc)),
        }
    }
}

/// Wake one waiter.
///
/// # Safety
/// `cond` must be an initialized shared condition variable.
pub unsafe fn cond_signal(cond: *mut libc::pthread_cond_t) {
    unsafe {
        libc::pthread_cond_signal(cond);
    }
}

/// Wake every waiter.
///
/// # Safety
/// `cond` must be an initialized shared condition variable.
pub unsafe fn cond_broadcast(cond: *mut libc::pthread_cond_t) {
    unsafe {
        libc::pthread_cond_broadcast(cond);
    }
}

/// Destroy a shared condition variable. Last-release only.
///
/// # Safety
/// No thread in any process may wait on `cond`.
pub unsafe fn cond_destroy(cond: *mut libc::pthread_cond_t) {
    unsafe {
        libc::pthread_cond_destroy(cond);
    }
}

/// Initialize a process-shared semaphore with an initial count of zero.
///
/// # Safety
/// Same placement requirements as [`mutex_init`].
pub unsafe fn sem_init(sem: *mut libc::sem_t) -> IpcResult<()> {
    let rc = unsafe { libc::sem_init(sem, 1, 0) };
    if rc != 0 {
        return Err(IpcError::Io {
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Post one signal.
///
/// # Safety
/// `sem` must be an initialized shared semaphore.
pub unsafe fn sem_post(sem: *mut libc::sem_t) -> IpcResult<()> {
    let rc = unsafe { libc::sem_post(sem) };
    if rc != 0 {
        return Err(IpcError::Io {
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Consume one signal without blocking. Returns whether one was available.
///
/// # Safety
/// `sem` must be an initialized shared semaphore.
pub unsafe fn sem_trywait(sem: *mut libc::sem_t) -> IpcResult<bool> {
    let rc = unsafe { libc::sem_trywait(sem) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EAGAIN) {
        Ok(false)
    } else {
        Err(IpcError::Io { source: err })
    }
}

/// Destroy a shared semaphore. Last-release only.
///
/// # Safety
/// No process may be blocked on `sem`.
pub unsafe fn sem_destroy(sem: *mut libc::sem_t) {
    unsafe {
        libc::sem_destroy(sem);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Primitives are exercised through Box-pinned storage here; cross-process
    // placement is covered by the bookkeeper tests.

    #[test]
    fn test_mutex_lock_unlock() {
        let mut storage: libc::pthread_mutex_t = unsafe { std::mem::zeroed() };
        let mutex = &mut storage as *mut _;
        unsafe {
            mutex_init(mutex).unwrap();
            mutex_lock(mutex).unwrap();
            mutex_unlock(mutex).unwrap();
            mutex_destroy(mutex);
        }
    }

    #[test]
    fn test_cond_timedwait_times_out() {
        let mut mutex_storage: libc::pthread_mutex_t = unsafe { std::mem::zeroed() };
        let mut cond_storage: libc::pthread_cond_t = unsafe { std::mem::zeroed() };
        let mutex = &mut mutex_storage as *mut _;
        let cond = &mut cond_storage as *mut _;
        unsafe {
            mutex_init(mutex).unwrap();
            cond_init(cond).unwrap();
            mutex_lock(mutex).unwrap();
            let timed_out = cond_timedwait(cond, mutex, Duration::from_millis(10)).unwrap();
            assert!(timed_out);
            mutex_unlock(mutex).unwrap();
            cond_destroy(cond);
            mutex_destroy(mutex);
        }
    }

    #[test]
    fn test_sem_counts() {
        let mut storage: libc::sem_t = unsafe { std::mem::zeroed() };
        let sem = &mut storage as *mut _;
        unsafe {
            sem_init(sem).unwrap();
            assert!(!sem_trywait(sem).unwrap());
            sem_post(sem).unwrap();
            sem_post(sem).unwrap();
            assert!(sem_trywait(sem).unwrap());
            assert!(sem_trywait(sem).unwrap());
            assert!(!sem_trywait(sem).unwrap());
            sem_destroy(sem);
        }
    }
}
