//! Cooperative cancellation token.
//!
//! Every blocking site in the substrate observes one process-wide token
//! instead of a bare atomic flag: waiters re-check the token on a bounded
//! interval, and `cancel()` additionally fires every registered waker so a
//! parked thread is released immediately rather than at the next re-check.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

type Waker = Box<dyn Fn() + Send + Sync>;

struct TokenInner {
    cancelled: AtomicBool,
    wakers: Mutex<Vec<Waker>>,
}

/// Cloneable handle to the process-wide shutdown signal.
#[derive(Clone)]
pub struct ShutdownToken {
    inner: Arc<TokenInner>,
}

impl ShutdownToken {
    /// Create a fresh, un-cancelled token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                wakers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Non-blocking check, safe from any thread.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Signal shutdown and run every registered waker. Idempotent; wakers
    /// fire only on the first call.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        for waker in self.inner.wakers.lock().iter() {
            waker();
        }
    }

    /// Register a wake callback paired with a blocking site.
    ///
    /// If the token is already cancelled the waker fires immediately.
    pub fn register_waker(&self, waker: impl Fn() + Send + Sync + 'static) {
        if self.is_cancelled() {
            waker();
            return;
        }
        self.inner.wakers.lock().push(Box::new(waker));
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ShutdownToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_cancel_is_idempotent() {
        let token = ShutdownToken::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        token.register_waker(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!token.is_cancelled());
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_late_waker_fires_immediately() {
        let token = ShutdownToken::new();
        token.cancel();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        token.register_waker(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clones_share_state() {
        let token = ShutdownToken::new();
        let other = token.clone();
        other.cancel();
        assert!(token.is_cancelled());
    }
}
