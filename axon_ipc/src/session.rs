//! Heartbeat-based liveness protocol between the two peer processes.
//!
//! Each side owns one bookkeeper semaphore (`<base>.server_sema` /
//! `<base>.client_sema`) and posts a signal on it every interval; the peer
//! try-consumes from the opposite semaphore on the same cadence. A peer
//! that stays silent for `miss_threshold` consecutive intervals is declared
//! dead: the session transitions to its terminal `TimedOut` state and
//! cancels the process-wide shutdown token.
//!
//! The session never respawns a dead peer; an external watchdog polls
//! [`Session::is_peer_alive`] and decides.

use crate::bookkeeper::{Bookkeeper, NamedSemaphore};
use crate::error::{IpcError, IpcResult};
use crate::shutdown::ShutdownToken;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Which end of the heartbeat exchange this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Chain-daemon side: posts `server_sema`, watches `client_sema`.
    Server,
    /// Analytics side: posts `client_sema`, watches `server_sema`.
    Client,
}

/// Liveness state machine, one per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Heartbeat thread not yet started.
    NotStarted = 0,
    /// Running, peer's first signal not yet observed.
    Started = 1,
    /// Peer observed alive.
    Established = 2,
    /// Peer declared dead. Terminal.
    TimedOut = 3,
}

impl SessionState {
    fn from_raw(raw: u8) -> SessionState {
        match raw {
            1 => SessionState::Started,
            2 => SessionState::Established,
            3 => SessionState::TimedOut,
            _ => SessionState::NotStarted,
        }
    }
}

struct SessionShared {
    state: AtomicU8,
    peer_alive: AtomicBool,
    miss_count: AtomicU32,
}

/// Tunable heartbeat parameters; defaults match the protocol contract.
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// Heartbeat period.
    pub interval: Duration,
    /// Consecutive misses before the peer is declared dead.
    pub miss_threshold: u32,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(axon::consts::HEARTBEAT_INTERVAL_MS),
            miss_threshold: axon::consts::HEARTBEAT_MISS_THRESHOLD,
        }
    }
}

/// Heartbeat session between a server-role and a client-role process.
pub struct Session {
    role: SessionRole,
    base: String,
    bk: Arc<Bookkeeper>,
    own: Option<Arc<NamedSemaphore>>,
    peer: Option<Arc<NamedSemaphore>>,
    shared: Arc<SessionShared>,
    params: SessionParams,
    token: ShutdownToken,
    thread: Option<JoinHandle<()>>,
}

impl Session {
    /// Acquire both heartbeat semaphores for `<base>` in the given role.
    pub fn open(
        bk: Arc<Bookkeeper>,
        base: &str,
        role: SessionRole,
        params: SessionParams,
        token: ShutdownToken,
    ) -> IpcResult<Self> {
        let server_sema = Arc::new(bk.acquire_named_semaphore(&format!("{base}.server_sema"))?);
        let client_sema = Arc::new(bk.acquire_named_semaphore(&format!("{base}.client_sema"))?);

        let (own, peer) = match role {
            SessionRole::Server => (server_sema, client_sema),
            SessionRole::Client => (client_sema, server_sema),
        };

        Ok(Self {
            role,
            base: base.to_string(),
            bk,
            own: Some(own),
            peer: Some(peer),
            shared: Arc::new(SessionShared {
                state: AtomicU8::new(SessionState::NotStarted as u8),
                peer_alive: AtomicBool::new(false),
                miss_count: AtomicU32::new(0),
            }),
            params,
            token,
            thread: None,
        })
    }

    /// Spawn the heartbeat thread. Idempotent after the first call.
    pub fn start(&mut self) {
        if self.thread.is_some() {
            return;
        }
        self.shared
            .state
            .store(SessionState::Started as u8, Ordering::Release);

        let own = self.own.clone().expect("own sema present until drop");
        let peer = self.peer.clone().expect("peer sema present until drop");
        let shared = self.shared.clone();
        let params = self.params.clone();
        let token = self.token.clone();
        let role = self.role;

        info!(role = ?role, base = %self.base, "session heartbeat starting");
        self.thread = Some(std::thread::spawn(move || {
            heartbeat_loop(role, own, peer, shared, params, token);
        }));
    }

    /// Block until the peer's first heartbeat is observed.
    ///
    /// Returns [`IpcError::ShuttingDown`] if the token cancels first, and
    /// [`IpcError::SessionTimeout`] if the session times out while waiting.
    pub fn wait_until_peer_start(&self) -> IpcResult<()> {
        let slice = self.params.interval.min(Duration::from_millis(20));
        loop {
            match self.state() {
                SessionState::Established => return Ok(()),
                SessionState::TimedOut => {
                    return Err(IpcError::SessionTimeout {
                        missed: self.shared.miss_count.load(Ordering::Acquire),
                    });
                }
                _ => {}
            }
            if self.token.is_cancelled() {
                return Err(IpcError::ShuttingDown);
            }
            std::thread::sleep(slice);
        }
    }

    /// Non-blocking liveness read for an external watchdog.
    pub fn is_peer_alive(&self) -> bool {
        self.shared.peer_alive.load(Ordering::Acquire)
    }

    /// Current state-machine state.
    pub fn state(&self) -> SessionState {
        SessionState::from_raw(self.shared.state.load(Ordering::Acquire))
    }

    /// Join the heartbeat thread. The token must already be cancelled.
    pub fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take()
            && let Err(e) = thread.join()
        {
            warn!(base = %self.base, "heartbeat thread panicked: {e:?}");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // The heartbeat thread only exits on cancellation; dropping the
        // session means this process is tearing down its IPC.
        self.token.cancel();
        self.shutdown();
        for sema in [self.own.take(), self.peer.take()].into_iter().flatten() {
            match Arc::into_inner(sema) {
                Some(sema) => {
                    if let Err(e) = self.bk.release_named_semaphore(sema) {
                        warn!(base = %self.base, error = %e, "failed to release session semaphore");
                    }
                }
                None => warn!(base = %self.base, "session semaphore still referenced at drop"),
            }
        }
    }
}

fn heartbeat_loop(
    role: SessionRole,
    own: Arc<NamedSemaphore>,
    peer: Arc<NamedSemaphore>,
    shared: Arc<SessionShared>,
    params: SessionParams,
    token: ShutdownToken,
) {
    let slice = params.interval.min(Duration::from_millis(50));

    while !token.is_cancelled() {
        // Consume at most one pending peer signal per interval; a burst
        // after a scheduling stall must not mask later silence.
        match peer.try_wait() {
            Ok(true) => {
                shared.miss_count.store(0, Ordering::Release);
                shared.peer_alive.store(true, Ordering::Release);
                if SessionState::from_raw(shared.state.load(Ordering::Acquire))
                    != SessionState::Established
                {
                    info!(role = ?role, "peer heartbeat established");
                }
                shared
                    .state
                    .store(SessionState::Established as u8, Ordering::Release);
            }
            Ok(false) => {
                let missed = shared.miss_count.fetch_add(1, Ordering::AcqRel) + 1;
                debug!(role = ?role, missed, "missed peer heartbeat");
                if missed >= params.miss_threshold {
                    shared.peer_alive.store(false, Ordering::Release);
                    shared
                        .state
                        .store(SessionState::TimedOut as u8, Ordering::Release);
                    error!(
                        role = ?role,
                        missed,
                        "{}",
                        IpcError::SessionTimeout { missed }
                    );
                    token.cancel();
                    return;
                }
            }
            Err(e) => {
                warn!(role = ?role, error = %e, "heartbeat probe failed");
            }
        }

        if let Err(e) = own.post() {
            warn!(role = ?role, error = %e, "heartbeat post failed");
        }

        // Sleep one interval in token-aware slices.
        let mut remaining = params.interval;
        while !remaining.is_zero() && !token.is_cancelled() {
            let nap = remaining.min(slice);
            std::thread::sleep(nap);
            remaining = remaining.saturating_sub(nap);
        }
    }
}
