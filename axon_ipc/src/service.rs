//! Service composition root.
//!
//! Owns one shared segment, the in/out shared queue pair, the heartbeat
//! session, the operation queue, the construct helper, and the recv
//! dispatcher. `run()` starts three threads:
//!
//! - the **session thread**, exchanging heartbeats with the peer;
//! - the **watcher thread**, looping `pop_front` on the in-queue and
//!   re-packaging each element as a `Recv` operation;
//! - the **drain loop**, the single thread of this process allowed to
//!   mutate segment-resident state, executing exactly one operation per
//!   iteration in arrival order.
//!
//! Shutdown is cooperative: `shutdown()` cancels the process-wide token,
//! fires the explicit wake paired with every blocking site, and joins all
//! threads before returning.

use crate::bookkeeper::Bookkeeper;
use crate::construct::ConstructHelper;
use crate::error::{IpcError, IpcResult};
use crate::messages::Payload;
use crate::meta;
use crate::opqueue::{Operation, OperationQueue};
use crate::platform::current_pid;
use crate::queue::{OpTag, QueueElement, SharedQueue};
use crate::recv::{Disposition, RecvDispatcher};
use crate::segment::SharedSegment;
use crate::session::{Session, SessionParams, SessionRole};
use crate::shutdown::ShutdownToken;
use axon::ProcessRole;
use axon::config::IpcSettings;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, info, warn};

/// Base name of the server-to-client queue.
const QUEUE_S2C: &str = "q_s2c";
/// Base name of the client-to-server queue.
const QUEUE_C2S: &str = "q_c2s";
/// Base name of the heartbeat session.
const SESSION_BASE: &str = "session";
/// Handler threads in the recv pool.
const DEFAULT_RECV_WORKERS: usize = 4;

/// Everything needed to build a [`Service`]. Explicitly constructed and
/// passed in; there is no ambient global context.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Namespace shared by both peers.
    pub namespace: String,
    /// This process's role ([`ProcessRole::Server`] or
    /// [`ProcessRole::Client`]).
    pub role: ProcessRole,
    /// Capacity of each shared queue.
    pub queue_capacity: usize,
    /// Segment slot size in bytes.
    pub slot_size: usize,
    /// Segment slot count.
    pub slot_count: usize,
    /// Heartbeat parameters.
    pub session: SessionParams,
    /// Threads in the recv handler pool.
    pub recv_workers: usize,
}

impl ServiceConfig {
    /// Derive a config from loaded settings plus the process role.
    pub fn from_settings(settings: &IpcSettings, role: ProcessRole) -> Self {
        Self {
            namespace: settings.namespace.clone(),
            role,
            queue_capacity: settings.queue_capacity,
            slot_size: settings.slot_size,
            slot_count: settings.slot_count,
            session: SessionParams {
                interval: std::time::Duration::from_millis(settings.heartbeat_interval_ms),
                miss_threshold: settings.miss_threshold,
            },
            recv_workers: DEFAULT_RECV_WORKERS,
        }
    }
}

/// The per-process IPC runtime.
pub struct Service {
    config: ServiceConfig,
    bk: Arc<Bookkeeper>,
    in_queue: Arc<SharedQueue>,
    out_queue: Arc<SharedQueue>,
    session: Session,
    ops: Arc<OperationQueue>,
    helper: ConstructHelper,
    dispatcher: Option<RecvDispatcher>,
    token: ShutdownToken,
    watcher: Option<JoinHandle<()>>,
    drain: Option<JoinHandle<()>>,
    finished: bool,
}

impl Service {
    /// Open (or create) the namespace's segment, queues, and session.
    ///
    /// Fails with [`IpcError::ResourceInit`] if any shared resource cannot
    /// be built, or if a live process already holds this role.
    pub fn new(config: ServiceConfig) -> IpcResult<Self> {
        let session_role = match config.role {
            ProcessRole::Server => SessionRole::Server,
            ProcessRole::Client => SessionRole::Client,
            ProcessRole::Util => {
                return Err(IpcError::resource_init(
                    &config.namespace,
                    "the util role cannot run a service",
                ));
            }
        };

        let token = ShutdownToken::new();
        let bk = Arc::new(Bookkeeper::new(&config.namespace)?);
        let segment = Arc::new(SharedSegment::open(
            bk.clone(),
            config.slot_size,
            config.slot_count,
        )?);

        let s2c = Arc::new(SharedQueue::open(
            bk.clone(),
            QUEUE_S2C,
            config.queue_capacity,
            token.clone(),
        )?);
        let c2s = Arc::new(SharedQueue::open(
            bk.clone(),
            QUEUE_C2S,
            config.queue_capacity,
            token.clone(),
        )?);
        let (in_queue, out_queue) = match config.role {
            ProcessRole::Server => (c2s, s2c),
            _ => (s2c, c2s),
        };

        let session = Session::open(
            bk.clone(),
            SESSION_BASE,
            session_role,
            config.session.clone(),
            token.clone(),
        )?;

        let ops = Arc::new(OperationQueue::new(token.clone()));
        let helper = ConstructHelper::new(segment.clone(), ops.clone(), token.clone());
        let dispatcher = RecvDispatcher::new(segment.clone(), ops.clone(), config.recv_workers);

        // Pair every blocking site with a wake, so cancellation from any
        // source (session timeout included) releases waiters immediately.
        // Weak references keep the token from pinning the queues alive.
        for queue in [&in_queue, &out_queue] {
            let weak = Arc::downgrade(queue);
            token.register_waker(move || {
                if let Some(queue) = weak.upgrade() {
                    queue.wake_all();
                }
            });
        }
        {
            let weak = Arc::downgrade(&ops);
            token.register_waker(move || {
                if let Some(ops) = weak.upgrade() {
                    ops.wake_up_if_empty();
                }
            });
        }

        // Published last so a failed construction leaves no attachment
        // record behind.
        meta::publish(&config.namespace, config.role, current_pid())?;

        info!(namespace = %config.namespace, role = %config.role, "service constructed");
        Ok(Self {
            config,
            bk,
            in_queue,
            out_queue,
            session,
            ops,
            helper,
            dispatcher: Some(dispatcher),
            token,
            watcher: None,
            drain: None,
            finished: false,
        })
    }

    /// Register the callback for payload type `T`.
    ///
    /// Only valid before [`Service::run`]; the registry is not synchronized
    /// once the drain loop owns it.
    pub fn add_handler<T, F>(&mut self, callback: F) -> IpcResult<()>
    where
        T: Payload,
        F: Fn(&T) -> Disposition + Send + Sync + 'static,
    {
        match self.dispatcher.as_mut() {
            Some(dispatcher) => {
                dispatcher.add_handler::<T, F>(callback);
                Ok(())
            }
            None => Err(IpcError::ServiceNotReady),
        }
    }

    /// Start the session, watcher, and drain threads. Idempotent.
    pub fn run(&mut self) -> IpcResult<()> {
        let Some(dispatcher) = self.dispatcher.take() else {
            return Ok(()); // already running
        };

        self.session.start();

        let watcher = {
            let in_queue = self.in_queue.clone();
            let ops = self.ops.clone();
            std::thread::Builder::new()
                .name("axon-watcher".into())
                .spawn(move || watcher_loop(in_queue, ops))
                .map_err(|e| IpcError::resource_init("watcher thread", e))?
        };

        let drain = {
            let helper = self.helper.clone();
            let out_queue = self.out_queue.clone();
            let ops = self.ops.clone();
            std::thread::Builder::new()
                .name("axon-drain".into())
                .spawn(move || drain_loop(helper, out_queue, ops, dispatcher))
                .map_err(|e| IpcError::resource_init("drain thread", e))?
        };

        self.watcher = Some(watcher);
        self.drain = Some(drain);
        info!(role = %self.config.role, "service running");
        Ok(())
    }

    /// Front door for producers: construct/destroy/publish payloads.
    pub fn construct_helper(&self) -> ConstructHelper {
        self.helper.clone()
    }

    /// Block until the peer's first heartbeat.
    pub fn wait_until_peer_start(&self) -> IpcResult<()> {
        self.session.wait_until_peer_start()
    }

    /// Non-blocking peer liveness, for an external watchdog.
    pub fn is_peer_alive(&self) -> bool {
        self.session.is_peer_alive()
    }

    /// Handle to the process-wide shutdown token.
    pub fn shutdown_token(&self) -> ShutdownToken {
        self.token.clone()
    }

    /// Locked snapshot of the in-queue length, for diagnostics.
    pub fn inbound_backlog(&self) -> IpcResult<usize> {
        self.in_queue.size()
    }

    /// Broadcast the exit signal, wake every blocking site, and join all
    /// threads. Idempotent.
    pub fn shutdown(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        info!(role = %self.config.role, "service shutting down");

        self.token.cancel();
        self.in_queue.wake_all();
        self.out_queue.wake_all();
        self.ops.wake_up_if_empty();
        self.helper.wake_all();

        for thread in [self.watcher.take(), self.drain.take()].into_iter().flatten() {
            if thread.join().is_err() {
                warn!("service thread panicked during shutdown");
            }
        }
        self.session.shutdown();
        self.dispatcher.take();

        meta::remove(&self.config.namespace, self.config.role);
    }

    /// Bookkeeper for this namespace, exposed for cleanup tooling.
    pub fn bookkeeper(&self) -> &Arc<Bookkeeper> {
        &self.bk
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn watcher_loop(in_queue: Arc<SharedQueue>, ops: Arc<OperationQueue>) {
    loop {
        match in_queue.pop_front() {
            Ok(element) => {
                // RecycleObject elements also route through Recv; the
                // dispatcher destroys anything without a handler.
                ops.push_back(Operation::Recv {
                    handle: element.handle,
                    type_id: element.type_id,
                });
            }
            Err(IpcError::ShuttingDown) => break,
            Err(e) => {
                error!(error = %e, "watcher failed to pop in-queue");
                break;
            }
        }
    }
}

fn drain_loop(
    helper: ConstructHelper,
    out_queue: Arc<SharedQueue>,
    ops: Arc<OperationQueue>,
    dispatcher: RecvDispatcher,
) {
    helper.mark_drain_thread();
    let segment = helper.segment().clone();

    while let Some(op) = ops.pop_front() {
        match op {
            Operation::Allocate { ticket, factory } => {
                let result = factory(&segment);
                helper.complete(ticket, result);
            }
            Operation::Recv { handle, type_id } => {
                dispatcher.handle_recv_op(handle, type_id);
            }
            Operation::PushBack { handle, type_id } => {
                let element = QueueElement {
                    handle,
                    type_id,
                    tag: OpTag::NewObject,
                };
                match out_queue.push_back(element) {
                    Ok(()) => {}
                    Err(IpcError::ShuttingDown) => {
                        // Never delivered; reclaim the slot ourselves.
                        if let Err(e) = segment.free(handle) {
                            warn!(handle, error = %e, "failed to reclaim undelivered payload");
                        }
                    }
                    Err(e) => {
                        error!(handle, type_id, error = %e, "push_back failed");
                        let _ = segment.free(handle);
                    }
                }
            }
            Operation::Destroy { handle } => {
                if let Err(e) = segment.free(handle) {
                    warn!(handle, error = %e, "destroy of invalid handle ignored");
                }
            }
        }
    }
}
