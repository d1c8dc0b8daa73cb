//! # AXON Shared-Memory IPC
//!
//! Cross-process message substrate between the AXON chain daemon (server
//! role) and its analytics sidecar (client role). All shared state lives in
//! files under `/dev/shm`: POSIX process-shared primitives managed by a
//! refcounting [`Bookkeeper`], one slot-allocated payload [`SharedSegment`],
//! and a bounded [`SharedQueue`] per direction carrying opaque handles
//! instead of payload bytes.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────┐      /dev/shm       ┌──────────────────┐
//! │  chain daemon    │   ┌─────────────┐   │ analytics sidecar│
//! │  (server role)   │   │  segment    │   │  (client role)   │
//! │                  │   │ [slots...]  │   │                  │
//! │ ConstructHelper ─┼──►│             │◄──┼─ ConstructHelper │
//! │                  │   ├─────────────┤   │                  │
//! │    out-queue ────┼──►│   q_s2c     ├──►│──── in-queue     │
//! │     in-queue ◄───┼───┤   q_c2s     │◄──┼──── out-queue    │
//! │                  │   ├─────────────┤   │                  │
//! │     Session ◄────┼──►│ heartbeats  │◄──┼────► Session     │
//! └──────────────────┘   └─────────────┘   └──────────────────┘
//! ```
//!
//! Inside each process a [`Service`] runs a watcher thread (pops the
//! in-queue) and a single drain thread (sole mutator of segment state,
//! executing [`Operation`]s in arrival order); received payloads are
//! dispatched per type id onto a bounded worker pool.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use axon_ipc::{Disposition, Service, ServiceConfig};
//! use axon_ipc::messages::Ping;
//! use axon::ProcessRole;
//! use axon::config::IpcSettings;
//!
//! # fn main() -> axon_ipc::IpcResult<()> {
//! let settings = IpcSettings::default();
//! let mut service = Service::new(ServiceConfig::from_settings(&settings, ProcessRole::Server))?;
//! service.add_handler::<Ping, _>(|ping| {
//!     println!("ping {}", ping.id);
//!     Disposition::Dispose
//! })?;
//! service.run()?;
//!
//! let helper = service.construct_helper();
//! let ping = helper.construct(Ping { id: 1 })?;
//! helper.push_back(ping)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Crash Robustness
//!
//! - Bookkeeper mutexes are `PTHREAD_MUTEX_ROBUST`; a lock orphaned by a
//!   dying process is recovered with `pthread_mutex_consistent`.
//! - The bookkeeper registry itself is guarded by an `flock`-held lock
//!   file, which the kernel releases on any exit.
//! - Heartbeat silence past the miss threshold cancels the process-wide
//!   [`ShutdownToken`], and every blocking wait re-checks that token on a
//!   timed slice.
//!
//! ## Thread Safety
//!
//! - [`ConstructHelper`] and [`ShutdownToken`] are cheap clones, usable from
//!   any thread.
//! - [`SharedQueue`] and [`SharedSegment`] are internally synchronized via
//!   bookkeeper primitives and safe to share behind `Arc`.
//! - [`Service::add_handler`] is only valid before [`Service::run`].

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod bookkeeper;
pub mod construct;
pub mod error;
pub mod messages;
pub mod meta;
pub mod opqueue;
pub mod platform;
pub mod queue;
pub mod recv;
pub mod segment;
pub mod service;
pub mod session;
pub mod shutdown;
pub mod sync;

pub use bookkeeper::{Bookkeeper, NamedCondition, NamedMutex, NamedSemaphore, ResourceKind};
pub use construct::{ConstructHelper, Owned};
pub use error::{IpcError, IpcResult};
pub use messages::Payload;
pub use opqueue::{Operation, OperationQueue};
pub use queue::{OpTag, QueueElement, SharedQueue};
pub use recv::{Disposition, RecvDispatcher};
pub use segment::SharedSegment;
pub use service::{Service, ServiceConfig};
pub use session::{Session, SessionParams, SessionRole, SessionState};
pub use shutdown::ShutdownToken;
