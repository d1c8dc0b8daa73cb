//! Per-type dispatch of received payloads onto a worker pool.
//!
//! The drain loop hands each `Recv` operation to the dispatcher, which
//! copies the payload out of the segment and runs the registered callback
//! on a fixed pool of worker threads, so slow handlers never stall the
//! drain loop. A bounded pool replaces the one-thread-per-message spawning
//! this design historically used.
//!
//! Every message of a given type is routed to the same worker, so a type's
//! callbacks run one at a time in queue order; messages of different types
//! stay concurrently in flight on the other workers.
//!
//! Delivery contract: at most once per popped element; the slot is
//! destroyed after the handler returns (normally or by caught panic)
//! unless the handler returns [`Disposition::Retain`].

use crate::error::{IpcError, IpcResult};
use crate::messages::Payload;
use crate::opqueue::{Operation, OperationQueue};
use crate::segment::SharedSegment;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, mpsc};
use std::thread::JoinHandle;
use tracing::{debug, error, warn};

/// What the dispatcher should do with a payload's slot after its handler
/// returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Destroy the slot (the default; handlers own nothing afterwards).
    Dispose,
    /// Keep the slot alive; the handler took responsibility for it.
    Retain,
}

type Job = Box<dyn FnOnce() + Send>;
type ErasedHandler = Arc<dyn Fn(Arc<SharedSegment>, Arc<OperationQueue>, u64) + Send + Sync>;

struct WorkerPool {
    // One queue per worker; a job's lane picks its queue, so jobs sharing a
    // lane run on one thread in submission order.
    senders: Vec<mpsc::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn new(size: usize) -> Self {
        let mut senders = Vec::new();
        let workers = (0..size.max(1))
            .map(|index| {
                let (sender, receiver) = mpsc::channel::<Job>();
                senders.push(sender);
                std::thread::Builder::new()
                    .name(format!("axon-recv-{index}"))
                    .spawn(move || {
                        // Channel closed means the pool is shutting down.
                        while let Ok(job) = receiver.recv() {
                            job();
                        }
                    })
                    .expect("failed to spawn recv worker")
            })
            .collect();
        Self { senders, workers }
    }

    fn execute(&self, lane: u32, job: Job) {
        let Some(sender) = self.senders.get(lane as usize % self.senders.len().max(1)) else {
            warn!(lane, "recv pool closed; dropping job");
            return;
        };
        if sender.send(job).is_err() {
            warn!(lane, "recv pool closed; dropping job");
        }
    }

    fn shutdown(&mut self) {
        self.senders.clear();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("recv worker panicked during shutdown");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Registry of per-type callbacks plus the pool that runs them.
pub struct RecvDispatcher {
    handlers: HashMap<u32, ErasedHandler>,
    pool: WorkerPool,
    segment: Arc<SharedSegment>,
    ops: Arc<OperationQueue>,
}

impl RecvDispatcher {
    /// Build a dispatcher with `workers` handler threads.
    pub fn new(segment: Arc<SharedSegment>, ops: Arc<OperationQueue>, workers: usize) -> Self {
        Self {
            handlers: HashMap::new(),
            pool: WorkerPool::new(workers),
            segment,
            ops,
        }
    }

    /// Register the callback for `T`. Must happen before the service runs;
    /// re-registering a type replaces the previous callback.
    pub fn add_handler<T, F>(&mut self, callback: F)
    where
        T: Payload,
        F: Fn(&T) -> Disposition + Send + Sync + 'static,
    {
        let erased: ErasedHandler = Arc::new(move |segment, ops, handle| {
            run_handler::<T, F>(&callback, segment, ops, handle);
        });
        if self.handlers.insert(T::TYPE_ID, erased).is_some() {
            warn!(type_id = T::TYPE_ID, "replacing existing handler");
        }
    }

    /// True if some handler is registered for `type_id`.
    pub fn has_handler(&self, type_id: u32) -> bool {
        self.handlers.contains_key(&type_id)
    }

    /// Route one received element to its callback on the pool.
    ///
    /// Elements sharing a type id land on the same worker, so each type's
    /// callbacks observe arrival order. Unknown types are logged and their
    /// slot destroyed.
    pub fn handle_recv_op(&self, handle: u64, type_id: u32) {
        let Some(handler) = self.handlers.get(&type_id) else {
            warn!(type_id, handle, "{}", IpcError::UnknownType { type_id });
            self.ops.push_back(Operation::Destroy { handle });
            return;
        };
        let handler = handler.clone();
        let segment = self.segment.clone();
        let ops = self.ops.clone();
        self.pool
            .execute(type_id, Box::new(move || handler(segment, ops, handle)));
    }
}

fn run_handler<T, F>(
    callback: &F,
    segment: Arc<SharedSegment>,
    ops: Arc<OperationQueue>,
    handle: u64,
) where
    T: Payload,
    F: Fn(&T) -> Disposition + Send + Sync,
{
    let value: IpcResult<T> = segment.read(handle);
    let disposition = match value {
        Ok(value) => match catch_unwind(AssertUnwindSafe(|| callback(&value))) {
            Ok(disposition) => disposition,
            Err(_) => {
                // Isolated per message; the drain loop and other in-flight
                // messages are unaffected.
                error!(
                    type_id = T::TYPE_ID,
                    handle,
                    "{}",
                    IpcError::HandlerPanic {
                        type_id: T::TYPE_ID
                    }
                );
                Disposition::Dispose
            }
        },
        Err(e) => {
            error!(type_id = T::TYPE_ID, handle, error = %e, "received unresolvable handle");
            Disposition::Dispose
        }
    };

    match disposition {
        Disposition::Dispose => ops.push_back(Operation::Destroy { handle }),
        Disposition::Retain => debug!(type_id = T::TYPE_ID, handle, "handler retained payload"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bookkeeper::Bookkeeper;
    use crate::messages::Ping;
    use crate::platform::current_pid;
    use crate::shutdown::ShutdownToken;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    struct Fixture {
        bk: Arc<Bookkeeper>,
        segment: Arc<SharedSegment>,
        ops: Arc<OperationQueue>,
    }

    fn fixture(tag: &str) -> Fixture {
        let ns = format!("axon_test_recv_{}_{}", current_pid(), tag);
        let bk = Arc::new(Bookkeeper::new(&ns).unwrap());
        let segment = Arc::new(SharedSegment::open(bk.clone(), 64, 32).unwrap());
        let ops = Arc::new(OperationQueue::new(ShutdownToken::new()));
        Fixture { bk, segment, ops }
    }

    fn stored_ping(fixture: &Fixture, id: u64) -> u64 {
        let handle = fixture.segment.allocate(8).unwrap();
        fixture.segment.write(handle, Ping { id }).unwrap();
        handle
    }

    fn wait_for_destroy(ops: &OperationQueue) -> u64 {
        for _ in 0..100 {
            if let Some(Operation::Destroy { handle }) = ops.try_pop_front() {
                return handle;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("no Destroy enqueued");
    }

    #[test]
    fn test_delivery_and_auto_destroy() {
        let fx = fixture("deliver");
        let seen = Arc::new(AtomicU64::new(0));
        let mut dispatcher = RecvDispatcher::new(fx.segment.clone(), fx.ops.clone(), 2);
        {
            let seen = seen.clone();
            dispatcher.add_handler::<Ping, _>(move |ping| {
                seen.store(ping.id, Ordering::SeqCst);
                Disposition::Dispose
            });
        }

        let handle = stored_ping(&fx, 77);
        dispatcher.handle_recv_op(handle, Ping::TYPE_ID);

        assert_eq!(wait_for_destroy(&fx.ops), handle);
        assert_eq!(seen.load(Ordering::SeqCst), 77);
        fx.bk.reset();
    }

    #[test]
    fn test_unknown_type_dropped_and_destroyed() {
        let fx = fixture("unknown");
        let dispatcher = RecvDispatcher::new(fx.segment.clone(), fx.ops.clone(), 1);
        let handle = stored_ping(&fx, 1);
        dispatcher.handle_recv_op(handle, 0xDEAD);
        assert_eq!(wait_for_destroy(&fx.ops), handle);
        fx.bk.reset();
    }

    #[test]
    fn test_panicking_handler_is_contained() {
        let fx = fixture("panic");
        let mut dispatcher = RecvDispatcher::new(fx.segment.clone(), fx.ops.clone(), 1);
        dispatcher.add_handler::<Ping, _>(|_| panic!("boom"));

        let first = stored_ping(&fx, 1);
        let second = stored_ping(&fx, 2);
        dispatcher.handle_recv_op(first, Ping::TYPE_ID);
        // The pool survives the panic and keeps serving.
        dispatcher.handle_recv_op(second, Ping::TYPE_ID);

        let mut destroyed = vec![wait_for_destroy(&fx.ops), wait_for_destroy(&fx.ops)];
        destroyed.sort_unstable();
        let mut expected = vec![first, second];
        expected.sort_unstable();
        assert_eq!(destroyed, expected);
        fx.bk.reset();
    }

    #[test]
    fn test_same_type_order_survives_multi_worker_pool() {
        // Enough slots for every ping at once; nothing drains the Destroy
        // ops in this fixture.
        let ns = format!("axon_test_recv_{}_order", current_pid());
        let bk = Arc::new(Bookkeeper::new(&ns).unwrap());
        let segment = Arc::new(SharedSegment::open(bk.clone(), 64, 256).unwrap());
        let ops = Arc::new(OperationQueue::new(ShutdownToken::new()));
        let fx = Fixture { bk, segment, ops };
        let total = 200u64;
        let received = Arc::new(std::sync::Mutex::new(Vec::<u64>::new()));

        let mut dispatcher = RecvDispatcher::new(fx.segment.clone(), fx.ops.clone(), 4);
        {
            let received = received.clone();
            dispatcher.add_handler::<Ping, _>(move |ping| {
                // Uneven handler latency would expose any cross-worker race.
                std::thread::sleep(Duration::from_millis(ping.id % 3));
                received.lock().unwrap().push(ping.id);
                Disposition::Dispose
            });
        }

        for id in 0..total {
            let handle = stored_ping(&fx, id);
            dispatcher.handle_recv_op(handle, Ping::TYPE_ID);
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while received.lock().unwrap().len() < total as usize {
            assert!(
                std::time::Instant::now() < deadline,
                "only {} of {total} delivered",
                received.lock().unwrap().len()
            );
            std::thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(*received.lock().unwrap(), (0..total).collect::<Vec<u64>>());
        fx.bk.reset();
    }

    #[test]
    fn test_retain_skips_destroy() {
        let fx = fixture("retain");
        let mut dispatcher = RecvDispatcher::new(fx.segment.clone(), fx.ops.clone(), 1);
        dispatcher.add_handler::<Ping, _>(|_| Disposition::Retain);

        let handle = stored_ping(&fx, 5);
        dispatcher.handle_recv_op(handle, Ping::TYPE_ID);
        std::thread::sleep(Duration::from_millis(50));
        assert!(fx.ops.try_pop_front().is_none());
        fx.bk.reset();
    }
}
