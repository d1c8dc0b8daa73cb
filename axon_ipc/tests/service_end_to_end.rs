//! End-to-end service tests: two services sharing one namespace, exchanging
//! payloads through the real shared-memory substrate.

use axon::ProcessRole;
use axon_ipc::messages::{Ping, RankingReply, RankingRequest};
use axon_ipc::{
    Bookkeeper, Disposition, IpcError, Service, ServiceConfig, SessionParams,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn test_config(namespace: &str, role: ProcessRole) -> ServiceConfig {
    ServiceConfig {
        namespace: namespace.to_string(),
        role,
        queue_capacity: 64,
        slot_size: 256,
        slot_count: 512,
        session: SessionParams {
            interval: Duration::from_millis(20),
            miss_threshold: 25,
        },
        // Default-size pool; same-type deliveries stay ordered regardless.
        recv_workers: 4,
    }
}

fn unique_ns(tag: &str) -> String {
    format!("axon_e2e_{}_{}", std::process::id(), tag)
}

fn cleanup(namespace: &str) {
    if let Ok(bk) = Bookkeeper::new(namespace) {
        bk.reset();
    }
}

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[test]
fn test_pings_delivered_exactly_once_in_order() {
    let ns = unique_ns("pings");
    let total = 1000u64;

    let received = Arc::new(Mutex::new(Vec::<u64>::new()));
    let mut server = Service::new(test_config(&ns, ProcessRole::Server)).unwrap();
    {
        let received = received.clone();
        server
            .add_handler::<Ping, _>(move |ping| {
                received.lock().unwrap().push(ping.id);
                Disposition::Dispose
            })
            .unwrap();
    }
    let mut client = Service::new(test_config(&ns, ProcessRole::Client)).unwrap();

    server.run().unwrap();
    client.run().unwrap();
    server.wait_until_peer_start().unwrap();
    client.wait_until_peer_start().unwrap();

    let helper = client.construct_helper();
    for id in 0..total {
        let ping = helper.construct(Ping { id }).unwrap();
        helper.push_back(ping).unwrap();
    }

    assert!(
        wait_until(Duration::from_secs(10), || received.lock().unwrap().len()
            == total as usize),
        "only {} of {total} pings arrived",
        received.lock().unwrap().len()
    );

    // Exactly once, in send order.
    let received = received.lock().unwrap();
    assert_eq!(*received, (0..total).collect::<Vec<u64>>());

    // The in-queue drained completely.
    assert!(wait_until(Duration::from_secs(2), || {
        server.inbound_backlog().unwrap() == 0
    }));

    client.shutdown();
    server.shutdown();
    cleanup(&ns);
}

#[test]
fn test_request_reply_round_trip() {
    let ns = unique_ns("ranking");

    let mut server = Service::new(test_config(&ns, ProcessRole::Server)).unwrap();
    let mut client = Service::new(test_config(&ns, ProcessRole::Client)).unwrap();

    // The client answers ranking requests; handlers run on pool threads and
    // reply through a helper clone.
    let client_helper = client.construct_helper();
    {
        let helper = client_helper.clone();
        client
            .add_handler::<RankingRequest, _>(move |request| {
                let reply = RankingReply {
                    start_block: request.start_block,
                    end_block: request.end_block,
                    top_score_milli: 987_650,
                    node_count: 42,
                    status: 0,
                };
                if let Ok(owned) = helper.construct(reply) {
                    let _ = helper.push_back(owned);
                }
                Disposition::Dispose
            })
            .unwrap();
    }

    let answer = Arc::new(AtomicU64::new(0));
    {
        let answer = answer.clone();
        server
            .add_handler::<RankingReply, _>(move |reply| {
                assert_eq!(reply.status, 0);
                assert_eq!(reply.start_block, 100);
                assert_eq!(reply.end_block, 200);
                answer.store(reply.top_score_milli, Ordering::SeqCst);
                Disposition::Dispose
            })
            .unwrap();
    }

    server.run().unwrap();
    client.run().unwrap();
    server.wait_until_peer_start().unwrap();
    client.wait_until_peer_start().unwrap();

    let helper = server.construct_helper();
    let request = helper
        .construct(RankingRequest {
            start_block: 100,
            end_block: 200,
        })
        .unwrap();
    helper.push_back(request).unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || answer.load(Ordering::SeqCst)
            == 987_650),
        "no ranking reply arrived"
    );

    client.shutdown();
    server.shutdown();
    cleanup(&ns);
}

#[test]
fn test_shutdown_is_prompt_and_idempotent() {
    let ns = unique_ns("shutdown");

    let mut server = Service::new(test_config(&ns, ProcessRole::Server)).unwrap();
    let mut client = Service::new(test_config(&ns, ProcessRole::Client)).unwrap();
    server.run().unwrap();
    client.run().unwrap();
    server.wait_until_peer_start().unwrap();

    let start = Instant::now();
    server.shutdown();
    server.shutdown();
    assert!(
        start.elapsed() < Duration::from_secs(2),
        "shutdown took {:?}",
        start.elapsed()
    );

    // Helper calls fail fast once the token is cancelled.
    let helper = server.construct_helper();
    assert!(matches!(
        helper.construct(Ping { id: 1 }),
        Err(IpcError::ShuttingDown)
    ));

    client.shutdown();
    cleanup(&ns);
}

#[test]
fn test_peer_silence_cancels_survivor() {
    let ns = unique_ns("silence");

    let mut config = test_config(&ns, ProcessRole::Server);
    config.session.miss_threshold = 8;
    let mut server = Service::new(config).unwrap();

    let mut client_config = test_config(&ns, ProcessRole::Client);
    client_config.session.miss_threshold = 8;
    let mut client = Service::new(client_config).unwrap();

    server.run().unwrap();
    client.run().unwrap();
    server.wait_until_peer_start().unwrap();

    // Kill the client's heartbeat without a clean handover.
    client.shutdown();

    let token = server.shutdown_token();
    assert!(
        wait_until(Duration::from_secs(5), || token.is_cancelled()),
        "survivor never noticed the silent peer"
    );
    assert!(!server.is_peer_alive());

    server.shutdown();
    cleanup(&ns);
}
