//! End-to-end tests of two rpc servers talking over real UDP sockets on localhost.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::timeout;

use peerlink::config::RpcConfig;
use peerlink::crypto::Identity;
use peerlink::rpc::connection::RpcHandler;
use peerlink::rpc::server::RpcServer;
use peerlink::wire::rpc_id::RpcId;


/// answers every "PING" request with "PONG" and records everything it sees
struct PingPongHandler {
    server: Mutex<Option<Arc<RpcServer>>>,
    requests: Mutex<Vec<Bytes>>,
    replies: Mutex<Vec<Bytes>>,
    reply_arrived: Notify,
}

impl PingPongHandler {
    fn new() -> Arc<PingPongHandler> {
        Arc::new(PingPongHandler {
            server: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            replies: Mutex::new(Vec::new()),
            reply_arrived: Notify::new(),
        })
    }
}

#[async_trait]
impl RpcHandler for PingPongHandler {
    async fn on_request(&self, peer: &str, id: RpcId, payload: Bytes) {
        self.requests.lock().unwrap().push(payload.clone());

        let server = self.server.lock().unwrap().clone().unwrap();
        let reply = if payload.as_ref() == b"PING" { Bytes::from_static(b"PONG") } else { payload };
        server.reply(peer, id, reply).await.unwrap();
    }

    async fn on_reply(&self, _peer: &str, _id: RpcId, payload: Bytes) {
        self.replies.lock().unwrap().push(payload);
        self.reply_arrived.notify_one();
    }
}

struct TestNode {
    server: Arc<RpcServer>,
    handler: Arc<PingPongHandler>,
    identity_seed: u8,
}

async fn start_node(seed: u8, config: RpcConfig) -> TestNode {
    let handler = PingPongHandler::new();
    let server = RpcServer::bind(
        config,
        Identity::from_seed([seed; 32]),
        "127.0.0.1:0".parse().unwrap(),
        handler.clone(),
    ).await.unwrap();
    *handler.server.lock().unwrap() = Some(server.clone());

    let driver = server.clone();
    tokio::spawn(async move { driver.run().await });

    TestNode { server, handler, identity_seed: seed }
}

async fn link(a: &TestNode, b: &TestNode) {
    a.server.add_peer(Identity::from_seed([b.identity_seed; 32]).public_key(), b.server.local_addr(), [])
        .await.unwrap();
    b.server.add_peer(Identity::from_seed([a.identity_seed; 32]).public_key(), a.server.local_addr(), [])
        .await.unwrap();

    timeout(Duration::from_secs(10), async {
        while !a.server.all_ready().await || !b.server.all_ready().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }).await.expect("handshake did not complete in time");
}

async fn await_replies(node: &TestNode, n: usize) {
    timeout(Duration::from_secs(30), async {
        while node.handler.replies.lock().unwrap().len() < n {
            node.handler.reply_arrived.notified().await;
        }
    }).await.expect("replies did not arrive in time");
}

#[tokio::test]
async fn test_ping_pong() {
    let a = start_node(1, RpcConfig::new()).await;
    let b = start_node(2, RpcConfig::new()).await;
    link(&a, &b).await;

    a.server.request(&b.server.public_key_hex(), Bytes::from_static(b"PING")).await.unwrap();
    await_replies(&a, 1).await;

    assert_eq!(a.handler.replies.lock().unwrap().as_slice(), &[Bytes::from_static(b"PONG")]);
    assert_eq!(b.handler.requests.lock().unwrap().as_slice(), &[Bytes::from_static(b"PING")]);
}

#[tokio::test]
async fn test_volley_completes_exactly_once() {
    let a = start_node(3, RpcConfig::new()).await;
    let b = start_node(4, RpcConfig::new()).await;
    link(&a, &b).await;

    const VOLLEY: usize = 100;
    let key_b = b.server.public_key_hex();
    for i in 0..VOLLEY {
        a.server.request(&key_b, Bytes::from(format!("msg {}", i))).await.unwrap();
    }
    await_replies(&a, VOLLEY).await;

    let mut replies: Vec<Bytes> = a.handler.replies.lock().unwrap().clone();
    replies.sort();
    replies.dedup();
    assert_eq!(replies.len(), VOLLEY, "every request answered, no reply surfaced twice");
}

/// Both directions drop 30% of all inbound datagrams; heartbeat-driven retransmission must
///  still complete every request exactly once, including the handshake itself.
#[tokio::test]
async fn test_lossy_network_converges() {
    let mut config = RpcConfig::new();
    config.simulated_receive_loss = 0.3;
    config.heartbeat_interval = Duration::from_millis(20);

    let a = start_node(5, config.clone()).await;
    let b = start_node(6, config).await;
    link(&a, &b).await;

    const VOLLEY: usize = 20;
    let key_b = b.server.public_key_hex();
    for i in 0..VOLLEY {
        a.server.request(&key_b, Bytes::from(format!("msg {}", i))).await.unwrap();
    }
    await_replies(&a, VOLLEY).await;

    assert_eq!(a.handler.replies.lock().unwrap().len(), VOLLEY);

    let mut requests: Vec<Bytes> = b.handler.requests.lock().unwrap().clone();
    requests.sort();
    requests.dedup();
    assert_eq!(requests.len(), VOLLEY, "duplicates are filtered before the application");
}

/// The configured primary endpoint is dead; the connection must fail over to the alternative
///  and complete the handshake there.
#[tokio::test]
async fn test_failover_to_alternative_endpoint() {
    let mut config = RpcConfig::new();
    config.endpoint_liveness_timeout = Duration::from_millis(200);
    config.heartbeat_interval = Duration::from_millis(20);

    let a = start_node(7, config.clone()).await;
    let b = start_node(8, config).await;

    let dead_endpoint = "127.0.0.1:9".parse().unwrap();
    a.server.add_peer(Identity::from_seed([8; 32]).public_key(), dead_endpoint, [b.server.local_addr()])
        .await.unwrap();
    b.server.add_peer(Identity::from_seed([7; 32]).public_key(), a.server.local_addr(), [])
        .await.unwrap();

    timeout(Duration::from_secs(10), async {
        while !a.server.ready_to_send(&b.server.public_key_hex()).await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }).await.expect("failover handshake did not complete in time");

    a.server.request(&b.server.public_key_hex(), Bytes::from_static(b"PING")).await.unwrap();
    await_replies(&a, 1).await;
}

/// Requests of a later barrier must not reach the peer before all earlier-barrier requests are
///  answered, even though they are submitted immediately.
#[tokio::test]
async fn test_barrier_ordering_across_the_wire() {
    let a = start_node(9, RpcConfig::new()).await;
    let b = start_node(10, RpcConfig::new()).await;
    link(&a, &b).await;

    let key_b = b.server.public_key_hex();
    let conn = a.server.connection(&key_b).await.unwrap();

    for round in 0..5 {
        conn.request(Bytes::from(format!("round {}", round))).await;
        conn.advance_barrier().await;
    }
    await_replies(&a, 5).await;

    let requests = b.handler.requests.lock().unwrap().clone();
    let expected: Vec<Bytes> = (0..5).map(|r| Bytes::from(format!("round {}", r))).collect();
    assert_eq!(requests, expected, "barriers arrive strictly in submission order");
}

#[tokio::test]
async fn test_broadcast_reaches_all_ready_peers() {
    let a = start_node(11, RpcConfig::new()).await;
    let b = start_node(12, RpcConfig::new()).await;
    let c = start_node(13, RpcConfig::new()).await;
    link(&a, &b).await;
    link(&a, &c).await;

    a.server.broadcast(Bytes::from_static(b"to everyone")).await;

    timeout(Duration::from_secs(10), async {
        while b.handler.requests.lock().unwrap().is_empty() || c.handler.requests.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }).await.expect("broadcast did not arrive in time");

    assert_eq!(b.handler.requests.lock().unwrap().as_slice(), &[Bytes::from_static(b"to everyone")]);
    assert_eq!(c.handler.requests.lock().unwrap().as_slice(), &[Bytes::from_static(b"to everyone")]);

    // one-way delivery: the echoed replies are confirmed but never surfaced
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(a.handler.replies.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_latency_report_after_traffic() {
    let a = start_node(14, RpcConfig::new()).await;
    let b = start_node(15, RpcConfig::new()).await;
    link(&a, &b).await;

    let key_b = b.server.public_key_hex();
    for _ in 0..10 {
        a.server.request(&key_b, Bytes::from_static(b"PING")).await.unwrap();
    }
    await_replies(&a, 10).await;

    let report = a.server.latency_report().await;
    assert_eq!(report.len(), 1);
    let (peer, stats) = &report[0];
    assert_eq!(peer, &key_b);
    assert!(stats.clock_sample_count >= 10);
    assert!(stats.ping < Duration::from_secs(1), "localhost ping is far below a second");
    assert!(stats.ping_upper_bound >= stats.ping);
    assert!(stats.clock_offset_micros.abs() < 1_000_000, "same host: offsets stay small");
}
