use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::clock::ProcessClock;
use crate::config::RpcConfig;
use crate::crypto::{Identity, PUBLIC_KEY_LEN};
use crate::rpc::connection::{ConnectionStats, PeerConnection, RpcHandler, SendSocket, UdpSendSocket};
use crate::rpc::multiplexer::PortMultiplexer;
use crate::wire::rpc_id::RpcId;


/// The top-level handle of one protocol endpoint: a single UDP socket, one [PeerConnection] per
///  peer, and the driver loop that pumps inbound datagrams and heartbeats.
///
/// Peers are addressed by the hex encoding of their x25519 public key - the key, not the
///  network address, is a peer's identity, and its addresses may change over the lifetime of a
///  connection.
pub struct RpcServer {
    config: RpcConfig,
    identity: Identity,
    clock: Arc<ProcessClock>,
    send_socket: Arc<UdpSendSocket>,
    multiplexer: PortMultiplexer,
    handler: Arc<dyn RpcHandler>,
}

impl RpcServer {
    pub async fn bind(
        config: RpcConfig,
        identity: Identity,
        addr: SocketAddr,
        handler: Arc<dyn RpcHandler>,
    ) -> anyhow::Result<Arc<RpcServer>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let send_socket = Arc::new(UdpSendSocket::new(socket.clone())?);
        let multiplexer = PortMultiplexer::new(&config, socket);

        info!("rpc server listening on {:?} as {}", send_socket.local_addr(), identity.public_key_hex());

        Ok(Arc::new(RpcServer {
            config,
            identity,
            clock: Arc::new(ProcessClock::new()),
            send_socket,
            multiplexer,
            handler,
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.send_socket.local_addr()
    }

    pub fn public_key_hex(&self) -> String {
        self.identity.public_key_hex()
    }

    /// Registers a peer and initiates the session handshake. The connection becomes usable once
    ///  [RpcServer::ready_to_send] goes true for it; until then the handshake is retransmitted
    ///  by the heartbeat loop.
    pub async fn add_peer(
        &self,
        peer_public: [u8; PUBLIC_KEY_LEN],
        endpoint: SocketAddr,
        alternative_endpoints: impl IntoIterator<Item = SocketAddr>,
    ) -> anyhow::Result<Arc<PeerConnection>> {
        let connection = Arc::new(PeerConnection::new(
            &self.config,
            &self.identity,
            peer_public,
            endpoint,
            alternative_endpoints,
            self.send_socket.clone() as Arc<dyn SendSocket>,
            self.clock.clone(),
            self.handler.clone(),
        ));

        self.multiplexer.add_connection(connection.clone()).await?;
        connection.connect().await;
        Ok(connection)
    }

    /// Closes the connection to a peer, telling it (unreliably) via a SHUTDOWN frame.
    pub async fn remove_peer(&self, peer_key_hex: &str) {
        match self.multiplexer.remove_connection(peer_key_hex).await {
            Some(connection) => connection.close().await,
            None => debug!("remove_peer() for unknown peer {}", peer_key_hex),
        }
    }

    pub async fn connection(&self, peer_key_hex: &str) -> Option<Arc<PeerConnection>> {
        self.multiplexer.get_connection(peer_key_hex).await
    }

    pub async fn ready_to_send(&self, peer_key_hex: &str) -> bool {
        match self.connection(peer_key_hex).await {
            Some(connection) => connection.ready_to_send().await,
            None => false,
        }
    }

    /// true once the handshake of every registered peer has settled
    pub async fn all_ready(&self) -> bool {
        for connection in self.multiplexer.connections().await {
            if !connection.ready_to_send().await {
                return false;
            }
        }
        true
    }

    pub async fn request(&self, peer_key_hex: &str, payload: Bytes) -> anyhow::Result<RpcId> {
        let Some(connection) = self.connection(peer_key_hex).await else {
            bail!("request for unknown peer {}", peer_key_hex);
        };
        Ok(connection.request(payload).await)
    }

    pub async fn request_no_reply(&self, peer_key_hex: &str, payload: Bytes) -> anyhow::Result<RpcId> {
        let Some(connection) = self.connection(peer_key_hex).await else {
            bail!("request for unknown peer {}", peer_key_hex);
        };
        Ok(connection.request_no_reply(payload).await)
    }

    pub async fn reply(&self, peer_key_hex: &str, id: RpcId, payload: Bytes) -> anyhow::Result<()> {
        let Some(connection) = self.connection(peer_key_hex).await else {
            bail!("reply for unknown peer {}", peer_key_hex);
        };
        connection.reply(id, payload).await;
        Ok(())
    }

    /// Sends a payload to every peer whose connection is ready, as one-way requests - delivery
    ///  is confirmed per peer, replies are discarded. Peers still in their handshake are
    ///  skipped.
    pub async fn broadcast(&self, payload: Bytes) {
        for connection in self.multiplexer.connections().await {
            if connection.ready_to_send().await {
                connection.request_no_reply(payload.clone()).await;
            }
            else {
                debug!("skipping peer {} in broadcast - connection not ready", connection.peer_key_hex());
            }
        }
    }

    /// true while any connection has unfinished work that should block an orderly shutdown
    pub async fn has_work(&self) -> bool {
        for connection in self.multiplexer.connections().await {
            if connection.has_work().await {
                return true;
            }
        }
        false
    }

    /// Latency and clock-offset figures per peer, for diagnostics.
    pub async fn latency_report(&self) -> Vec<(String, ConnectionStats)> {
        let mut result = Vec::new();
        for connection in self.multiplexer.connections().await {
            result.push((connection.peer_key_hex().to_string(), connection.stats().await));
        }
        result
    }

    /// The driver loop: pumps inbound datagrams and fires one heartbeat round per interval.
    ///  Runs until the task is dropped; typically spawned right after [RpcServer::bind].
    pub async fn run(&self) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let recv_loop = self.multiplexer.recv_loop();
        tokio::pin!(recv_loop);

        loop {
            tokio::select! {
                _ = &mut recv_loop => return,
                _ = heartbeat.tick() => {
                    for connection in self.multiplexer.connections().await {
                        connection.heartbeat().await;
                    }
                }
            }
        }
    }

    /// Orderly shutdown: stops accepting new requests, waits (up to `grace`) for outstanding
    ///  work to drain, then closes all connections. The driver loop must keep running while
    ///  this waits - retransmission is what drains the work.
    pub async fn shutdown(&self, grace: Duration) {
        for connection in self.multiplexer.connections().await {
            connection.begin_shutdown().await;
        }

        let deadline = tokio::time::Instant::now() + grace;
        while self.has_work().await {
            if tokio::time::Instant::now() >= deadline {
                info!("shutdown grace period expired with work still pending - closing anyway");
                break;
            }
            tokio::time::sleep(self.config.heartbeat_interval).await;
        }

        for connection in self.multiplexer.connections().await {
            self.multiplexer.remove_connection(connection.peer_key_hex()).await;
            connection.close().await;
        }
    }
}
