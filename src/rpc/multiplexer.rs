use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use crate::config::RpcConfig;
use crate::rpc::connection::PeerConnection;


/// Routes inbound datagrams on one shared UDP socket to per-peer connections.
///
/// All connections of a process share a single local port: that is what makes NAT traversal
///  predictable, and it means routing cannot go by local socket. Instead each datagram is
///  offered to the connection that knows the source endpoint. Endpoints move between peers'
///  endpoint sets only through explicit configuration, so the first match is the only match.
pub struct PortMultiplexer {
    socket: Arc<UdpSocket>,
    connections: RwLock<FxHashMap<String, Arc<PeerConnection>>>,
    max_datagram_size: usize,
}

impl PortMultiplexer {
    pub fn new(config: &RpcConfig, socket: Arc<UdpSocket>) -> PortMultiplexer {
        PortMultiplexer {
            socket,
            connections: RwLock::new(FxHashMap::default()),
            max_datagram_size: config.max_datagram_size,
        }
    }

    pub async fn add_connection(&self, connection: Arc<PeerConnection>) -> anyhow::Result<()> {
        let mut connections = self.connections.write().await;
        let key = connection.peer_key_hex().to_string();
        if connections.contains_key(&key) {
            anyhow::bail!("a connection to peer {} is already registered", key);
        }
        connections.insert(key, connection);
        Ok(())
    }

    pub async fn remove_connection(&self, peer_key_hex: &str) -> Option<Arc<PeerConnection>> {
        self.connections.write().await.remove(peer_key_hex)
    }

    pub async fn get_connection(&self, peer_key_hex: &str) -> Option<Arc<PeerConnection>> {
        self.connections.read().await.get(peer_key_hex).cloned()
    }

    pub async fn connections(&self) -> Vec<Arc<PeerConnection>> {
        self.connections.read().await.values().cloned().collect()
    }

    /// The receive loop; runs until the socket is closed. Datagrams from endpoints no
    ///  connection claims are dropped before any parsing - they are noise or probing.
    pub async fn recv_loop(&self) {
        let mut buf = vec![0u8; self.max_datagram_size];
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, from)) => {
                    if len == buf.len() {
                        warn!("datagram from {:?} at or above the size limit, likely truncated - dropping", from);
                        continue;
                    }
                    let data = Bytes::copy_from_slice(&buf[..len]);
                    self.dispatch(from, data).await;
                }
                Err(e) => {
                    // e.g. ICMP-triggered errors on some platforms; the socket stays usable
                    error!("error receiving a datagram: {}", e);
                }
            }
        }
    }

    async fn dispatch(&self, from: SocketAddr, data: Bytes) {
        // snapshot so no lock is held across the connection's processing
        let connections = self.connections().await;

        for connection in connections {
            if connection.matches_endpoint(from).await {
                connection.receive_datagram(from, data).await;
                return;
            }
        }
        debug!("datagram from unknown endpoint {:?} - dropping", from);
    }
}
