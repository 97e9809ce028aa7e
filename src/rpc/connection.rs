use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use crate::clock::{ClockSync, ProcessClock};
use crate::config::RpcConfig;
use crate::crypto::{Identity, SessionCrypto, PUBLIC_KEY_LEN};
use crate::rpc::endpoints::EndpointSet;
use crate::rpc::engine::{RpcEngine, RpcEvent};
use crate::util::buf::{put_bytes, put_string, try_get_bytes, try_get_string};
use crate::wire::frame::Frame;
use crate::wire::rpc_id::RpcId;


/// Abstraction over the sending half of a UDP socket, for testability. Send failures are logged
///  and swallowed: to the protocol, a failed send is indistinguishable from a lost datagram,
///  and retransmission covers both.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn send_packet(&self, to: SocketAddr, buf: Bytes);
    fn local_addr(&self) -> SocketAddr;
}

pub struct UdpSendSocket {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpSendSocket {
    pub fn new(socket: Arc<UdpSocket>) -> anyhow::Result<UdpSendSocket> {
        let local_addr = socket.local_addr()?;
        Ok(UdpSendSocket { socket, local_addr })
    }
}

#[async_trait]
impl SendSocket for UdpSendSocket {
    async fn send_packet(&self, to: SocketAddr, buf: Bytes) {
        if let Err(e) = self.socket.send_to(&buf, to).await {
            error!("failed to send a datagram to {:?}: {}", to, e);
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Application callbacks of a connection. Implementations are shared and called from the
///  receive loop, so they should hand off long-running work.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    /// a request from `peer` (its public key in hex); answer it via [PeerConnection::reply] or
    ///  [crate::rpc::server::RpcServer::reply], exactly once
    async fn on_request(&self, peer: &str, id: RpcId, payload: Bytes);

    /// the reply to a previously sent request
    async fn on_reply(&self, peer: &str, id: RpcId, payload: Bytes);
}

/// Latency and clock figures for one peer, see [PeerConnection::stats].
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub ping: Duration,
    pub ping_upper_bound: Duration,
    pub clock_offset_micros: i64,
    pub clock_sample_count: u64,
}

struct ConnectionInner {
    engine: RpcEngine,
    crypto: SessionCrypto,
    clock_sync: ClockSync,
    endpoints: EndpointSet,
    /// set when the reply to our own handshake request arrives
    handshake_acked: bool,
}

enum AppEvent {
    Request { id: RpcId, payload: Bytes },
    Reply { id: RpcId, payload: Bytes },
}

/// One encrypted, reliable connection to a single peer.
///
/// This is the integration point of the protocol layers: the RPC state machine for reliability
/// and ordering, the session crypto for confidentiality, the clock synchronization piggybacked
/// on reply frames, and the endpoint set for failover. Each layer on its own is synchronous;
/// this struct wraps them in one lock and does the actual socket I/O after releasing it.
///
/// Wire format per frame kind:
/// * REQUEST on the reserved handshake id: plaintext `public key hex` and the sealed session
///   key, see [SessionCrypto]
/// * other REQUEST frames: the application payload, encrypted
/// * REPLY frames: one AEAD ciphertext of two timestamps (request receive time and reply send
///   time, peer clock, micros) followed by the application payload. The reply to a handshake
///   request is sealed under the very session key that request delivered, so authenticating it
///   proves the key arrived intact; every other reply uses the regular session key of its
///   direction. Nothing in a reply is acted on before it authenticates.
pub struct PeerConnection {
    peer_key_hex: String,
    local_key_hex: String,
    socket: Arc<dyn SendSocket>,
    clock: Arc<ProcessClock>,
    handler: Arc<dyn RpcHandler>,
    inner: Arc<RwLock<ConnectionInner>>,
}

impl PeerConnection {
    pub fn new(
        config: &RpcConfig,
        identity: &Identity,
        peer_public: [u8; PUBLIC_KEY_LEN],
        endpoint: SocketAddr,
        alternative_endpoints: impl IntoIterator<Item = SocketAddr>,
        socket: Arc<dyn SendSocket>,
        clock: Arc<ProcessClock>,
        handler: Arc<dyn RpcHandler>,
    ) -> PeerConnection {
        let inner = ConnectionInner {
            engine: RpcEngine::new(config),
            crypto: SessionCrypto::new(identity, peer_public),
            clock_sync: ClockSync::new(config, clock.clone()),
            endpoints: EndpointSet::new(config, endpoint, alternative_endpoints),
            handshake_acked: false,
        };

        PeerConnection {
            peer_key_hex: hex::encode(peer_public),
            local_key_hex: identity.public_key_hex(),
            socket,
            clock,
            handler,
            inner: Arc::new(RwLock::new(inner)),
        }
    }

    pub fn peer_key_hex(&self) -> &str {
        &self.peer_key_hex
    }

    /// Initiates the session: generates our outgoing session key and sends it as the handshake
    ///  request. Must be called exactly once, before anything else is sent.
    pub async fn connect(&self) {
        let (frame, active) = {
            let mut inner = self.inner.write().await;

            let mut buf = BytesMut::new();
            put_string(&mut buf, &self.local_key_hex);
            let sealed = inner.crypto.generate_outgoing_session_key();
            put_bytes(&mut buf, &sealed);

            let frame = inner.engine.request_handshake(buf.freeze());
            inner.clock_sync.create_request(RpcId::HANDSHAKE);
            inner.endpoints.note_send();
            (frame, inner.endpoints.active())
        };
        self.socket.send_packet(active, frame.to_bytes()).await;
    }

    /// True once traffic can flow: both session keys are in place, our handshake was answered,
    ///  and our reply to the peer's handshake got through.
    pub async fn ready_to_send(&self) -> bool {
        let inner = self.inner.read().await;
        Self::is_ready(&inner)
    }

    fn is_ready(inner: &ConnectionInner) -> bool {
        inner.crypto.is_fully_keyed()
            && inner.handshake_acked
            && !inner.engine.has_pending_reply(RpcId::HANDSHAKE)
    }

    /// Sends an encrypted request in the current barrier, returning its id. Panics if called
    ///  before the connection is ready - that is a lifecycle bug in the caller, the connection
    ///  cannot encrypt yet.
    pub async fn request(&self, payload: Bytes) -> RpcId {
        let (id, frame, active) = {
            let mut inner = self.inner.write().await;
            if !Self::is_ready(&inner) {
                panic!("request() to {} before the connection is ready - wait for ready_to_send()", self.peer_key_hex);
            }

            let ciphertext = Bytes::from(inner.crypto.encrypt(&payload));
            let (id, frame) = inner.engine.request(ciphertext);
            inner.clock_sync.create_request(id);
            if frame.is_some() {
                inner.endpoints.note_send();
            }
            (id, frame, inner.endpoints.active())
        };
        if let Some(frame) = frame {
            self.socket.send_packet(active, frame.to_bytes()).await;
        }
        id
    }

    /// Like [PeerConnection::request], but the reply is used for delivery confirmation only and
    ///  never surfaced to the handler.
    pub async fn request_no_reply(&self, payload: Bytes) -> RpcId {
        let (id, frame, active) = {
            let mut inner = self.inner.write().await;
            if !Self::is_ready(&inner) {
                panic!("request_no_reply() to {} before the connection is ready - wait for ready_to_send()", self.peer_key_hex);
            }

            let ciphertext = Bytes::from(inner.crypto.encrypt(&payload));
            let (id, frame) = inner.engine.request_no_reply(ciphertext);
            inner.clock_sync.create_request(id);
            if frame.is_some() {
                inner.endpoints.note_send();
            }
            (id, frame, inner.endpoints.active())
        };
        if let Some(frame) = frame {
            self.socket.send_packet(active, frame.to_bytes()).await;
        }
        id
    }

    /// Answers a pending inbound request. Panics if `id` has no pending request.
    pub async fn reply(&self, id: RpcId, payload: Bytes) {
        let (frame, active) = {
            let mut inner = self.inner.write().await;
            let frame = self.build_reply(&mut inner, id, payload);
            inner.endpoints.note_send();
            (frame, inner.endpoints.active())
        };
        self.socket.send_packet(active, frame.to_bytes()).await;
    }

    pub async fn advance_barrier(&self) -> u64 {
        self.inner.write().await.engine.advance_barrier()
    }

    /// One heartbeat tick: checks endpoint liveness (possibly failing over), then sends either
    ///  a retransmission or an empty HEARTBEAT frame.
    pub async fn heartbeat(&self) {
        let (frame, active) = {
            let mut inner = self.inner.write().await;
            inner.endpoints.check_liveness();
            let frame = inner.engine.heartbeat();
            inner.endpoints.note_send();
            (frame, inner.endpoints.active())
        };
        self.socket.send_packet(active, frame.to_bytes()).await;
    }

    pub async fn has_work(&self) -> bool {
        self.inner.read().await.engine.has_work()
    }

    pub async fn begin_shutdown(&self) {
        self.inner.write().await.engine.begin_shutdown();
    }

    /// Drops all connection state and tells the peer (best effort - the SHUTDOWN frame is sent
    ///  once, unreliably).
    pub async fn close(&self) {
        let (frame, active) = {
            let mut inner = self.inner.write().await;
            let frame = inner.engine.close();
            inner.clock_sync.clear();
            (frame, inner.endpoints.active())
        };
        self.socket.send_packet(active, frame.to_bytes()).await;
    }

    pub async fn stats(&self) -> ConnectionStats {
        let inner = self.inner.read().await;
        ConnectionStats {
            ping: inner.clock_sync.ping(),
            ping_upper_bound: inner.clock_sync.ping_upper_bound(),
            clock_offset_micros: inner.clock_sync.offset_micros(),
            clock_sample_count: inner.clock_sync.sample_count(),
        }
    }

    /// translates a peer-clock timestamp to this process' clock, see [ClockSync]
    pub async fn to_local_micros(&self, peer_micros: i64) -> i64 {
        self.inner.read().await.clock_sync.to_local_micros(peer_micros)
    }

    pub async fn to_peer_micros(&self, local_micros: i64) -> i64 {
        self.inner.read().await.clock_sync.to_peer_micros(local_micros)
    }

    /// true iff `addr` is a known, non-banned endpoint of this peer - the multiplexer's routing
    ///  criterion
    pub async fn matches_endpoint(&self, addr: SocketAddr) -> bool {
        self.inner.read().await.endpoints.contains(addr)
    }

    /// Entry point for one inbound datagram. Anything malformed, forged or stale is logged and
    ///  dropped - inbound data is never trusted enough to panic on.
    pub async fn receive_datagram(&self, from: SocketAddr, mut data: Bytes) {
        let frame = match Frame::try_deser(&mut data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("undecodable datagram from {:?}: {}", from, e);
                return;
            }
        };

        let (to_send, active, events) = {
            let mut inner = self.inner.write().await;
            let Some((to_send, events)) = self.process_frame(&mut inner, from, frame) else {
                return;
            };
            if !to_send.is_empty() {
                inner.endpoints.note_send();
            }
            (to_send, inner.endpoints.active(), events)
        };

        for frame in to_send {
            self.socket.send_packet(active, frame.to_bytes()).await;
        }

        // handler callbacks happen outside the lock so they can send on this same connection
        for event in events {
            match event {
                AppEvent::Request { id, payload } =>
                    self.handler.on_request(&self.peer_key_hex, id, payload).await,
                AppEvent::Reply { id, payload } =>
                    self.handler.on_reply(&self.peer_key_hex, id, payload).await,
            }
        }
    }

    /// Decrypts / validates an inbound frame and runs it through the state machine. `None`
    ///  means the frame was rejected before it reached the engine.
    fn process_frame(
        &self,
        inner: &mut ConnectionInner,
        from: SocketAddr,
        frame: Frame,
    ) -> Option<(Vec<Frame>, Vec<AppEvent>)> {
        if inner.endpoints.is_banned(from) {
            warn!("dropping a {:?} frame from banned endpoint {:?}", frame.kind(), from);
            return None;
        }

        let engine_frame = match frame {
            Frame::Request { id, payload } if id == RpcId::HANDSHAKE => {
                if !self.accept_handshake(inner, from, payload.clone()) {
                    return None;
                }
                Frame::Request { id, payload }
            }
            Frame::Request { id, payload } => {
                if !inner.crypto.has_incoming_key() {
                    debug!("request {:?} from {:?} before the handshake - dropping", id, from);
                    return None;
                }
                let Some(plaintext) = inner.crypto.decrypt(&payload) else {
                    warn!("request {:?} from {:?} failed decryption - dropping", id, from);
                    return None;
                };
                Frame::Request { id, payload: Bytes::from(plaintext) }
            }
            Frame::Reply { id, payload } => {
                // authenticate before anything else - an unauthenticated reply must not cause
                //  any state transition, not even in the clock estimators
                let plaintext = if id == RpcId::HANDSHAKE {
                    if !inner.crypto.has_outgoing_key() {
                        debug!("handshake reply from {:?} but no handshake was sent - dropping", from);
                        return None;
                    }
                    inner.crypto.decrypt_confirmation(&payload)
                }
                else {
                    if !inner.crypto.has_incoming_key() {
                        debug!("reply {:?} from {:?} before the handshake - dropping", id, from);
                        return None;
                    }
                    inner.crypto.decrypt(&payload)
                };
                let Some(plaintext) = plaintext else {
                    warn!("reply {:?} from {:?} failed authentication - dropping", id, from);
                    return None;
                };

                let mut plaintext = Bytes::from(plaintext);
                if plaintext.remaining() < 2 * size_of::<u64>() {
                    warn!("reply {:?} from {:?} is too short for its timestamps - dropping", id, from);
                    return None;
                }
                let peer_receive_micros = plaintext.get_u64() as i64;
                let peer_send_micros = plaintext.get_u64() as i64;
                inner.clock_sync.handle_reply(id, peer_receive_micros, peer_send_micros);

                if id == RpcId::HANDSHAKE {
                    inner.handshake_acked = true;
                }
                Frame::Reply { id, payload: plaintext }
            }
            other => other,
        };

        inner.endpoints.note_inbound(from);

        let out = inner.engine.receive(engine_frame);
        let mut to_send = out.frames;
        let mut app_events = Vec::new();

        for event in out.events {
            match event {
                RpcEvent::Request { id, payload } => {
                    inner.clock_sync.receive_request(id);
                    if id == RpcId::HANDSHAKE {
                        // answered internally; the reply carries timestamps only
                        let reply = self.build_reply(inner, id, Bytes::new());
                        to_send.push(reply);
                    }
                    else {
                        app_events.push(AppEvent::Request { id, payload });
                    }
                }
                RpcEvent::ReplyReady { id } => {
                    let payload = inner.engine.take_reply(id)
                        .expect("the engine just surfaced this reply");
                    app_events.push(AppEvent::Reply { id, payload });
                }
            }
        }

        Some((to_send, app_events))
    }

    /// Validates the peer's handshake request and installs the incoming session key. A claimed
    ///  public key that does not match the configured one gets the endpoint banned; a sealed
    ///  key that fails authentication is dropped without banning (it may be corruption rather
    ///  than an attack).
    fn accept_handshake(&self, inner: &mut ConnectionInner, from: SocketAddr, mut payload: Bytes) -> bool {
        let claimed_key = match try_get_string(&mut payload) {
            Ok(s) => s,
            Err(e) => {
                warn!("malformed handshake from {:?}: {}", from, e);
                return false;
            }
        };
        if claimed_key != self.peer_key_hex {
            warn!("handshake from {:?} claims public key {} instead of {} - banning the endpoint",
                from, claimed_key, self.peer_key_hex);
            inner.endpoints.ban(from);
            return false;
        }

        let sealed = match try_get_bytes(&mut payload) {
            Ok(b) => b,
            Err(e) => {
                warn!("malformed handshake from {:?}: {}", from, e);
                return false;
            }
        };

        if inner.crypto.has_incoming_key() {
            // a retransmitted handshake; the engine resends our stored reply
            return true;
        }
        if !inner.crypto.receive_incoming_session_key(&sealed) {
            warn!("handshake from {:?} carried a session key that fails authentication - dropping", from);
            return false;
        }
        true
    }

    /// Builds a reply frame: timestamps and payload in one sealed blob. The handshake reply is
    ///  sealed under the session key the handshake request delivered, which is what makes it
    ///  verifiable to the requester.
    fn build_reply(&self, inner: &mut ConnectionInner, id: RpcId, payload: Bytes) -> Frame {
        let receive_micros = inner.clock_sync.take_request_receive_time(id)
            .unwrap_or_else(|| self.clock.now_micros());

        let mut plaintext = BytesMut::new();
        plaintext.put_u64(receive_micros as u64);
        plaintext.put_u64(self.clock.now_micros() as u64);
        plaintext.extend_from_slice(&payload);

        let sealed = if id == RpcId::HANDSHAKE {
            inner.crypto.encrypt_confirmation(&plaintext)
        }
        else {
            inner.crypto.encrypt(&plaintext)
        };

        inner.engine.reply(id, Bytes::from(sealed))
    }
}
