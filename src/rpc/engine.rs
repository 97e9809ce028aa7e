use std::collections::VecDeque;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace};

use crate::config::RpcConfig;
use crate::rpc::id_cache::IdCache;
use crate::wire::frame::Frame;
use crate::wire::rpc_id::RpcId;


/// Delivery to the application, produced by [RpcEngine::receive]. Each inbound request and each
///  reply is surfaced exactly once, no matter how many duplicate frames arrive.
#[derive(Debug, Eq, PartialEq)]
pub enum RpcEvent {
    /// a new inbound request; it stays pending until the application calls [RpcEngine::reply]
    Request { id: RpcId, payload: Bytes },
    /// a reply arrived and is ready to be consumed via [RpcEngine::take_reply]
    ReplyReady { id: RpcId },
}

/// The result of feeding one inbound frame into the state machine: frames to put on the wire,
///  and deliveries for the application.
///
/// Returning follow-up sends (instead of invoking a send callback from inside the state machine)
///  keeps the engine free of re-entrancy: callers hold one plain lock around the engine and do
///  their I/O after releasing it.
#[derive(Default)]
pub struct EngineOutput {
    pub frames: Vec<Frame>,
    pub events: Vec<RpcEvent>,
}

struct PendingRequest {
    payload: Bytes,
    one_way: bool,
}

struct DelayedRequest {
    id: RpcId,
    payload: Bytes,
    one_way: bool,
}

/// The bidirectional RPC state machine of one connection direction pair.
///
/// There is no explicit per-RPC state object: an id's state is implicit in which of the sets it
///  occupies. An outgoing request moves `delayed -> outgoing_requests -> (gone)` as barriers
///  drain and its reply arrives; an inbound request moves
///  `incoming_requests -> outgoing_replies -> acked_replies` as the application replies and the
///  peer acknowledges.
///
/// The engine is purely synchronous and does no I/O: every operation returns the frames to
///  transmit. Retransmission is driven by [RpcEngine::heartbeat] picking one pending message
///  uniformly at random per tick - there are no per-message timers.
///
/// Failure semantics follow the protocol's taxonomy: invariant violations (duplicate id, reply
///  to an unknown request, sending while shutting down) panic, because they are bugs in the
///  caller; anything the network can cause (duplicates, reordering, stale frames) is absorbed
///  silently.
pub struct RpcEngine {
    current_barrier: u64,
    next_request_id: u64,

    /// requests sent and awaiting their reply
    outgoing_requests: FxHashMap<RpcId, PendingRequest>,
    /// requests of a newer barrier, held back until older barriers drain; FIFO
    delayed_requests: VecDeque<DelayedRequest>,
    /// inbound requests the application has not answered yet
    incoming_requests: FxHashMap<RpcId, Bytes>,
    /// replies sent and awaiting the peer's ACK
    outgoing_replies: FxHashMap<RpcId, Bytes>,
    /// replies received but not yet consumed by the application
    incoming_replies: FxHashMap<RpcId, Bytes>,

    /// recently consumed reply ids - duplicate REPLY frames for them are answered with a pure ACK
    processed_replies: IdCache,
    /// recently acknowledged reply ids - stale duplicate REQUEST frames for them are dropped
    ///  instead of being surfaced as new requests
    acked_replies: IdCache,

    draining: bool,
    closed: bool,

    simulated_receive_loss: f64,
    rng: StdRng,
}

impl RpcEngine {
    pub fn new(config: &RpcConfig) -> RpcEngine {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        RpcEngine {
            current_barrier: 1,
            next_request_id: 1,
            outgoing_requests: FxHashMap::default(),
            delayed_requests: VecDeque::default(),
            incoming_requests: FxHashMap::default(),
            outgoing_replies: FxHashMap::default(),
            incoming_replies: FxHashMap::default(),
            processed_replies: IdCache::new(config.reply_cache_capacity),
            acked_replies: IdCache::new(config.reply_cache_capacity),
            draining: false,
            closed: false,
            simulated_receive_loss: config.simulated_receive_loss,
            rng,
        }
    }

    /// Queues a request in the current barrier. The frame is returned for immediate transmission
    ///  if no older-barrier request is outstanding; otherwise the request waits in the delayed
    ///  queue and reaches the wire once the older barriers drain.
    pub fn request(&mut self, payload: Bytes) -> (RpcId, Option<Frame>) {
        let id = self.allocate_id();
        let frame = self.enqueue_request(id, payload, false);
        (id, frame)
    }

    /// Like [RpcEngine::request], but the reply is treated as pure delivery confirmation and
    ///  never surfaced to the application.
    pub fn request_no_reply(&mut self, payload: Bytes) -> (RpcId, Option<Frame>) {
        let id = self.allocate_id();
        let frame = self.enqueue_request(id, payload, true);
        (id, frame)
    }

    /// The session handshake request on the reserved id. It must be the very first message of
    ///  the connection; its reply is consumed as confirmation only.
    pub(crate) fn request_handshake(&mut self, payload: Bytes) -> Frame {
        if !self.outgoing_requests.is_empty() || !self.delayed_requests.is_empty() {
            panic!("the handshake must be the first outgoing message of a connection");
        }
        self.enqueue_request(RpcId::HANDSHAKE, payload, true)
            .expect("first request is never delayed")
    }

    /// Starts a new ordering epoch: requests queued from now on never overtake requests of the
    ///  previous barrier. Request ids restart at 1 within the new barrier.
    pub fn advance_barrier(&mut self) -> u64 {
        self.current_barrier += 1;
        self.next_request_id = 1;
        self.current_barrier
    }

    pub fn current_barrier(&self) -> u64 {
        self.current_barrier
    }

    /// Answers a pending inbound request. Panics if the id is not pending - replying to an
    ///  unknown request is a bug in the application, not a network condition.
    pub fn reply(&mut self, id: RpcId, payload: Bytes) -> Frame {
        if self.incoming_requests.remove(&id).is_none() {
            panic!("reply() for id {:?} which has no pending incoming request - this is a bug in the caller", id);
        }
        self.outgoing_replies.insert(id, payload.clone());
        Frame::Reply { id, payload }
    }

    /// One heartbeat tick: retransmits one pending outgoing request or reply, picked uniformly
    ///  at random, or an empty HEARTBEAT frame if nothing is pending. Either way a datagram goes
    ///  out, keeping NAT mappings alive.
    pub fn heartbeat(&mut self) -> Frame {
        self.resend_random_pending(None)
            .unwrap_or(Frame::Heartbeat)
    }

    /// Feeds one inbound frame into the state machine.
    pub fn receive(&mut self, frame: Frame) -> EngineOutput {
        let mut output = EngineOutput::default();

        if self.closed {
            debug!("frame received after close - ignoring");
            return output;
        }

        if self.simulated_receive_loss > 0.0 && self.rng.gen::<f64>() < self.simulated_receive_loss {
            trace!("simulated loss: dropping inbound {:?} frame", frame.kind());
            return output;
        }

        match frame {
            Frame::Heartbeat => {
                // liveness is tracked by the caller; nothing to do at this layer
            }
            Frame::Request { id, payload } => self.on_request(id, payload, &mut output),
            Frame::Reply { id, payload } => self.on_reply(id, payload, &mut output),
            Frame::Acknowledge { id } => self.on_acknowledge(id, &mut output),
            Frame::Shutdown => {
                info!("peer announced shutdown - dropping all connection state");
                self.clear_sets();
            }
        }

        output
    }

    fn on_request(&mut self, id: RpcId, payload: Bytes, output: &mut EngineOutput) {
        if self.incoming_requests.contains_key(&id) {
            debug!("duplicate request {:?} - already pending, dropping", id);
            return;
        }
        if let Some(reply_payload) = self.outgoing_replies.get(&id) {
            trace!("duplicate request {:?} - already answered, resending the reply", id);
            output.frames.push(Frame::Reply { id, payload: reply_payload.clone() });
            return;
        }
        if self.acked_replies.contains(&id) {
            debug!("stale duplicate request {:?} - reply was already acknowledged, dropping", id);
            return;
        }

        trace!("new incoming request {:?}", id);
        self.incoming_requests.insert(id, payload.clone());
        output.events.push(RpcEvent::Request { id, payload });
    }

    fn on_reply(&mut self, id: RpcId, payload: Bytes, output: &mut EngineOutput) {
        if self.processed_replies.contains(&id) || self.incoming_replies.contains_key(&id) {
            trace!("duplicate reply {:?} - resending ACK only", id);
            output.frames.push(Frame::Acknowledge { id });
            return;
        }

        match self.outgoing_requests.remove(&id) {
            Some(pending) => {
                output.frames.push(Frame::Acknowledge { id });

                if pending.one_way {
                    trace!("one-way request {:?} confirmed - discarding reply payload", id);
                    self.processed_replies.insert(id);
                }
                else {
                    self.incoming_replies.insert(id, payload);
                    output.events.push(RpcEvent::ReplyReady { id });
                }

                // a satisfied request may drain its barrier and unblock delayed ones
                self.release_delayed(&mut output.frames);

                if let Some(resend) = self.resend_random_pending(Some(id)) {
                    output.frames.push(resend);
                }
            }
            None => {
                // the request is long gone; the ACK got lost, so resend it - idempotent
                debug!("reply {:?} for an unknown request - resending ACK", id);
                output.frames.push(Frame::Acknowledge { id });
            }
        }
    }

    fn on_acknowledge(&mut self, id: RpcId, output: &mut EngineOutput) {
        if self.outgoing_replies.remove(&id).is_some() {
            trace!("reply {:?} acknowledged", id);
            self.acked_replies.insert(id);

            if let Some(resend) = self.resend_random_pending(Some(id)) {
                output.frames.push(resend);
            }
        }
        else {
            debug!("duplicate ACK for {:?} - ignoring", id);
        }
    }

    /// Consumes a surfaced reply exactly once; later duplicates of it are answered with ACK
    ///  from the processed cache.
    pub fn take_reply(&mut self, id: RpcId) -> Option<Bytes> {
        let payload = self.incoming_replies.remove(&id)?;
        self.processed_replies.insert(id);
        Some(payload)
    }

    /// True while there is work that should block an orderly shutdown. Outgoing replies are
    ///  deliberately excluded: the peer may already be gone, and a reply nobody collects must
    ///  not keep the connection alive forever.
    pub fn has_work(&self) -> bool {
        if self.closed {
            return false;
        }
        !self.delayed_requests.is_empty()
            || !self.outgoing_requests.is_empty()
            || !self.incoming_requests.is_empty()
            || !self.incoming_replies.is_empty()
    }

    /// Phase one of shutdown: no new application requests are accepted. Replies to still-pending
    ///  inbound requests remain possible (and necessary) for draining.
    pub fn begin_shutdown(&mut self) {
        self.draining = true;
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    /// Phase two of shutdown, after [RpcEngine::has_work] went false: drops all state in one go
    ///  and produces the final SHUTDOWN frame.
    pub fn close(&mut self) -> Frame {
        self.draining = true;
        self.closed = true;
        self.clear_sets();
        Frame::Shutdown
    }

    pub fn has_outgoing_request(&self, id: RpcId) -> bool {
        self.outgoing_requests.contains_key(&id)
    }

    pub fn has_pending_reply(&self, id: RpcId) -> bool {
        self.outgoing_replies.contains_key(&id)
    }

    fn allocate_id(&mut self) -> RpcId {
        let id = RpcId::new(self.current_barrier, self.next_request_id);
        self.next_request_id += 1;
        id
    }

    fn enqueue_request(&mut self, id: RpcId, payload: Bytes, one_way: bool) -> Option<Frame> {
        if self.draining {
            panic!("request {:?} after shutdown was initiated - this is a bug in the caller", id);
        }
        if self.outgoing_requests.contains_key(&id)
            || self.delayed_requests.iter().any(|d| d.id == id)
        {
            panic!("duplicate outgoing request id {:?} - this is a bug in the caller", id);
        }

        if self.delayed_requests.is_empty() && self.is_barrier_clear(id.barrier) {
            self.outgoing_requests.insert(id, PendingRequest { payload: payload.clone(), one_way });
            Some(Frame::Request { id, payload })
        }
        else {
            trace!("request {:?} delayed behind an older barrier", id);
            self.delayed_requests.push_back(DelayedRequest { id, payload, one_way });
            None
        }
    }

    /// true iff nothing of an *other* barrier is outstanding, so a request of `barrier` may go
    ///  on the wire without overtaking anything
    fn is_barrier_clear(&self, barrier: u64) -> bool {
        self.outgoing_requests.keys().all(|k| k.barrier == barrier)
    }

    /// Moves delayed requests to the wire, in FIFO order, as long as their barrier does not
    ///  conflict with what is still outstanding.
    fn release_delayed(&mut self, frames: &mut Vec<Frame>) {
        loop {
            let front_barrier = match self.delayed_requests.front() {
                Some(d) => d.id.barrier,
                None => break,
            };
            if !self.is_barrier_clear(front_barrier) {
                break;
            }

            let d = self.delayed_requests.pop_front().expect("checked non-empty above");
            trace!("releasing delayed request {:?}", d.id);
            self.outgoing_requests.insert(d.id, PendingRequest { payload: d.payload.clone(), one_way: d.one_way });
            frames.push(Frame::Request { id: d.id, payload: d.payload });
        }
    }

    /// Picks one pending outgoing message (request or reply) uniformly at random and rebuilds
    ///  its frame for retransmission. The candidate list is sorted and the index drawn once per
    ///  call, so a seeded engine behaves deterministically.
    fn resend_random_pending(&mut self, exclude: Option<RpcId>) -> Option<Frame> {
        let mut candidates: Vec<(RpcId, bool)> = Vec::new();
        for &id in self.outgoing_requests.keys() {
            if Some(id) != exclude {
                candidates.push((id, true));
            }
        }
        for &id in self.outgoing_replies.keys() {
            if Some(id) != exclude {
                candidates.push((id, false));
            }
        }
        if candidates.is_empty() {
            return None;
        }
        candidates.sort();

        let (id, is_request) = candidates[self.rng.gen_range(0..candidates.len())];
        let frame = if is_request {
            Frame::Request {
                id,
                payload: self.outgoing_requests[&id].payload.clone(),
            }
        }
        else {
            Frame::Reply {
                id,
                payload: self.outgoing_replies[&id].clone(),
            }
        };
        trace!("retransmitting {:?} {:?}", frame.kind(), id);
        Some(frame)
    }

    fn clear_sets(&mut self) {
        self.outgoing_requests.clear();
        self.delayed_requests.clear();
        self.incoming_requests.clear();
        self.outgoing_replies.clear();
        self.incoming_replies.clear();
        self.processed_replies.clear();
        self.acked_replies.clear();
    }
}
