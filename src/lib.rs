//! Reliable, encrypted request/reply messaging over plain UDP, designed for peer-to-peer
//!  real-time applications (e.g. games) that need NAT traversal and clock-synchronized state
//!  exchange without a central coordinator.
//!
//! ## Design goals
//!
//! * The abstraction is bidirectional *RPC*: either peer can send a request and receive exactly
//!    one reply for it, with at-least-once transmission on the wire and exactly-once delivery to
//!    the application
//! * No ordering guarantee inside a *barrier* (an application-defined epoch), but strict ordering
//!    across barriers: a request of barrier N+1 never reaches the wire before every request of
//!    barrier N is satisfied
//! * Retransmission is driven purely by periodic heartbeats (which double as NAT keepalive) -
//!    there are no per-message timers
//! * All application payloads are encrypted with a per-connection session key, established by a
//!    one-way handshake exchanging an asymmetrically sealed key as the very first message
//! * A peer is reachable under a *set* of network addresses; the active one fails over
//!    automatically when traffic stops arriving
//! * Peers estimate each other's clock offset and network latency from piggybacked timestamps,
//!    trusting round-trip evidence only - not NTP, and not the peer
//!
//! Out of scope by design: ordered byte streams, delivery latency bounds, congestion control,
//!  and persistence across process restarts.

pub mod clock;
pub mod config;
pub mod crypto;
pub mod rpc;
pub mod util;
pub mod wire;
