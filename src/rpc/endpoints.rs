use std::net::SocketAddr;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::IteratorRandom;
use rand::SeedableRng;
use rustc_hash::FxHashSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::RpcConfig;


/// The set of UDP endpoints under which one peer may be reachable, with failover.
///
/// A peer behind NAT or on a multi-homed host often has several candidate addresses and only
///  some of them work at any given time. All outgoing traffic goes to the single `active`
///  endpoint; if nothing is heard back within the liveness timeout after a send, the active
///  endpoint is demoted and another candidate is promoted. Any inbound traffic from a known
///  endpoint proves that endpoint works and makes it active immediately.
///
/// `banned` endpoints are remembered only so their datagrams can be rejected; they are never
///  candidates for promotion.
pub struct EndpointSet {
    active: SocketAddr,
    alternatives: FxHashSet<SocketAddr>,
    dead: FxHashSet<SocketAddr>,
    banned: FxHashSet<SocketAddr>,

    /// set on the first send after silence, cleared by any inbound datagram. While set, the
    ///  active endpoint has unproven liveness and is on the clock.
    waiting_for_response_since: Option<Instant>,
    liveness_timeout: Duration,

    rng: StdRng,
}

impl EndpointSet {
    pub fn new(config: &RpcConfig, active: SocketAddr, alternatives: impl IntoIterator<Item = SocketAddr>) -> EndpointSet {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let alternatives: FxHashSet<SocketAddr> = alternatives.into_iter()
            .filter(|a| *a != active)
            .collect();

        EndpointSet {
            active,
            alternatives,
            dead: FxHashSet::default(),
            banned: FxHashSet::default(),
            waiting_for_response_since: None,
            liveness_timeout: config.endpoint_liveness_timeout,
            rng,
        }
    }

    pub fn active(&self) -> SocketAddr {
        self.active
    }

    /// true iff `addr` is a known, non-banned endpoint of this peer
    pub fn contains(&self, addr: SocketAddr) -> bool {
        if self.banned.contains(&addr) {
            return false;
        }
        addr == self.active || self.alternatives.contains(&addr) || self.dead.contains(&addr)
    }

    /// Called for every outgoing datagram: starts the liveness window unless one is already
    ///  running.
    pub fn note_send(&mut self) {
        if self.waiting_for_response_since.is_none() {
            self.waiting_for_response_since = Some(Instant::now());
        }
    }

    /// Called for every accepted inbound datagram: the source endpoint is proven live and
    ///  becomes active.
    pub fn note_inbound(&mut self, from: SocketAddr) {
        self.waiting_for_response_since = None;

        if from == self.active {
            return;
        }
        if self.alternatives.remove(&from) || self.dead.remove(&from) {
            info!("peer traffic arrived from {:?} - promoting it to the active endpoint", from);
            self.alternatives.insert(self.active);
            self.active = from;
        }
    }

    /// Periodic tick: if the active endpoint has been silent past the liveness window, fail over
    ///  to a (randomly chosen) alternative. When no alternatives are left, dead endpoints are
    ///  retried - an unreachable peer cycles through its endpoints rather than getting stuck.
    pub fn check_liveness(&mut self) {
        let Some(since) = self.waiting_for_response_since else {
            return;
        };
        if since.elapsed() < self.liveness_timeout {
            return;
        }

        let candidate = self.alternatives.iter().copied().choose(&mut self.rng)
            .or_else(|| self.dead.iter().copied().choose(&mut self.rng));
        match candidate {
            Some(next) => {
                warn!("endpoint {:?} exceeded the liveness timeout - failing over to {:?}", self.active, next);
                self.alternatives.remove(&next);
                self.dead.remove(&next);
                self.dead.insert(self.active);
                self.active = next;
                // the new endpoint gets a full window of its own
                self.waiting_for_response_since = Some(Instant::now());
            }
            None => {
                debug!("endpoint {:?} exceeded the liveness timeout, but there is no other candidate", self.active);
            }
        }
    }

    /// Excludes an endpoint permanently, e.g. after it presented a wrong public key. A banned
    ///  active endpoint triggers an immediate failover attempt.
    pub fn ban(&mut self, addr: SocketAddr) {
        warn!("banning endpoint {:?}", addr);
        self.alternatives.remove(&addr);
        self.dead.remove(&addr);
        self.banned.insert(addr);

        if addr == self.active {
            let candidate = self.alternatives.iter().copied().choose(&mut self.rng)
                .or_else(|| self.dead.iter().copied().choose(&mut self.rng));
            if let Some(next) = candidate {
                self.alternatives.remove(&next);
                self.dead.remove(&next);
                self.active = next;
                self.waiting_for_response_since = None;
            }
        }
    }

    pub fn is_banned(&self, addr: SocketAddr) -> bool {
        self.banned.contains(&addr)
    }
}


#[cfg(test)]
mod test {
    use tokio::time::advance;

    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn test_endpoints(alternatives: &[SocketAddr]) -> EndpointSet {
        let mut config = RpcConfig::new();
        config.rng_seed = Some(7);
        EndpointSet::new(&config, addr(1000), alternatives.iter().copied())
    }

    #[test]
    fn test_contains() {
        let e = test_endpoints(&[addr(1001), addr(1002)]);
        assert!(e.contains(addr(1000)));
        assert!(e.contains(addr(1001)));
        assert!(e.contains(addr(1002)));
        assert!(!e.contains(addr(1003)));
    }

    #[test]
    fn test_inbound_promotes_alternative() {
        let mut e = test_endpoints(&[addr(1001)]);

        e.note_inbound(addr(1001));
        assert_eq!(e.active(), addr(1001));
        // the old active endpoint stays known as an alternative
        assert!(e.contains(addr(1000)));

        // traffic from the active endpoint changes nothing
        e.note_inbound(addr(1001));
        assert_eq!(e.active(), addr(1001));

        // traffic from an unknown endpoint changes nothing either
        e.note_inbound(addr(9999));
        assert_eq!(e.active(), addr(1001));
        assert!(!e.contains(addr(9999)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_after_liveness_timeout() {
        let mut e = test_endpoints(&[addr(1001)]);

        e.note_send();
        advance(Duration::from_secs(3)).await;
        e.check_liveness();
        assert_eq!(e.active(), addr(1000), "still within the liveness window");

        advance(Duration::from_secs(3)).await;
        e.check_liveness();
        assert_eq!(e.active(), addr(1001), "silent endpoint demoted");
        assert!(e.contains(addr(1000)), "demoted endpoint stays known");

        // the failed-over endpoint gets a full window before the next failover
        e.check_liveness();
        assert_eq!(e.active(), addr(1001));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_traffic_resets_liveness_window() {
        let mut e = test_endpoints(&[addr(1001)]);

        e.note_send();
        advance(Duration::from_secs(4)).await;
        e.note_inbound(addr(1000));

        advance(Duration::from_secs(4)).await;
        e.check_liveness();
        assert_eq!(e.active(), addr(1000), "no window is running after inbound traffic");
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_endpoints_are_retried_when_alternatives_run_out() {
        let mut e = test_endpoints(&[addr(1001)]);

        e.note_send();
        advance(Duration::from_secs(6)).await;
        e.check_liveness();
        assert_eq!(e.active(), addr(1001));

        e.note_send();
        advance(Duration::from_secs(6)).await;
        e.check_liveness();
        assert_eq!(e.active(), addr(1000), "dead endpoint resurrected as last resort");
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_failover_without_candidates() {
        let mut e = test_endpoints(&[]);

        e.note_send();
        advance(Duration::from_secs(10)).await;
        e.check_liveness();
        assert_eq!(e.active(), addr(1000));
    }

    #[test]
    fn test_banned_endpoint_is_rejected_and_never_promoted() {
        let mut e = test_endpoints(&[addr(1001)]);

        e.ban(addr(1001));
        assert!(!e.contains(addr(1001)));

        e.note_inbound(addr(1001));
        assert_eq!(e.active(), addr(1000), "traffic from a banned endpoint must not promote it");
    }

    #[test]
    fn test_banning_the_active_endpoint_fails_over() {
        let mut e = test_endpoints(&[addr(1001)]);

        e.ban(addr(1000));
        assert_eq!(e.active(), addr(1001));
        assert!(!e.contains(addr(1000)));
    }
}
