use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::RpcConfig;
use crate::util::rolling_window::RollingWindow;
use crate::wire::rpc_id::RpcId;


/// A process-scoped monotonic clock: all protocol timestamps are microseconds since this clock's
///  origin. Created once at startup and injected into everything that stamps or compares times -
///  there is no global time origin.
pub struct ProcessClock {
    origin: Instant,
}

impl ProcessClock {
    pub fn new() -> ProcessClock {
        ProcessClock { origin: Instant::now() }
    }

    pub fn now_micros(&self) -> i64 {
        Instant::now().duration_since(self.origin).as_micros() as i64
    }
}

impl Default for ProcessClock {
    fn default() -> Self {
        ProcessClock::new()
    }
}


const PING_WINDOW_SIZE: usize = 256;

/// Estimates a peer's clock offset and the network round trip latency from request / reply
///  timestamps, independent of the RPC engine's retry bookkeeping.
///
/// Peer clocks are neither trusted nor synchronized; the only evidence is the timestamp
///  quadruple of a completed round trip: local send time, peer receive time, peer send time
///  (both piggybacked on the reply) and local receive time. From those,
///
/// * `rtt = (local_recv - local_send) - (peer_send - peer_recv)` and half of it estimates the
///    one-way latency, tracked in a bounded sliding window (mean / deviation / 99% upper bound)
/// * `((peer_recv - local_send) + (peer_send - local_recv)) / 2` estimates the clock offset,
///    fed into a smoothed tracker so the estimate follows drift instead of jumping with every
///    noisy sample. The first few samples establish a baseline by plain averaging - a smoother
///    starting from zero would converge needlessly slowly.
///
/// The smoother keeps exponential moving averages of the error and its square (Adam style, with
///  bias correction), so the per-sample step is bounded by the configured learning rate and
///  scales down in noisy phases.
pub struct ClockSync {
    clock: Arc<ProcessClock>,

    /// local send time by request id, recorded on first send only - retransmissions keep the
    ///  original timestamp
    pending_requests: FxHashMap<RpcId, i64>,
    /// local receive time of inbound requests, consumed when the application replies
    received_requests: FxHashMap<RpcId, i64>,

    half_ping_window: RollingWindow<PING_WINDOW_SIZE>,

    offset_estimate_micros: f64,
    baseline_samples: u64,
    baseline_sum: f64,
    sample_count: u64,

    learning_rate: f64,
    gradient_decay: f64,
    square_gradient_decay: f64,
    epsilon: f64,
    gradient_avg: f64,
    square_gradient_avg: f64,
}

impl ClockSync {
    pub fn new(config: &RpcConfig, clock: Arc<ProcessClock>) -> ClockSync {
        ClockSync {
            clock,
            pending_requests: FxHashMap::default(),
            received_requests: FxHashMap::default(),
            half_ping_window: RollingWindow::new(),
            offset_estimate_micros: 0.0,
            baseline_samples: config.clock_baseline_samples,
            baseline_sum: 0.0,
            sample_count: 0,
            learning_rate: config.clock_learning_rate_micros,
            gradient_decay: config.clock_gradient_decay,
            square_gradient_decay: config.clock_square_gradient_decay,
            epsilon: config.clock_epsilon,
            gradient_avg: 0.0,
            square_gradient_avg: 0.0,
        }
    }

    /// Records the local send time of an outgoing request. Panics on a duplicate id - ids are
    ///  unique per direction by protocol invariant, so a duplicate is a bug in the caller.
    pub fn create_request(&mut self, id: RpcId) {
        let now = self.clock.now_micros();
        if self.pending_requests.insert(id, now).is_some() {
            panic!("clock sync saw request id {:?} twice - this is a bug in the caller", id);
        }
    }

    /// Records the local receive time of an inbound request. First receipt wins - the engine
    ///  deduplicates, so this is called at most once per id.
    pub fn receive_request(&mut self, id: RpcId) {
        let now = self.clock.now_micros();
        self.received_requests.entry(id).or_insert(now);
    }

    /// Consumes the recorded receive time when the application replies, for piggybacking on the
    ///  reply together with the reply send time.
    pub fn take_request_receive_time(&mut self, id: RpcId) -> Option<i64> {
        self.received_requests.remove(&id)
    }

    /// Feeds one completed round trip into the estimators. The local receive time is captured
    ///  here; the peer times come off the reply's timestamp prefix. Unknown ids (stale
    ///  duplicates that slipped past the engine) are ignored.
    pub fn handle_reply(&mut self, id: RpcId, peer_receive_micros: i64, peer_send_micros: i64) {
        let local_send = match self.pending_requests.remove(&id) {
            Some(t) => t,
            None => {
                debug!("reply timestamps for unknown request {:?} - ignoring", id);
                return;
            }
        };
        let local_recv = self.clock.now_micros();

        let peer_processing = peer_send_micros.saturating_sub(peer_receive_micros);
        let rtt = (local_recv - local_send).saturating_sub(peer_processing);
        if rtt < 0 {
            warn!("negative round trip estimate for {:?} - peer timestamps look implausible, ignoring", id);
            return;
        }
        let half_ping = rtt as f64 / 2.0;
        self.half_ping_window.add_sample(half_ping);

        // symmetric subtraction of the midpoint ping cancels the latency term in both directions
        let offset_sample =
            ((peer_receive_micros - local_send) as f64 + (peer_send_micros - local_recv) as f64) / 2.0;

        self.sample_count += 1;
        if self.sample_count <= self.baseline_samples {
            self.baseline_sum += offset_sample;
            self.offset_estimate_micros = self.baseline_sum / self.sample_count as f64;
        }
        else {
            self.smoothed_step(offset_sample);
        }
    }

    fn smoothed_step(&mut self, offset_sample: f64) {
        let gradient = self.offset_estimate_micros - offset_sample;

        self.gradient_avg =
            self.gradient_decay * self.gradient_avg + (1.0 - self.gradient_decay) * gradient;
        self.square_gradient_avg = self.square_gradient_decay * self.square_gradient_avg
            + (1.0 - self.square_gradient_decay) * gradient * gradient;

        let adjusted_steps = (self.sample_count - self.baseline_samples) as i32;
        let gradient_hat = self.gradient_avg / (1.0 - self.gradient_decay.powi(adjusted_steps));
        let square_gradient_hat =
            self.square_gradient_avg / (1.0 - self.square_gradient_decay.powi(adjusted_steps));

        self.offset_estimate_micros -=
            self.learning_rate * gradient_hat / (square_gradient_hat.sqrt() + self.epsilon);
    }

    /// smoothed one-way latency estimate
    pub fn ping(&self) -> Duration {
        Duration::from_micros(self.half_ping_window.mean().max(0.0) as u64)
    }

    /// latency bound that ~99% of observed samples fall under
    pub fn ping_upper_bound(&self) -> Duration {
        Duration::from_micros(self.half_ping_window.upper_bound_99().max(0.0) as u64)
    }

    /// current estimate of `peer_clock - local_clock`, in microseconds
    pub fn offset_micros(&self) -> i64 {
        self.offset_estimate_micros.round() as i64
    }

    pub fn to_peer_micros(&self, local_micros: i64) -> i64 {
        local_micros + self.offset_micros()
    }

    pub fn to_local_micros(&self, peer_micros: i64) -> i64 {
        peer_micros - self.offset_micros()
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    /// drops all per-request bookkeeping; called when the connection shuts down
    pub fn clear(&mut self) {
        self.pending_requests.clear();
        self.received_requests.clear();
    }
}


#[cfg(test)]
mod test {
    use tokio::time::advance;

    use super::*;

    fn test_sync(baseline_samples: u64) -> ClockSync {
        let mut config = RpcConfig::new();
        config.clock_baseline_samples = baseline_samples;
        ClockSync::new(&config, Arc::new(ProcessClock::new()))
    }

    /// simulates one round trip with fixed one-way latency and a peer whose clock runs
    ///  `offset_micros` ahead of ours
    async fn round_trip(sync: &mut ClockSync, id: RpcId, latency: Duration, offset_micros: i64) {
        sync.create_request(id);
        advance(latency).await;

        let peer_now = sync.clock.now_micros() + offset_micros;
        advance(latency).await;

        sync.handle_reply(id, peer_now, peer_now);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offset_and_ping_recovery() {
        let mut sync = test_sync(10);
        let latency = Duration::from_millis(40);
        let offset = 1_500_000; // peer runs 1.5s ahead

        for i in 1..=50 {
            round_trip(&mut sync, RpcId::new(1, i), latency, offset).await;
        }

        assert!((sync.offset_micros() - offset).abs() < 1_000,
            "offset estimate {} should be close to {}", sync.offset_micros(), offset);
        let ping = sync.ping().as_micros() as i64;
        assert!((ping - latency.as_micros() as i64).abs() < 1_000,
            "ping estimate {} should be close to {}", ping, latency.as_micros());
        assert_eq!(sync.sample_count(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_smoother_tracks_drift_without_jumping() {
        let mut sync = test_sync(5);
        let latency = Duration::from_millis(10);

        for i in 1..=5 {
            round_trip(&mut sync, RpcId::new(1, i), latency, 0).await;
        }
        assert_eq!(sync.offset_micros(), 0);

        // the peer clock jumps by 10ms; the tracked estimate moves towards it in bounded steps
        round_trip(&mut sync, RpcId::new(1, 6), latency, 10_000).await;
        let after_one = sync.offset_micros();
        assert!(after_one > 0 && after_one < 1_000,
            "one sample must not move the estimate by more than the learning rate, got {}", after_one);

        for i in 7..=400 {
            round_trip(&mut sync, RpcId::new(1, i), latency, 10_000).await;
        }
        assert!((sync.offset_micros() - 10_000).abs() < 1_000,
            "estimate {} should have converged towards 10000", sync.offset_micros());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timestamp_translation() {
        let mut sync = test_sync(1);
        round_trip(&mut sync, RpcId::new(1, 1), Duration::from_millis(5), 2_000_000).await;

        let local = sync.clock.now_micros();
        assert_eq!(sync.to_local_micros(sync.to_peer_micros(local)), local);
        assert_eq!(sync.to_peer_micros(local) - local, sync.offset_micros());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_reply_is_ignored() {
        let mut sync = test_sync(10);
        sync.handle_reply(RpcId::new(7, 7), 123, 456);
        assert_eq!(sync.sample_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_receive_keeps_first_timestamp() {
        let mut sync = test_sync(10);
        let id = RpcId::new(1, 1);

        sync.receive_request(id);
        let first = sync.received_requests[&id];
        advance(Duration::from_millis(50)).await;
        sync.receive_request(id);

        assert_eq!(sync.take_request_receive_time(id), Some(first));
        assert_eq!(sync.take_request_receive_time(id), None);
    }

    #[tokio::test(start_paused = true)]
    #[should_panic(expected = "twice")]
    async fn test_duplicate_create_request_panics() {
        let mut sync = test_sync(10);
        sync.create_request(RpcId::new(1, 1));
        sync.create_request(RpcId::new(1, 1));
    }
}
