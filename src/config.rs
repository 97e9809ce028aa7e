use std::time::Duration;


/// Tuning knobs for a connection / server. `RpcConfig::new()` provides defaults that are
///  reasonable for real-time traffic on consumer internet connections.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Interval of the heartbeat tick. Each tick retransmits one pending message (or an empty
    ///  HEARTBEAT frame if nothing is pending), so this is also the retransmission cadence:
    ///  there are no per-message timers.
    pub heartbeat_interval: Duration,

    /// If no traffic at all arrives within this window after a send, the active endpoint is
    ///  considered dead and an alternative is promoted.
    pub endpoint_liveness_timeout: Duration,

    /// Number of consumed reply ids remembered for answering duplicate REPLY frames with a pure
    ///  ACK. Bounds memory; a duplicate arriving after eviction is indistinguishable from a
    ///  forged one and gets dropped.
    pub reply_cache_capacity: usize,

    /// Upper bound on accepted datagram size; larger inbound packets are dropped undecoded.
    pub max_datagram_size: usize,

    /// Number of initial clock offset samples that are plainly averaged before the smoothed
    ///  tracker takes over. Avoids cold start instability.
    pub clock_baseline_samples: u64,

    /// Maximum per-sample adjustment (in microseconds) of the tracked clock offset once the
    ///  baseline is established. The tracker follows clock drift smoothly instead of jumping.
    pub clock_learning_rate_micros: f64,
    /// decay of the gradient moving average (Adam beta1)
    pub clock_gradient_decay: f64,
    /// decay of the squared-gradient moving average (Adam beta2)
    pub clock_square_gradient_decay: f64,
    pub clock_epsilon: f64,

    /// Seed for all randomized decisions (retransmission pick, endpoint promotion). `None` seeds
    ///  from entropy; tests pass a fixed value for determinism.
    pub rng_seed: Option<u64>,

    /// Test instrumentation: probability in [0,1] of silently dropping an inbound frame at the
    ///  receive boundary, to exercise retransmission. Must be 0.0 in production.
    pub simulated_receive_loss: f64,
}

impl RpcConfig {
    pub fn new() -> RpcConfig {
        RpcConfig {
            heartbeat_interval: Duration::from_millis(100),
            endpoint_liveness_timeout: Duration::from_secs(5),
            reply_cache_capacity: 1024,
            max_datagram_size: 64 * 1024,
            clock_baseline_samples: 10,
            clock_learning_rate_micros: 100.0,
            clock_gradient_decay: 0.9,
            clock_square_gradient_decay: 0.999,
            clock_epsilon: 1e-8,
            rng_seed: None,
            simulated_receive_loss: 0.0,
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        RpcConfig::new()
    }
}
