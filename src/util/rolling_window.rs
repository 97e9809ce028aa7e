use ordered_float::OrderedFloat;


/// A bounded sliding window of `f64` samples with cached aggregates, so mean and standard
///  deviation are O(1) regardless of window size.
///
/// The window grows until it holds `N` samples, then turns into a ring buffer that evicts the
///  oldest sample for each new one. Eviction keeps the cached sum / square sum consistent by
///  subtracting the evicted value.
pub struct RollingWindow<const N: usize> {
    buf: BufferImpl<N>,
    cached_sum: f64,
    cached_square_sum: f64,
    total_sample_count: u64,
}

impl<const N: usize> RollingWindow<N> {
    pub fn new() -> Self {
        RollingWindow {
            buf: BufferImpl::Growing(vec![]),
            cached_sum: 0.0,
            cached_square_sum: 0.0,
            total_sample_count: 0,
        }
    }

    pub fn add_sample(&mut self, value: f64) {
        if let Some(evicted) = self.buf.add_value(value) {
            self.cached_sum -= evicted;
            self.cached_square_sum -= evicted * evicted;
        }

        self.cached_sum += value;
        self.cached_square_sum += value * value;
        self.total_sample_count += 1;
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.len() == 0
    }

    /// number of samples ever added, including those already evicted from the window
    pub fn total_sample_count(&self) -> u64 {
        self.total_sample_count
    }

    pub fn mean(&self) -> f64 {
        if self.buf.len() == 0 {
            return 0.0;
        }
        self.cached_sum / self.buf.len() as f64
    }

    pub fn std_dev(&self) -> f64 {
        if self.buf.len() < 2 {
            // pragmatic value that serves the purpose of standard deviation in this context
            return 0.0;
        }

        let mean = self.mean();
        let diff_of_squares = self.cached_square_sum - mean * mean * self.buf.len() as f64;

        // cached aggregates can drift slightly below zero numerically
        (diff_of_squares.max(0.0) / (self.buf.len() - 1) as f64).sqrt()
    }

    /// The value below which ~99% of samples are expected to fall, assuming the samples are
    ///  roughly Gaussian: mean + 2.33 standard deviations. Never below the plain mean.
    pub fn upper_bound_99(&self) -> f64 {
        let bound = self.mean() + 2.33 * self.std_dev();
        std::cmp::max(OrderedFloat(bound), OrderedFloat(self.mean())).0
    }
}


enum BufferImpl<const N: usize> {
    Growing(Vec<f64>),
    Ring {
        buf: Vec<f64>,
        next: usize,
    },
}
impl<const N: usize> BufferImpl<N> {
    fn len(&self) -> usize {
        match self {
            BufferImpl::Growing(buf) => buf.len(),
            BufferImpl::Ring { buf, .. } => buf.len(),
        }
    }

    /// adds a new value, returning the value that was evicted to make room for it (if any)
    #[must_use]
    fn add_value(&mut self, value: f64) -> Option<f64> {
        match self {
            BufferImpl::Growing(buf) => {
                buf.push(value);
                if buf.len() == N {
                    let buf = std::mem::take(buf);
                    *self = BufferImpl::Ring { buf, next: 0 };
                }
                None
            }
            BufferImpl::Ring { buf, next } => {
                let evicted = buf[*next];
                buf[*next] = value;
                *next = (*next + 1) % N;
                Some(evicted)
            }
        }
    }
}


#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_empty_window() {
        let window: RollingWindow<4> = RollingWindow::new();
        assert_eq!(window.len(), 0);
        assert!(window.is_empty());
        assert_eq!(window.mean(), 0.0);
        assert_eq!(window.std_dev(), 0.0);
    }

    #[rstest]
    #[case::single(vec![3.0], 3.0, 0.0)]
    #[case::two(vec![1.0, 3.0], 2.0, std::f64::consts::SQRT_2)]
    #[case::constant(vec![5.0, 5.0, 5.0], 5.0, 0.0)]
    fn test_mean_std_dev(#[case] samples: Vec<f64>, #[case] mean: f64, #[case] std_dev: f64) {
        let mut window: RollingWindow<8> = RollingWindow::new();
        for s in samples {
            window.add_sample(s);
        }
        assert!((window.mean() - mean).abs() < 1e-9);
        assert!((window.std_dev() - std_dev).abs() < 1e-9);
    }

    #[test]
    fn test_eviction_forgets_old_samples() {
        let mut window: RollingWindow<3> = RollingWindow::new();
        window.add_sample(1000.0);
        for _ in 0..3 {
            window.add_sample(2.0);
        }

        // the outlier is fully evicted, only the three 2.0 samples remain
        assert_eq!(window.len(), 3);
        assert!((window.mean() - 2.0).abs() < 1e-9);
        assert!(window.std_dev() < 1e-9);
        assert_eq!(window.total_sample_count(), 4);
    }

    #[test]
    fn test_upper_bound_tracks_spread() {
        let mut window: RollingWindow<16> = RollingWindow::new();
        for s in [10.0, 12.0, 8.0, 11.0, 9.0] {
            window.add_sample(s);
        }
        assert!(window.upper_bound_99() > window.mean());

        let mut constant: RollingWindow<16> = RollingWindow::new();
        constant.add_sample(10.0);
        constant.add_sample(10.0);
        assert!((constant.upper_bound_99() - 10.0).abs() < 1e-9);
    }
}
