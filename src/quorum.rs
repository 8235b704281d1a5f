use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Minimum time between two quorum adjustments.
const ADJUSTMENT_INTERVAL: Duration = Duration::from_secs(5);

/// Number of latency samples kept in the sliding window.
const MAX_SAMPLES: usize = 100;

/// Average latency above which the network is considered slow.
const HIGH_LATENCY_THRESHOLD: Duration = Duration::from_secs(1);

/// Number of outstanding failures above which the network is considered unhealthy.
const FAILURE_THRESHOLD: usize = 3;

#[derive(Debug)]
struct QuorumState {
    current_r: usize,
    current_w: usize,
    current_n: usize,
    samples: VecDeque<Duration>,
    failure_count: usize,
    last_adjustment: Instant,
}

/// Adaptive read/write quorum controller.
///
/// Every operation reports its latency and outcome. At most once per adjustment interval the
/// controller grows the read quorum and shrinks the write quorum while the network looks slow or
/// unhealthy, and does the opposite otherwise. `R + W > N` holds after every adjustment.
#[derive(Debug)]
pub struct DynamicQuorum {
    min_r: usize,
    min_w: usize,
    adjustment_interval: Duration,
    state: Mutex<QuorumState>,
}

impl DynamicQuorum {
    /// Constructs a controller starting at its minimum read and write quorums, with the write
    /// quorum raised as needed so that read and write sets overlap.
    pub fn new(min_r: usize, min_w: usize, min_n: usize) -> Self {
        let current_n = min_n.max(1);
        let current_r = min_r;
        let mut current_w = min_w;
        if current_r + current_w <= current_n {
            current_w = current_n + 1 - current_r.min(current_n);
        }
        DynamicQuorum {
            min_r,
            min_w,
            adjustment_interval: ADJUSTMENT_INTERVAL,
            state: Mutex::new(QuorumState {
                current_r,
                current_w,
                current_n,
                samples: VecDeque::with_capacity(MAX_SAMPLES),
                failure_count: 0,
                last_adjustment: Instant::now(),
            }),
        }
    }

    /// Overrides the minimum time between two adjustments.
    pub fn with_adjustment_interval(mut self, interval: Duration) -> Self {
        self.adjustment_interval = interval;
        self
    }

    /// Records the latency and outcome of one operation, and adjusts the quorums if the last
    /// adjustment is older than the adjustment interval.
    pub fn record(&self, latency: Duration, success: bool) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.samples.push_back(latency);
        while state.samples.len() > MAX_SAMPLES {
            state.samples.pop_front();
        }
        if success {
            state.failure_count = state.failure_count.saturating_sub(1);
        } else {
            state.failure_count += 1;
        }

        let now = Instant::now();
        if now.duration_since(state.last_adjustment) < self.adjustment_interval {
            return;
        }
        state.last_adjustment = now;

        let total: Duration = state.samples.iter().sum();
        let average = total / state.samples.len() as u32;
        let n = state.current_n;
        let ceiling = n.saturating_sub(1);
        let (mut r, mut w) = (state.current_r, state.current_w);
        if average > HIGH_LATENCY_THRESHOLD || state.failure_count > FAILURE_THRESHOLD {
            r = (r + 1).min(ceiling).max(self.min_r);
            w = w.saturating_sub(1).max(self.min_w);
        } else {
            r = r.saturating_sub(1).max(self.min_r);
            w = (w + 1).min(ceiling).max(self.min_w);
        }
        if r + w <= n {
            w = n - r + 1;
        }
        state.current_r = r;
        state.current_w = w;
        debug!(
            "Adjusted quorum: R={}, W={}, N={} (latency={:?}, failures={})",
            r, w, n, average, state.failure_count,
        );
    }

    /// Returns the current read quorum.
    pub fn read_quorum(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).current_r
    }

    /// Returns the current write quorum.
    pub fn write_quorum(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).current_w
    }

    /// Returns the number of replicas the quorums are computed against.
    pub fn total_replicas(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).current_n
    }

    /// Returns the current failure counter.
    pub fn failure_count(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).failure_count
    }
}
