//! Round-trip latency tracking used to tune transport timeouts.

use std::collections::VecDeque;
use std::time::Duration;

const WINDOW: usize = 8;
const TIMEOUT_FACTOR: u32 = 4;

/// Sliding window of recent cycle latencies.
///
/// The filtered value is the mean of the window with the fastest and slowest
/// sample dropped, so a single slow reply does not inflate the timeout.
#[derive(Debug, Clone)]
pub struct LatencyFilter {
    samples: VecDeque<Duration>,
    min_timeout: Duration,
}

impl LatencyFilter {
    pub fn new(min_timeout: Duration) -> Self {
        LatencyFilter {
            samples: VecDeque::with_capacity(WINDOW),
            min_timeout,
        }
    }

    pub fn add(&mut self, sample: Duration) {
        if self.samples.len() == WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn filtered(&self) -> Option<Duration> {
        let n = self.samples.len();
        if n == 0 {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        if n < 3 {
            return Some(total / n as u32);
        }
        let min = self.samples.iter().min().copied().unwrap_or_default();
        let max = self.samples.iter().max().copied().unwrap_or_default();
        Some((total - min - max) / (n as u32 - 2))
    }

    /// Suggested per-request timeout, never below the family minimum.
    pub fn timeout(&self) -> Duration {
        self.filtered()
            .map(|latency| latency * TIMEOUT_FACTOR)
            .map_or(self.min_timeout, |t| t.max(self.min_timeout))
    }
}
