use std::collections::HashMap;
use std::time::Instant;

/// Weight of each new sample in the jitter EWMA.
pub const JITTER_ALPHA: f64 = 0.125;

/// Smoothed estimate of packet inter-arrival variation, in milliseconds.
///
/// Arrivals are compared only against the previous arrival for the *same*
/// frame timestamp, so the estimate reflects how spread out the fragments
/// of one frame are on the wire:
///
/// ```text
/// d      = |arrival - previous_arrival(timestamp)|
/// jitter = jitter + α (|d - jitter| - jitter)
/// ```
///
/// The per-timestamp bookkeeping is dropped with [`forget`](Self::forget)
/// when the frame is resolved; the estimate itself carries over.
#[derive(Debug, Default)]
pub struct JitterEstimator {
    jitter_ms: f64,
    last_arrival: HashMap<u32, Instant>,
}

impl JitterEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an arrival for `timestamp` and update the estimate when this
    /// is not the first fragment seen for it.
    pub fn observe(&mut self, timestamp: u32, arrival: Instant) {
        if let Some(previous) = self.last_arrival.insert(timestamp, arrival) {
            let inter_arrival = abs_diff_ms(arrival, previous);
            let sample = (inter_arrival - self.jitter_ms).abs();
            self.jitter_ms += JITTER_ALPHA * (sample - self.jitter_ms);
            tracing::trace!(timestamp, inter_arrival, jitter_ms = self.jitter_ms, "jitter updated");
        }
    }

    /// Current estimate in milliseconds.
    pub fn current_estimate(&self) -> f64 {
        self.jitter_ms
    }

    /// Most recent arrival recorded for `timestamp`.
    pub fn last_arrival(&self, timestamp: u32) -> Option<Instant> {
        self.last_arrival.get(&timestamp).copied()
    }

    /// Drop the arrival bookkeeping of a resolved timestamp.
    pub fn forget(&mut self, timestamp: u32) {
        self.last_arrival.remove(&timestamp);
    }

    /// Number of timestamps with arrival bookkeeping.
    pub fn tracked(&self) -> usize {
        self.last_arrival.len()
    }
}

fn abs_diff_ms(a: Instant, b: Instant) -> f64 {
    let d = if a >= b { a - b } else { b - a };
    d.as_secs_f64() * 1000.0
}
