use serde::Serialize;
use std::time::Duration;

/// Aggregated loss/latency over a History window
///
/// Latencies are in milliseconds. When every sample in the window was lost,
/// `best`, `worst`, `mean` and `stddev` are all NaN.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Metrics {
    pub packets_sent: u64,
    pub packets_lost: u64,
    pub best: f64,
    pub worst: f64,
    pub mean: f64,
    pub stddev: f64,
}

impl Metrics {
    /// Loss percentage (0-100)
    pub fn loss_pct(&self) -> f64 {
        if self.packets_sent == 0 {
            0.0
        } else {
            self.packets_lost as f64 / self.packets_sent as f64 * 100.0
        }
    }

    /// True if no sample in the window succeeded
    pub fn all_lost(&self) -> bool {
        self.packets_sent > 0 && self.packets_sent == self.packets_lost
    }
}

fn as_millis_f64(rtt: Duration) -> f64 {
    rtt.as_nanos() as f64 / 1_000_000.0
}

/// Fixed-capacity ring of probe outcomes for one address
///
/// `None` marks a lost probe.
#[derive(Debug, Clone)]
pub struct History {
    samples: Vec<Option<Duration>>,
    capacity: usize,
    position: usize,
    count: usize,
}

impl History {
    /// Ring holding the latest `capacity` samples (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: vec![None; capacity],
            capacity,
            position: 0,
            count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Append one sample, overwriting the oldest once full
    pub fn record(&mut self, sample: Option<Duration>) {
        self.samples[self.position] = sample;
        self.position = (self.position + 1) % self.capacity;
        if self.count < self.capacity {
            self.count += 1;
        }
    }

    /// Record a probe outcome; any error counts as a loss
    pub fn record_result<E>(&mut self, result: &Result<Duration, E>) {
        self.record(result.as_ref().ok().copied());
    }

    /// Aggregate the held samples; None if nothing was recorded
    ///
    /// Single pass using Welford's online algorithm; stddev is the
    /// population standard deviation.
    pub fn compute(&self) -> Option<Metrics> {
        if self.count == 0 {
            return None;
        }

        let mut lost: u64 = 0;
        let mut received: u64 = 0;
        let mut best = f64::INFINITY;
        let mut worst = f64::NEG_INFINITY;
        let mut mean = 0.0;
        let mut m2 = 0.0;

        // Held samples occupy [0, count) until the ring wraps, then all slots
        for sample in &self.samples[..self.count] {
            let Some(rtt) = sample else {
                lost += 1;
                continue;
            };
            let ms = as_millis_f64(*rtt);
            received += 1;
            best = best.min(ms);
            worst = worst.max(ms);

            let delta = ms - mean;
            mean += delta / received as f64;
            m2 += delta * (ms - mean);
        }

        let metrics = if received == 0 {
            Metrics {
                packets_sent: lost,
                packets_lost: lost,
                best: f64::NAN,
                worst: f64::NAN,
                mean: f64::NAN,
                stddev: f64::NAN,
            }
        } else {
            Metrics {
                packets_sent: lost + received,
                packets_lost: lost,
                best,
                worst,
                mean,
                stddev: (m2 / received as f64).sqrt(),
            }
        };
        Some(metrics)
    }

    /// Aggregate, then reset to empty
    ///
    /// Callers hold the History's lock across this call, so no sample can
    /// land between the read and the clear.
    pub fn compute_and_clear(&mut self) -> Option<Metrics> {
        let metrics = self.compute();
        self.clear();
        metrics
    }

    pub fn clear(&mut self) {
        self.position = 0;
        self.count = 0;
    }
}
