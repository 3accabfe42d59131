//! Windowed byte-rate accounting, per worker and aggregated.
//!
//! Rates are measured over a rolling window of one-second buckets. A
//! worker whose just-closed bucket repeatedly stays far below its own
//! windowed average is reported as starving so the manager can decide to
//! restart it.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tracing::debug;

use super::constants::{SPEED_WINDOW_SECS, STARVE_RATE_FRACTION, STARVE_SAMPLE_LIMIT};
use super::WorkerId;

/// Health verdict for a single worker sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerHealth {
    /// The worker is moving at a sane fraction of its recent rate.
    Healthy,
    /// The worker has been far below its recent rate for several
    /// consecutive samples.
    Starving,
}

/// Rolling window of per-second byte counts.
#[derive(Debug, Default)]
struct RateWindow {
    /// Closed one-second buckets, most recent last.
    buckets: VecDeque<u64>,
    /// The bucket currently being filled.
    current: u64,
}

impl RateWindow {
    fn add(&mut self, bytes: u64) {
        self.current += bytes;
    }

    /// Closes the current bucket, trims the window, and returns the closed
    /// value.
    fn rotate(&mut self, window: usize) -> u64 {
        let closed = self.current;
        self.current = 0;
        self.buckets.push_back(closed);
        while self.buckets.len() > window {
            self.buckets.pop_front();
        }
        closed
    }

    /// Average bytes/second across the closed buckets.
    fn average(&self) -> f64 {
        if self.buckets.is_empty() {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let sum: f64 = self.buckets.iter().map(|&b| b as f64).sum();
        #[allow(clippy::cast_precision_loss)]
        let len = self.buckets.len() as f64;
        sum / len
    }
}

#[derive(Debug, Default)]
struct WorkerMeter {
    window: RateWindow,
    /// Consecutive closed buckets below the starve threshold.
    below: u32,
    /// Closed buckets observed since init.
    samples: u32,
}

/// Byte-rate accounting across all live workers.
///
/// `add` is called from worker progress events; `rotate` is called once a
/// second by the manager's ticker and returns the aggregate windowed rate
/// for the speed sink.
#[derive(Debug)]
pub struct SpeedCalculator {
    window: usize,
    inner: Mutex<SpeedState>,
}

#[derive(Debug, Default)]
struct SpeedState {
    workers: HashMap<WorkerId, WorkerMeter>,
    global: RateWindow,
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(SPEED_WINDOW_SECS)
    }
}

impl SpeedCalculator {
    /// Creates a calculator with a window of `window_secs` one-second
    /// buckets.
    #[must_use]
    pub fn new(window_secs: usize) -> Self {
        Self {
            window: window_secs.max(1),
            inner: Mutex::new(SpeedState::default()),
        }
    }

    /// Starts accounting for a worker.
    pub fn init_worker(&self, worker_id: WorkerId) {
        let mut state = self.lock();
        state.workers.entry(worker_id).or_default();
    }

    /// Records observed bytes for a worker and reports its health.
    ///
    /// Returns `None` while there is not enough history to judge the
    /// worker either way.
    pub fn add(&self, worker_id: WorkerId, bytes: u64) -> Option<WorkerHealth> {
        let mut state = self.lock();
        state.global.add(bytes);
        let meter = state.workers.get_mut(&worker_id)?;
        meter.window.add(bytes);

        if meter.below >= STARVE_SAMPLE_LIMIT {
            Some(WorkerHealth::Starving)
        } else if meter.below == 0 && meter.samples >= 1 {
            Some(WorkerHealth::Healthy)
        } else {
            None
        }
    }

    /// Drops a worker from the aggregate.
    pub fn stop_worker(&self, worker_id: WorkerId) {
        let mut state = self.lock();
        state.workers.remove(&worker_id);
    }

    /// Closes the current one-second bucket for every meter and returns
    /// the aggregate windowed rate in bytes/second.
    pub fn rotate(&self) -> u64 {
        let mut state = self.lock();
        let window = self.window;
        for (worker_id, meter) in &mut state.workers {
            let closed = meter.window.rotate(window);
            meter.samples = meter.samples.saturating_add(1);
            let average = meter.window.average();
            #[allow(clippy::cast_precision_loss)]
            let closed_rate = closed as f64;
            if average > 0.0 && closed_rate < average * STARVE_RATE_FRACTION {
                meter.below = meter.below.saturating_add(1);
                if meter.below == STARVE_SAMPLE_LIMIT {
                    debug!(worker_id, "worker dropped below starve threshold");
                }
            } else {
                meter.below = 0;
            }
        }
        state.global.rotate(window);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let aggregate = state.global.average() as u64;
        aggregate
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SpeedState> {
        // The mutex is only held for short, non-awaiting sections; a
        // poisoned lock means a panic already happened elsewhere.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
