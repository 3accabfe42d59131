//! Global bandwidth throttling via a shared token bucket.
//!
//! Every worker body stream acquires tokens from the same bucket before
//! forwarding bytes, so the summed rate across all live streams never
//! exceeds the caller's ceiling. The ceiling is re-polled on every
//! acquisition, letting the cap change while downloads are in flight.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Caller-supplied bandwidth ceiling in bytes/second, polled continuously.
/// `None` or `Some(0)` means unlimited.
pub type BandwidthFn = Arc<dyn Fn() -> Option<u64> + Send + Sync>;

/// Longest single sleep between cap re-polls while waiting for tokens.
const REFILL_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Shared token bucket applied to every worker's response body.
///
/// Cloning is cheap and shares the bucket; one clone per worker stream is
/// the intended usage. Burst capacity is one second's worth of the
/// current cap.
#[derive(Clone)]
pub struct BandwidthThrottle {
    inner: Arc<ThrottleInner>,
}

struct ThrottleInner {
    max_bandwidth: Option<BandwidthFn>,
    bucket: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl std::fmt::Debug for BandwidthThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BandwidthThrottle")
            .field("unlimited", &self.inner.max_bandwidth.is_none())
            .finish()
    }
}

impl BandwidthThrottle {
    /// Creates a throttle polling the given ceiling function.
    #[must_use]
    pub fn new(max_bandwidth: BandwidthFn) -> Self {
        Self {
            inner: Arc::new(ThrottleInner {
                max_bandwidth: Some(max_bandwidth),
                bucket: Mutex::new(BucketState {
                    tokens: 0.0,
                    last_refill: Instant::now(),
                }),
            }),
        }
    }

    /// Creates a throttle that never delays.
    #[must_use]
    pub fn unlimited() -> Self {
        Self {
            inner: Arc::new(ThrottleInner {
                max_bandwidth: None,
                bucket: Mutex::new(BucketState {
                    tokens: 0.0,
                    last_refill: Instant::now(),
                }),
            }),
        }
    }

    /// Whether a ceiling function was configured at all.
    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.inner.max_bandwidth.is_none()
    }

    /// Waits until `bytes` may pass under the global cap.
    ///
    /// Reads larger than one second's burst drive the bucket negative
    /// instead of deadlocking; the debt is paid off before the next
    /// acquisition proceeds.
    pub async fn acquire(&self, bytes: usize) {
        let Some(rate_fn) = &self.inner.max_bandwidth else {
            return;
        };

        #[allow(clippy::cast_precision_loss)]
        let need = bytes as f64;

        loop {
            // Zero or absent cap means unlimited; re-checked every pass so
            // a cap change takes effect mid-wait.
            let Some(rate) = rate_fn().filter(|r| *r > 0) else {
                return;
            };
            #[allow(clippy::cast_precision_loss)]
            let rate_f = rate as f64;

            let wait = {
                let mut bucket = self.inner.bucket.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.last_refill = now;
                bucket.tokens = (bucket.tokens + elapsed * rate_f).min(rate_f);

                let threshold = need.min(rate_f);
                if bucket.tokens >= threshold {
                    bucket.tokens -= need;
                    return;
                }
                Duration::from_secs_f64((threshold - bucket.tokens) / rate_f)
            };

            tokio::time::sleep(wait.min(REFILL_POLL_INTERVAL)).await;
        }
    }
}
