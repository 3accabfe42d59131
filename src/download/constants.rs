//! Constants for the download engine (chunking, buffering, timeouts).

use std::time::Duration;

/// Minimum chunk size. A download always starts as a single chunk of this
/// size; the layout only grows beyond one chunk when the server reports a
/// total size larger than this and honours range requests.
pub const MIN_CHUNK_SIZE: u64 = 20 * 1024 * 1024;

/// Bytes buffered per worker before a merged write is submitted to the
/// assembler.
pub const BUFFER_SIZE: usize = 256 * 1024;

/// Upper bound on buffered bytes per worker while a write is in flight.
/// Reaching it stops the response read until the write acks. The buffer can
/// exceed this by at most one network read.
pub const BUFFER_SIZE_CAP: usize = 4 * 1024 * 1024;

/// Bytes written between fsync checkpoints in the assembler. Acks carry
/// `synced = true` when a checkpoint was just taken, signalling that chunk
/// state is safe to persist.
pub const SYNC_INTERVAL: u64 = 16 * 1024 * 1024;

/// How long a protocol handler resolution stays cached, keyed on input URL.
pub const URL_RESOLVE_EXPIRE: Duration = Duration::from_secs(5 * 60);

/// Maximum redirects followed per worker attempt.
pub const MAX_REDIRECT_FOLLOW: u32 = 2;

/// Settle delay before re-issuing a redirected request.
pub const REDIRECT_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Width of the speed measurement window, in one-second buckets.
pub const SPEED_WINDOW_SECS: usize = 5;

/// Consecutive sub-threshold samples before a worker is reported starving.
pub const STARVE_SAMPLE_LIMIT: u32 = 3;

/// A worker sample counts as sub-threshold when its bucket stays below this
/// fraction of the worker's own windowed average.
pub const STARVE_RATE_FRACTION: f64 = 0.125;

/// Accumulated starve reports tolerated before a worker is restarted.
pub const SLOW_WORKER_TOLERANCE: u32 = 15;

/// Restarting a slow worker is only useful while the download is young
/// enough that its URLs have not expired.
pub const STALL_RESTART_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Default HTTP connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Fallback name for downloads whose name sanitizes to nothing.
pub const UNNAMED_FALLBACK: &str = "unnamed";
