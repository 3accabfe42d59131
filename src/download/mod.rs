//! Parallel, resumable, chunked HTTP/HTTPS download engine.
//!
//! Given a set of mirror URLs for one logical file, the
//! [`DownloadManager`] coordinates multiple concurrent range-request
//! workers against one on-disk assembly file, adapts the chunk layout to
//! what the server supports, enforces a global bandwidth cap, restarts
//! stalled workers, and hands out chunk checkpoints that make an
//! interrupted download resumable.
//!
//! # Components
//!
//! - `manager` — public surface: enqueue/resume/stop/pause, scheduling
//! - `worker` (internal) — one ranged request streamed to disk
//! - [`assembler`] — owner of the output file, absolute-offset writes
//! - [`throttle`] — shared token bucket over all body streams
//! - [`speed`] — windowed rate accounting and starvation detection
//! - [`chunk`] — chunk jobs and persistable checkpoints
//! - [`filename`] — sanitization and atomic name reservation
//!
//! # Example
//!
//! ```no_run
//! use downpour::{DownloadManager, DownloadManagerConfig, DownloadRequest, HandlerRegistry};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cfg = DownloadManagerConfig::new("./downloads");
//! let manager = DownloadManager::new(cfg, HandlerRegistry::new())?;
//! let handle = manager
//!     .enqueue(DownloadRequest::new(
//!         "mod-42",
//!         vec!["https://cdn.example.com/mod.zip".to_string()],
//!     ))
//!     .await?;
//! let outcome = handle.wait().await?;
//! println!("saved to {}", outcome.file_path.display());
//! # Ok(())
//! # }
//! ```

pub mod assembler;
pub mod chunk;
pub mod constants;
mod error;
pub mod filename;
mod manager;
pub mod speed;
pub mod throttle;
mod worker;

/// Identifier of one worker slot assignment, monotonically increasing.
pub type WorkerId = u64;

pub use assembler::{FileAssembler, WriteAck};
pub use chunk::{ChunkCheckpoint, ChunkState, Chunkable};
pub use error::DownloadError;
pub use filename::{reserve_unique_name, sanitize_filename, FileExistsCb, RedownloadMode};
pub use manager::{
    CompletionHandle, DownloadManager, DownloadManagerConfig, DownloadOutcome, DownloadRequest,
    ProgressCb, ProgressUpdate, ResumeRequest, SpeedCb,
};
pub use speed::{SpeedCalculator, WorkerHealth};
pub use throttle::{BandwidthFn, BandwidthThrottle};
