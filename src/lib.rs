//! Downpour — a parallel, resumable, chunked HTTP/HTTPS download engine.
//!
//! The crate turns a set of mirror URLs for a single logical file into a
//! completed file on disk: it plans a chunk layout from what the server
//! advertises, runs concurrent range-request workers against one assembly
//! file, throttles their combined bandwidth, survives transient network
//! failures, and persists enough chunk state to resume later.
//!
//! # Architecture
//!
//! - [`download`] — the engine: manager, workers, assembler, throttle,
//!   speed accounting, chunk checkpoints, filename reservation
//! - [`resolver`] — pluggable protocol handlers turning custom-scheme
//!   inputs into concrete download URLs
//! - [`auth`] — host cookie store consulted per request

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod download;
pub mod resolver;

// Re-export commonly used types
pub use auth::{CookieLine, CookieStore};
pub use download::{
    BandwidthFn, BandwidthThrottle, ChunkCheckpoint, Chunkable, CompletionHandle, DownloadError,
    DownloadManager, DownloadManagerConfig, DownloadOutcome, DownloadRequest, FileAssembler,
    FileExistsCb, ProgressCb, ProgressUpdate, RedownloadMode, ResumeRequest, SpeedCalculator,
    SpeedCb, WorkerHealth, WriteAck,
};
pub use resolver::{HandlerRegistry, ProtocolHandler, ResolveError};
