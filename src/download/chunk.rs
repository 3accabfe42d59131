//! Chunk jobs: one ranged request's worth of work within a download.
//!
//! Each job tracks two sets of byte counters: the in-flight set advanced
//! the moment a buffer is submitted to the assembler, and the confirmed
//! set advanced only when the assembler acks the write. Only confirmed
//! counters are safe to persist as resume checkpoints.

use serde::{Deserialize, Serialize};

use super::WorkerId;

/// Lifecycle state of a chunk job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    /// Waiting for a worker slot.
    Init,
    /// Assigned to a worker.
    Running,
    /// Interrupted with residual bytes; resumable from its checkpoint.
    Paused,
    /// All requested bytes delivered.
    Finished,
}

/// Whether the server honours range requests for this download.
///
/// `Yes` is recorded iff a response carried a `Content-Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Chunkable {
    /// No response observed yet.
    #[default]
    Unknown,
    /// Server returned `Content-Range`.
    Yes,
    /// Server ignored the range request.
    No,
}

/// Persistable snapshot of one unfinished chunk.
///
/// `offset` is the next byte the chunk will write (already advanced past
/// `received`), `size` the residual byte count to fetch. Feeding the
/// snapshot back into `resume` continues the download byte-exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkCheckpoint {
    /// Current URL of the chunk (post-redirect, `<referer` notation kept).
    pub url: String,
    /// Absolute offset of the next write.
    pub offset: u64,
    /// Residual bytes to fetch.
    pub size: u64,
    /// Bytes durably accepted so far.
    pub received: u64,
}

/// One ranged request's worth of work.
#[derive(Debug, Clone)]
pub(crate) struct ChunkJob {
    /// Current URL; a plain mutable field, rebound on redirect.
    pub url: String,
    /// Next absolute byte offset to write (in-flight).
    pub offset: u64,
    /// Remaining bytes expected (in-flight).
    pub size: u64,
    /// Bytes observed (in-flight; may not be durable yet).
    pub received: u64,
    /// Durable counterpart of `offset`.
    pub confirmed_offset: u64,
    /// Durable counterpart of `size`.
    pub confirmed_size: u64,
    /// Durable counterpart of `received`.
    pub confirmed_received: u64,
    /// Lifecycle state.
    pub state: ChunkState,
    /// Worker slot this job is scheduled under, while running.
    pub worker_id: Option<WorkerId>,
    /// The first chunk carries download-level response handling (size
    /// discovery, rename, chunk growth) and whole-download error
    /// propagation; the rest only update the size.
    pub first: bool,
}

impl ChunkJob {
    /// A fresh chunk covering `[offset, offset + size)`.
    pub fn new(url: impl Into<String>, offset: u64, size: u64, first: bool) -> Self {
        Self {
            url: url.into(),
            offset,
            size,
            received: 0,
            confirmed_offset: offset,
            confirmed_size: size,
            confirmed_received: 0,
            state: ChunkState::Init,
            worker_id: None,
            first,
        }
    }

    /// Rebuilds a chunk from a persisted checkpoint.
    pub fn from_checkpoint(checkpoint: &ChunkCheckpoint, first: bool) -> Self {
        Self {
            url: checkpoint.url.clone(),
            offset: checkpoint.offset,
            size: checkpoint.size,
            received: checkpoint.received,
            confirmed_offset: checkpoint.offset,
            confirmed_size: checkpoint.size,
            confirmed_received: checkpoint.received,
            state: ChunkState::Init,
            worker_id: None,
            first,
        }
    }

    /// Snapshot of the durable counters.
    pub fn checkpoint(&self) -> ChunkCheckpoint {
        ChunkCheckpoint {
            url: self.url.clone(),
            offset: self.confirmed_offset,
            size: self.confirmed_size,
            received: self.confirmed_received,
        }
    }

    /// Advances the in-flight counters when a buffer is submitted.
    ///
    /// The range request over-asks by one byte, so the final write of a
    /// chunk may exceed the nominal size; `size` saturates rather than
    /// underflowing.
    pub fn record_submitted(&mut self, len: u64) {
        self.offset += len;
        self.size = self.size.saturating_sub(len);
        self.received += len;
    }

    /// Advances the durable counters when the assembler acks a write.
    pub fn record_confirmed(&mut self, len: u64) {
        self.confirmed_offset += len;
        self.confirmed_size = self.confirmed_size.saturating_sub(len);
        self.confirmed_received += len;
    }

    /// Whether the job will not be scheduled again.
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, ChunkState::Paused | ChunkState::Finished)
    }

    /// Whether the job still owes bytes worth checkpointing.
    pub fn is_unfinished(&self) -> bool {
        self.state != ChunkState::Finished && self.confirmed_size > 0
    }
}
