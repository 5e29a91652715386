//! Chunked file transfer with bounded concurrency, cooperative cancellation
//! and per-job progress events.
//!
//! The client side is a [`TransferScheduler`] that runs one [`TransferPump`]
//! per [`ByteSource`] under a concurrency ceiling. The server side is an
//! [`IngestSession`] that persists an inbound stream without ever leaving a
//! partial file behind. Both publish through a [`ProgressChannel`].

mod ingest;
mod progress;
mod pump;
mod scheduler;
mod sink;
mod source;
mod types;
mod validation;

pub use ingest::{
    DEFAULT_WRITE_BUFFER, IngestDestination, IngestOptions, IngestReport, IngestRequest,
    IngestSession, IngestState, PART_DIR, part_file_path,
};
pub use progress::{ProgressChannel, ProgressSubscription};
pub use pump::TransferPump;
pub use scheduler::{
    BatchCanceller, BatchLimits, BatchReport, SchedulerConfig, TransferBatch, TransferScheduler,
};
pub use sink::{ChunkSink, SinkConnector, WriterSink};
pub use source::ByteSource;
pub use types::{JobHandle, JobOutcome, JobState, TransferJob};
pub use validation::sanitize_file_name;

pub use dropstream_protocol::{EventKind, JobId, ProgressEvent};

/// Default chunk size: 256 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Smallest accepted chunk size.
pub const MIN_CHUNK_SIZE: usize = 16 * 1024;

/// Largest accepted chunk size.
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Default concurrency ceiling for a batch.
pub const DEFAULT_MAX_CONCURRENT: usize = 10;

/// Clamps a requested chunk size into the accepted range.
pub fn clamp_chunk_size(size: usize) -> usize {
    size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
}

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("source read failed: {0}")]
    SourceRead(#[source] std::io::Error),

    #[error("sink write failed: {0}")]
    SinkWrite(#[source] std::io::Error),

    #[error("transfer aborted")]
    Aborted,

    #[error("size mismatch: expected {expected} bytes, received {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("file too large: {size} bytes exceeds the limit of {limit}")]
    TooLarge { size: u64, limit: u64 },

    #[error("invalid file name: {0}")]
    InvalidName(String),

    #[error("batch limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("upload rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("transfer task failed: {0}")]
    Task(String),
}
