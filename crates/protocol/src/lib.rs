//! Wire types shared by the dropstream client and server.
//!
//! Uploads carry a job id, a declared file name and a declared size ahead of
//! the raw file bytes. Progress for a job is pushed back to observers as a
//! text event stream whose events are tagged with an [`EventKind`] and carry a
//! `{"loadPercent": n}` JSON payload.

pub mod constants;
pub mod sse;
pub mod types;

pub use constants::*;
pub use sse::{EventDecoder, encode_event};
pub use types::{EventKind, JobId, ProgressEvent, ProgressPayload, percent_of};

/// Errors produced while parsing wire values.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid job id: {0}")]
    InvalidJobId(String),

    #[error("unknown event kind: {0}")]
    UnknownEvent(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
