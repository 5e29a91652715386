use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ProtocolError;
use crate::constants::MAX_JOB_ID_LEN;

/// Opaque transfer identifier correlating client job, server ingest session
/// and progress subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(String);

impl JobId {
    /// Generates a fresh random id (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Validates an id received from a peer.
    ///
    /// Accepts 1..=128 bytes of ASCII letters, digits, `-` and `_`.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        if raw.is_empty() || raw.len() > MAX_JOB_ID_LEN {
            return Err(ProtocolError::InvalidJobId(format!(
                "length {} outside 1..={MAX_JOB_ID_LEN}",
                raw.len()
            )));
        }
        if !raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(ProtocolError::InvalidJobId(raw.escape_debug().to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Tag of a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Progress,
    Success,
    Failed,
    Canceled,
}

impl EventKind {
    /// Wire tag used as the event name in the text event stream.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Progress => "progress",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Returns `true` for the kinds that end a job's stream.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Progress)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "progress" => Ok(Self::Progress),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }
}

/// JSON payload of every progress event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    pub load_percent: f64,
}

/// A per-job progress or terminal notification.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub kind: EventKind,
    /// Percentage in `[0, 100]`.
    pub percent: f64,
}

impl ProgressEvent {
    pub fn new(job_id: JobId, kind: EventKind, percent: f64) -> Self {
        Self {
            job_id,
            kind,
            percent: clamp_percent(percent),
        }
    }

    pub fn progress(job_id: JobId, percent: f64) -> Self {
        Self::new(job_id, EventKind::Progress, percent)
    }

    pub fn success(job_id: JobId) -> Self {
        Self::new(job_id, EventKind::Success, 100.0)
    }

    pub fn failed(job_id: JobId, percent: f64) -> Self {
        Self::new(job_id, EventKind::Failed, percent)
    }

    pub fn canceled(job_id: JobId, percent: f64) -> Self {
        Self::new(job_id, EventKind::Canceled, percent)
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }

    pub fn payload(&self) -> ProgressPayload {
        ProgressPayload {
            load_percent: self.percent,
        }
    }
}

/// Computes `done / total * 100` clamped to `[0, 100]`.
///
/// A zero total counts as complete.
pub fn percent_of(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    clamp_percent(done as f64 / total as f64 * 100.0)
}

fn clamp_percent(p: f64) -> f64 {
    if p.is_nan() { 0.0 } else { p.clamp(0.0, 100.0) }
}
