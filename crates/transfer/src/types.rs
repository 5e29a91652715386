use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use dropstream_protocol::{JobId, ProgressEvent, percent_of};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::TransferError;
use crate::progress::ProgressChannel;

/// Lifecycle state of a transfer job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum JobState {
    Queued = 0,
    Active = 1,
    Succeeded = 2,
    Canceled = 3,
    Failed = 4,
}

impl JobState {
    /// Terminal states have no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Canceled | Self::Failed)
    }

    /// Returns `true` if `self -> next` is a legal transition.
    pub fn can_transition(self, next: JobState) -> bool {
        match self {
            Self::Queued => matches!(next, Self::Active | Self::Canceled | Self::Failed),
            Self::Active => next.is_terminal(),
            _ => false,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Queued,
            1 => Self::Active,
            2 => Self::Succeeded,
            3 => Self::Canceled,
            _ => Self::Failed,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Succeeded => "succeeded",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Snapshot of one file's transfer attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferJob {
    pub id: JobId,
    pub name: String,
    pub total_bytes: u64,
    pub bytes_transferred: u64,
    pub state: JobState,
}

impl TransferJob {
    pub fn percent(&self) -> f64 {
        percent_of(self.bytes_transferred, self.total_bytes)
    }
}

/// Mutable per-job state shared between the owning pump and its handles.
struct JobStatus {
    state: AtomicU8,
    bytes: AtomicU64,
    cancel: CancellationToken,
}

/// Cloneable view of a job: identity, live state and its cancel switch.
///
/// Only the pump owning the job advances its byte counter and state; handles
/// read them and request cancellation.
#[derive(Clone)]
pub struct JobHandle {
    id: JobId,
    name: Arc<str>,
    total_bytes: u64,
    status: Arc<JobStatus>,
    progress: ProgressChannel,
}

impl JobHandle {
    pub(crate) fn new(
        id: JobId,
        name: &str,
        total_bytes: u64,
        progress: ProgressChannel,
    ) -> Self {
        Self {
            id,
            name: Arc::from(name),
            total_bytes,
            status: Arc::new(JobStatus {
                state: AtomicU8::new(JobState::Queued as u8),
                bytes: AtomicU64::new(0),
                cancel: CancellationToken::new(),
            }),
            progress,
        }
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn state(&self) -> JobState {
        JobState::from_u8(self.status.state.load(Ordering::Acquire))
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.status.bytes.load(Ordering::Acquire)
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.status.cancel.is_cancelled()
    }

    /// Requests cancellation.
    ///
    /// A queued job goes straight to `Canceled` and will never start. An
    /// active job is signalled and stops at its next chunk boundary. Returns
    /// `false` if the job is already terminal, finishes before the signal
    /// lands, or a cancel was already requested.
    pub fn cancel(&self) -> bool {
        if self.status.cancel.is_cancelled() {
            return false;
        }
        loop {
            let current = self.state();
            if current.is_terminal() {
                return false;
            }
            if current == JobState::Queued {
                if self.try_transition(JobState::Queued, JobState::Canceled) {
                    self.status.cancel.cancel();
                    self.progress
                        .publish(ProgressEvent::canceled(self.id.clone(), 0.0));
                    info!(job_id = %self.id, name = %self.name, "queued transfer canceled");
                    return true;
                }
                // Lost the race against admission; re-read and retry.
                continue;
            }
            return self.signal_active();
        }
    }

    /// Signals an active job; `false` if it completed or failed first.
    fn signal_active(&self) -> bool {
        self.status.cancel.cancel();
        !matches!(self.state(), JobState::Succeeded | JobState::Failed)
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        self.status.cancel.cancelled().await
    }

    /// Returns the current state as a plain job record.
    pub fn snapshot(&self) -> TransferJob {
        TransferJob {
            id: self.id.clone(),
            name: self.name.to_string(),
            total_bytes: self.total_bytes,
            bytes_transferred: self.bytes_transferred(),
            state: self.state(),
        }
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.status.cancel.clone()
    }

    pub(crate) fn progress(&self) -> &ProgressChannel {
        &self.progress
    }

    /// Atomically moves `from -> to`; fails if the job is not in `from`.
    pub(crate) fn try_transition(&self, from: JobState, to: JobState) -> bool {
        if !from.can_transition(to) {
            return false;
        }
        self.status
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Adds `n` bytes to the counter and returns the new total.
    pub(crate) fn add_bytes(&self, n: u64) -> u64 {
        self.status.bytes.fetch_add(n, Ordering::AcqRel) + n
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("total_bytes", &self.total_bytes)
            .field("state", &self.state())
            .field("bytes_transferred", &self.bytes_transferred())
            .finish()
    }
}

/// Terminal result of one job.
#[derive(Debug)]
pub struct JobOutcome {
    pub job: TransferJob,
    /// Set when the job failed.
    pub error: Option<TransferError>,
}

impl JobOutcome {
    pub(crate) fn from_handle(handle: &JobHandle, error: Option<TransferError>) -> Self {
        Self {
            job: handle.snapshot(),
            error,
        }
    }

    pub fn state(&self) -> JobState {
        self.job.state
    }
}
