use std::io;
use std::time::Duration;

use dropstream_protocol::{JobId, ProgressEvent, percent_of};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::progress::ProgressChannel;
use crate::sink::ChunkSink;
use crate::source::ByteSource;
use crate::types::{JobHandle, JobOutcome, JobState};
use crate::{DEFAULT_CHUNK_SIZE, TransferError, clamp_chunk_size};

/// Readiness waits shorter than this are not worth a log line.
const BACKPRESSURE_LOG_THRESHOLD: Duration = Duration::from_millis(50);

/// Streams one [`ByteSource`] into one [`ChunkSink`].
///
/// Each cycle waits for the sink to be ready, reads one chunk, checks for
/// cancellation, writes the chunk and publishes a `progress` event. Exactly
/// one terminal event is published when the pump stops.
pub struct TransferPump<S> {
    handle: JobHandle,
    source: ByteSource,
    sink: S,
    chunk_size: usize,
}

impl<S: ChunkSink> TransferPump<S> {
    /// Creates a pump for a standalone job with a fresh id.
    pub fn new(source: ByteSource, sink: S, progress: ProgressChannel) -> Self {
        let handle = JobHandle::new(
            JobId::generate(),
            source.name(),
            source.total_bytes(),
            progress,
        );
        Self::for_job(handle, source, sink)
    }

    pub(crate) fn for_job(handle: JobHandle, source: ByteSource, sink: S) -> Self {
        Self {
            handle,
            source,
            sink,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Sets the chunk size (clamped to the accepted range).
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = clamp_chunk_size(size);
        self
    }

    /// Handle for observing or canceling this pump's job.
    pub fn handle(&self) -> &JobHandle {
        &self.handle
    }

    /// Runs the job to a terminal state.
    pub async fn run(mut self) -> JobOutcome {
        let handle = self.handle.clone();
        if !handle.try_transition(JobState::Queued, JobState::Active)
            && handle.state() != JobState::Active
        {
            // Canceled before it started.
            self.sink.abort().await;
            return JobOutcome::from_handle(&handle, None);
        }

        debug!(
            job_id = %handle.id(),
            name = %handle.name(),
            total_bytes = handle.total_bytes(),
            "transfer started"
        );

        let result = self.pump().await;
        let percent = percent_of(handle.bytes_transferred(), handle.total_bytes());

        match result {
            Ok(()) => {
                handle.try_transition(JobState::Active, JobState::Succeeded);
                handle
                    .progress()
                    .publish(ProgressEvent::success(handle.id().clone()));
                info!(
                    job_id = %handle.id(),
                    name = %handle.name(),
                    bytes = handle.bytes_transferred(),
                    "transfer succeeded"
                );
                JobOutcome::from_handle(&handle, None)
            }
            Err(TransferError::Aborted) => {
                self.sink.abort().await;
                handle.try_transition(JobState::Active, JobState::Canceled);
                handle
                    .progress()
                    .publish(ProgressEvent::canceled(handle.id().clone(), percent));
                info!(
                    job_id = %handle.id(),
                    name = %handle.name(),
                    bytes = handle.bytes_transferred(),
                    "transfer canceled"
                );
                JobOutcome::from_handle(&handle, None)
            }
            Err(e) => {
                self.sink.abort().await;
                handle.try_transition(JobState::Active, JobState::Failed);
                handle
                    .progress()
                    .publish(ProgressEvent::failed(handle.id().clone(), percent));
                warn!(
                    job_id = %handle.id(),
                    name = %handle.name(),
                    bytes = handle.bytes_transferred(),
                    error = %e,
                    "transfer failed"
                );
                JobOutcome::from_handle(&handle, Some(e))
            }
        }
    }

    async fn pump(&mut self) -> Result<(), TransferError> {
        let total = self.handle.total_bytes();
        let cancel = self.handle.cancel_token();
        let job_id = self.handle.id().clone();

        let buf_len = (self.chunk_size as u64).min(total).max(1) as usize;
        let mut buf = vec![0u8; buf_len];
        let mut transferred = self.handle.bytes_transferred();

        while transferred < total {
            let wait_started = Instant::now();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Aborted),
                ready = self.sink.ready() => ready.map_err(TransferError::SinkWrite)?,
            }
            let waited = wait_started.elapsed();
            if waited >= BACKPRESSURE_LOG_THRESHOLD {
                trace!(
                    %job_id,
                    waited_ms = waited.as_millis() as u64,
                    "sink ready again, resuming reads"
                );
            }

            let want = (total - transferred).min(buf.len() as u64) as usize;
            let n = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Aborted),
                read = self.source.read(&mut buf[..want]) => read.map_err(TransferError::SourceRead)?,
            };
            if n == 0 {
                return Err(TransferError::SourceRead(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("source ended after {transferred} of {total} bytes"),
                )));
            }

            if cancel.is_cancelled() {
                return Err(TransferError::Aborted);
            }

            self.sink
                .write_chunk(&buf[..n])
                .await
                .map_err(TransferError::SinkWrite)?;

            transferred = self.handle.add_bytes(n as u64);
            self.handle.progress().publish(ProgressEvent::progress(
                job_id.clone(),
                percent_of(transferred, total),
            ));
        }

        self.sink.finish().await
    }
}
