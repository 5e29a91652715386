use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dropstream_protocol::{JobId, ProgressEvent};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::progress::ProgressChannel;
use crate::pump::TransferPump;
use crate::sink::SinkConnector;
use crate::source::ByteSource;
use crate::types::{JobHandle, JobOutcome, JobState};
use crate::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_CONCURRENT, TransferError, clamp_chunk_size};

/// Optional caps applied when a batch is prepared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_files: Option<usize>,
    pub max_total_bytes: Option<u64>,
}

impl BatchLimits {
    fn check(&self, sources: &[ByteSource]) -> Result<(), TransferError> {
        if let Some(max) = self.max_files {
            if sources.len() > max {
                return Err(TransferError::LimitExceeded(format!(
                    "{} files exceeds the limit of {max}",
                    sources.len()
                )));
            }
        }
        if let Some(max) = self.max_total_bytes {
            let total = sources
                .iter()
                .fold(0u64, |acc, s| acc.saturating_add(s.total_bytes()));
            if total > max {
                return Err(TransferError::LimitExceeded(format!(
                    "{total} bytes exceeds the limit of {max}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Ceiling on simultaneously active jobs. Zero is treated as one.
    pub max_concurrent: usize,
    pub chunk_size: usize,
    pub limits: BatchLimits,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            limits: BatchLimits::default(),
        }
    }
}

/// Runs batches of transfers through a [`SinkConnector`].
pub struct TransferScheduler<C> {
    config: SchedulerConfig,
    connector: Arc<C>,
    progress: ProgressChannel,
}

impl<C: SinkConnector> TransferScheduler<C> {
    pub fn new(connector: C, config: SchedulerConfig) -> Self {
        Self {
            config,
            connector: Arc::new(connector),
            progress: ProgressChannel::new(),
        }
    }

    /// Publishes job events into `progress` instead of a private channel.
    pub fn with_progress(mut self, progress: ProgressChannel) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn progress(&self) -> &ProgressChannel {
        &self.progress
    }

    /// Creates one queued job per source, in order.
    pub fn prepare(&self, sources: Vec<ByteSource>) -> Result<TransferBatch<C>, TransferError> {
        self.config.limits.check(&sources)?;

        let jobs = sources
            .into_iter()
            .map(|source| {
                let handle = JobHandle::new(
                    JobId::generate(),
                    source.name(),
                    source.total_bytes(),
                    self.progress.clone(),
                );
                (handle, source)
            })
            .collect();

        Ok(TransferBatch {
            jobs,
            connector: Arc::clone(&self.connector),
            max_concurrent: self.config.max_concurrent.max(1),
            chunk_size: clamp_chunk_size(self.config.chunk_size),
        })
    }
}

/// A prepared set of jobs, not yet started.
pub struct TransferBatch<C> {
    jobs: Vec<(JobHandle, ByteSource)>,
    connector: Arc<C>,
    max_concurrent: usize,
    chunk_size: usize,
}

impl<C: SinkConnector> TransferBatch<C> {
    /// Handles in input order. They stay valid while and after the batch runs.
    pub fn handles(&self) -> Vec<JobHandle> {
        self.jobs.iter().map(|(h, _)| h.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Cancels every job; returns how many accepted the request.
    pub fn cancel_all(&self) -> usize {
        self.canceller().cancel_all()
    }

    /// Detached handle for canceling the batch while it runs.
    pub fn canceller(&self) -> BatchCanceller {
        BatchCanceller {
            handles: self.handles().into(),
        }
    }

    /// Runs every job to a terminal state.
    ///
    /// Jobs are admitted in input order as slots free up; each admitted job
    /// runs on its own task.
    pub async fn run(self) -> BatchReport {
        let job_count = self.jobs.len();
        let slots = Arc::new(Semaphore::new(self.max_concurrent));
        let gauge = Arc::new(ActiveGauge::default());
        let handles = self.handles();
        let mut tasks = JoinSet::new();

        info!(
            jobs = job_count,
            max_concurrent = self.max_concurrent,
            "batch started"
        );

        for (index, (handle, source)) in self.jobs.into_iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = handle.cancelled() => {
                    debug!(job_id = %handle.id(), "skipping canceled job");
                    continue;
                }
                permit = Arc::clone(&slots).acquire_owned() => permit,
            };
            let Ok(permit) = permit else {
                break;
            };

            if !handle.try_transition(JobState::Queued, JobState::Active) {
                continue;
            }

            let slot = ConcurrencySlot::new(permit, Arc::clone(&gauge));
            let connector = Arc::clone(&self.connector);
            let chunk_size = self.chunk_size;
            tasks.spawn(async move {
                let outcome = run_job(connector.as_ref(), handle, source, chunk_size).await;
                drop(slot);
                (index, outcome)
            });
        }

        let mut outcomes: Vec<Option<JobOutcome>> = (0..job_count).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(e) => warn!(error = %e, "transfer task did not complete"),
            }
        }

        let outcomes: Vec<JobOutcome> = outcomes
            .into_iter()
            .zip(&handles)
            .map(|(outcome, handle)| outcome.unwrap_or_else(|| unfinished_outcome(handle)))
            .collect();

        let report = BatchReport::new(outcomes, gauge.peak());
        info!(
            succeeded = report.succeeded,
            canceled = report.canceled,
            failed = report.failed,
            bytes = report.bytes_transferred(),
            peak_active = report.peak_active,
            "batch finished"
        );
        report
    }
}

/// Cancels a whole batch, e.g. from a signal handler.
#[derive(Debug, Clone)]
pub struct BatchCanceller {
    handles: Arc<[JobHandle]>,
}

impl BatchCanceller {
    /// Cancels every job that is not yet terminal; returns how many accepted
    /// the request.
    pub fn cancel_all(&self) -> usize {
        self.handles.iter().filter(|h| h.cancel()).count()
    }
}

async fn run_job<C: SinkConnector>(
    connector: &C,
    handle: JobHandle,
    source: ByteSource,
    chunk_size: usize,
) -> JobOutcome {
    let job = handle.snapshot();
    let sink = tokio::select! {
        biased;
        _ = handle.cancelled() => {
            handle.try_transition(JobState::Active, JobState::Canceled);
            handle
                .progress()
                .publish(ProgressEvent::canceled(handle.id().clone(), 0.0));
            info!(job_id = %handle.id(), name = %handle.name(), "transfer canceled while connecting");
            return JobOutcome::from_handle(&handle, None);
        }
        sink = connector.connect(&job) => sink,
    };

    match sink {
        Ok(sink) => {
            TransferPump::for_job(handle, source, sink)
                .with_chunk_size(chunk_size)
                .run()
                .await
        }
        Err(e) => {
            handle.try_transition(JobState::Active, JobState::Failed);
            handle
                .progress()
                .publish(ProgressEvent::failed(handle.id().clone(), 0.0));
            warn!(job_id = %handle.id(), name = %handle.name(), error = %e, "could not open sink");
            JobOutcome::from_handle(&handle, Some(e))
        }
    }
}

/// Outcome for a job whose task never reported back.
fn unfinished_outcome(handle: &JobHandle) -> JobOutcome {
    if handle.state() == JobState::Canceled {
        return JobOutcome::from_handle(handle, None);
    }
    let failed = handle.try_transition(JobState::Queued, JobState::Failed)
        || handle.try_transition(JobState::Active, JobState::Failed);
    if failed {
        handle.progress().publish(ProgressEvent::failed(
            handle.id().clone(),
            handle.snapshot().percent(),
        ));
    }
    JobOutcome::from_handle(
        handle,
        Some(TransferError::Task(format!(
            "job {} ended without an outcome",
            handle.id()
        ))),
    )
}

/// Current and peak number of admitted jobs.
#[derive(Debug, Default)]
struct ActiveGauge {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ActiveGauge {
    fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }
}

/// One of the batch's N concurrency slots, held for the life of a job.
struct ConcurrencySlot {
    _permit: OwnedSemaphorePermit,
    gauge: Arc<ActiveGauge>,
}

impl ConcurrencySlot {
    fn new(permit: OwnedSemaphorePermit, gauge: Arc<ActiveGauge>) -> Self {
        let now = gauge.active.fetch_add(1, Ordering::AcqRel) + 1;
        gauge.peak.fetch_max(now, Ordering::AcqRel);
        Self {
            _permit: permit,
            gauge,
        }
    }
}

impl Drop for ConcurrencySlot {
    fn drop(&mut self) {
        // Runs before the permit field is released.
        self.gauge.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Terminal results of a batch.
#[derive(Debug)]
pub struct BatchReport {
    /// One outcome per job, in input order.
    pub outcomes: Vec<JobOutcome>,
    pub succeeded: usize,
    pub canceled: usize,
    pub failed: usize,
    /// Highest number of jobs that were active at the same time.
    pub peak_active: usize,
}

impl BatchReport {
    fn new(outcomes: Vec<JobOutcome>, peak_active: usize) -> Self {
        let count = |state| outcomes.iter().filter(|o| o.state() == state).count();
        let succeeded = count(JobState::Succeeded);
        let canceled = count(JobState::Canceled);
        let failed = count(JobState::Failed);
        Self {
            outcomes,
            succeeded,
            canceled,
            failed,
            peak_active,
        }
    }

    /// Sum of bytes moved by every job.
    pub fn bytes_transferred(&self) -> u64 {
        self.outcomes.iter().map(|o| o.job.bytes_transferred).sum()
    }

    pub fn all_succeeded(&self) -> bool {
        self.succeeded == self.outcomes.len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io;
    use std::sync::Mutex;
    use std::time::Duration;

    use dropstream_protocol::EventKind;

    use super::*;
    use crate::sink::ChunkSink;
    use crate::types::TransferJob;

    #[derive(Default)]
    struct Recorder {
        files: Mutex<HashMap<String, Vec<u8>>>,
        connects: Mutex<Vec<String>>,
        live: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Recorder {
        fn connected(&self, name: &str) -> bool {
            self.connects.lock().unwrap().iter().any(|n| n == name)
        }

        fn stored(&self, name: &str) -> Option<Vec<u8>> {
            self.files.lock().unwrap().get(name).cloned()
        }
    }

    #[derive(Default)]
    struct MemoryConnector {
        recorder: Arc<Recorder>,
        write_delay: Duration,
        refuse: Option<String>,
    }

    impl SinkConnector for MemoryConnector {
        type Sink = MemorySink;

        async fn connect(&self, job: &TransferJob) -> Result<MemorySink, TransferError> {
            self.recorder.connects.lock().unwrap().push(job.name.clone());
            if self.refuse.as_deref() == Some(job.name.as_str()) {
                return Err(TransferError::Rejected {
                    status: 500,
                    message: "refused".into(),
                });
            }
            let live = self.recorder.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.recorder.peak.fetch_max(live, Ordering::SeqCst);
            Ok(MemorySink {
                name: job.name.clone(),
                buf: Vec::new(),
                delay: self.write_delay,
                recorder: Arc::clone(&self.recorder),
            })
        }
    }

    struct MemorySink {
        name: String,
        buf: Vec<u8>,
        delay: Duration,
        recorder: Arc<Recorder>,
    }

    impl ChunkSink for MemorySink {
        async fn ready(&mut self) -> io::Result<()> {
            Ok(())
        }

        async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.buf.extend_from_slice(chunk);
            Ok(())
        }

        async fn finish(&mut self) -> Result<(), TransferError> {
            self.recorder
                .files
                .lock()
                .unwrap()
                .insert(self.name.clone(), std::mem::take(&mut self.buf));
            Ok(())
        }

        async fn abort(&mut self) {}
    }

    impl Drop for MemorySink {
        fn drop(&mut self) {
            self.recorder.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn source(name: &str, len: usize) -> ByteSource {
        ByteSource::from_bytes(name, (0..len).map(|i| (i % 256) as u8).collect())
    }

    fn scheduler(connector: MemoryConnector, max_concurrent: usize) -> TransferScheduler<MemoryConnector> {
        TransferScheduler::new(
            connector,
            SchedulerConfig {
                max_concurrent,
                chunk_size: 16 * 1024,
                ..Default::default()
            },
        )
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn three_small_files_two_slots() {
        let connector = MemoryConnector::default();
        let recorder = Arc::clone(&connector.recorder);
        let sched = scheduler(connector, 2);
        let batch = sched
            .prepare(vec![source("a", 0), source("b", 1024), source("c", 2048)])
            .unwrap();

        let report = batch.run().await;
        assert!(report.all_succeeded());
        assert_eq!(report.succeeded, 3);
        assert_eq!(report.bytes_transferred(), 3072);
        assert!(report.peak_active <= 2);
        assert!(recorder.peak.load(Ordering::SeqCst) <= 2);

        for (name, len) in [("a", 0), ("b", 1024), ("c", 2048)] {
            assert_eq!(recorder.stored(name).unwrap(), source_bytes(len));
        }
        let names: Vec<_> = report.outcomes.iter().map(|o| o.job.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    fn source_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 256) as u8).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn active_jobs_never_exceed_ceiling() {
        for n in [1, 2, 3, 5] {
            let connector = MemoryConnector {
                write_delay: Duration::from_millis(10),
                ..Default::default()
            };
            let recorder = Arc::clone(&connector.recorder);
            let sources = (0..8).map(|i| source(&format!("f{i}"), 64 * 1024)).collect();
            let report = scheduler(connector, n).prepare(sources).unwrap().run().await;

            assert_eq!(report.succeeded, 8);
            assert_eq!(report.peak_active, n);
            assert!(recorder.peak.load(Ordering::SeqCst) <= n);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_above_batch_size_runs_everything_at_once() {
        let connector = MemoryConnector {
            write_delay: Duration::from_millis(10),
            ..Default::default()
        };
        let sources = (0..3).map(|i| source(&format!("f{i}"), 32 * 1024)).collect();
        let report = scheduler(connector, 10).prepare(sources).unwrap().run().await;
        assert_eq!(report.succeeded, 3);
        assert_eq!(report.peak_active, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_ceiling_is_one() {
        let connector = MemoryConnector {
            write_delay: Duration::from_millis(10),
            ..Default::default()
        };
        let sources = (0..3).map(|i| source(&format!("f{i}"), 32 * 1024)).collect();
        let report = scheduler(connector, 0).prepare(sources).unwrap().run().await;
        assert_eq!(report.succeeded, 3);
        assert_eq!(report.peak_active, 1);
    }

    #[tokio::test]
    async fn empty_batch_completes_immediately() {
        let batch = scheduler(MemoryConnector::default(), 2).prepare(Vec::new()).unwrap();
        assert!(batch.is_empty());
        let report = batch.run().await;
        assert!(report.outcomes.is_empty());
        assert_eq!(report.peak_active, 0);
        assert!(report.all_succeeded());
    }

    #[tokio::test(start_paused = true)]
    async fn canceling_queued_job_never_connects() {
        let connector = MemoryConnector {
            write_delay: Duration::from_millis(10),
            ..Default::default()
        };
        let recorder = Arc::clone(&connector.recorder);
        let sched = scheduler(connector, 1);
        let batch = sched
            .prepare(vec![source("first", 64 * 1024), source("second", 64 * 1024)])
            .unwrap();
        let handles = batch.handles();
        let mut sub = sched.progress().subscribe(handles[1].id().clone());

        let run = tokio::spawn(batch.run());
        wait_until(|| handles[0].state() == JobState::Active).await;
        assert!(handles[1].cancel());

        let report = run.await.unwrap();
        assert_eq!(report.outcomes[0].state(), JobState::Succeeded);
        assert_eq!(report.outcomes[1].state(), JobState::Canceled);
        assert_eq!(report.outcomes[1].job.bytes_transferred, 0);
        assert!(report.outcomes[1].error.is_none());
        assert!(!recorder.connected("second"));

        let ev = sub.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::Canceled);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn canceling_active_job_leaves_siblings_alone() {
        let connector = MemoryConnector {
            write_delay: Duration::from_millis(10),
            ..Default::default()
        };
        let recorder = Arc::clone(&connector.recorder);
        let sched = scheduler(connector, 3);
        let batch = sched
            .prepare(vec![
                source("a", 256 * 1024),
                source("b", 256 * 1024),
                source("c", 256 * 1024),
            ])
            .unwrap();
        let handles = batch.handles();

        let run = tokio::spawn(batch.run());
        wait_until(|| handles[1].bytes_transferred() > 0).await;
        assert!(handles[1].cancel());
        assert!(!handles[1].cancel());

        let report = run.await.unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.canceled, 1);
        assert_eq!(report.failed, 0);
        let b = &report.outcomes[1];
        assert_eq!(b.state(), JobState::Canceled);
        assert!(b.job.bytes_transferred > 0 && b.job.bytes_transferred < 256 * 1024);
        assert!(recorder.stored("b").is_none());
        assert_eq!(recorder.stored("a").unwrap().len(), 256 * 1024);
        assert_eq!(recorder.stored("c").unwrap().len(), 256 * 1024);
    }

    #[tokio::test]
    async fn cancel_after_completion_is_noop() {
        let sched = scheduler(MemoryConnector::default(), 2);
        let batch = sched.prepare(vec![source("a", 100)]).unwrap();
        let handles = batch.handles();
        let report = batch.run().await;

        assert_eq!(report.outcomes[0].state(), JobState::Succeeded);
        assert!(!handles[0].cancel());
        assert_eq!(handles[0].state(), JobState::Succeeded);
        assert_eq!(handles[0].bytes_transferred(), 100);
    }

    #[tokio::test]
    async fn cancel_all_before_run() {
        let connector = MemoryConnector::default();
        let recorder = Arc::clone(&connector.recorder);
        let batch = scheduler(connector, 2)
            .prepare(vec![source("a", 10), source("b", 10)])
            .unwrap();
        let canceller = batch.canceller();
        assert_eq!(batch.cancel_all(), 2);
        assert_eq!(canceller.cancel_all(), 0);

        let report = batch.run().await;
        assert_eq!(report.canceled, 2);
        assert!(recorder.connects.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn refused_connection_fails_only_that_job() {
        let connector = MemoryConnector {
            refuse: Some("bad".into()),
            ..Default::default()
        };
        let report = scheduler(connector, 2)
            .prepare(vec![source("good", 10), source("bad", 10), source("also-good", 10)])
            .unwrap()
            .run()
            .await;

        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert!(matches!(
            report.outcomes[1].error,
            Some(TransferError::Rejected { status: 500, .. })
        ));
        assert_eq!(report.outcomes[1].job.bytes_transferred, 0);
    }

    #[test]
    fn limits_are_checked_on_prepare() {
        let sched = TransferScheduler::new(
            MemoryConnector::default(),
            SchedulerConfig {
                limits: BatchLimits {
                    max_files: Some(2),
                    max_total_bytes: Some(100),
                },
                ..Default::default()
            },
        );

        let err = sched
            .prepare(vec![source("a", 1), source("b", 1), source("c", 1)])
            .err()
            .unwrap();
        assert!(matches!(err, TransferError::LimitExceeded(_)));

        let err = sched
            .prepare(vec![source("a", 60), source("b", 60)])
            .err()
            .unwrap();
        assert!(matches!(err, TransferError::LimitExceeded(_)));

        assert_eq!(sched.prepare(vec![source("a", 50), source("b", 50)]).unwrap().len(), 2);
    }

    #[test]
    fn default_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_concurrent, 10);
        assert_eq!(config.chunk_size, 256 * 1024);
        assert_eq!(config.limits, BatchLimits::default());
    }
}
