//! Uploads a batch of files and reports per-job outcomes.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use dropstream_data_channel::{ProgressStream, TcpConnector};
use dropstream_transfer::{
    BatchReport, ByteSource, JobHandle, JobState, SchedulerConfig, TransferScheduler,
};
use tokio::task::JoinSet;

/// How long server progress streams may trail the batch before being dropped.
const WATCH_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SendOptions {
    pub server: String,
    pub files: Vec<PathBuf>,
    pub scheduler: SchedulerConfig,
    pub watch: bool,
}

/// Uploads every file in `options`. When `interrupt` resolves, every job
/// that has not finished is canceled and the run completes with what was
/// done so far.
pub async fn run(
    options: SendOptions,
    interrupt: impl Future<Output = ()>,
) -> anyhow::Result<BatchReport> {
    let mut sources = Vec::with_capacity(options.files.len());
    for path in &options.files {
        let source = ByteSource::from_file(path)
            .await
            .with_context(|| format!("cannot upload {}", path.display()))?;
        sources.push(source);
    }

    let scheduler = TransferScheduler::new(
        TcpConnector::new(options.server.clone()),
        options.scheduler.clone(),
    );
    let batch = scheduler.prepare(sources)?;
    let handles = batch.handles();
    tracing::info!(
        server = %options.server,
        files = batch.len(),
        max_concurrent = scheduler.config().max_concurrent,
        "starting uploads"
    );

    let mut watchers = JoinSet::new();
    for handle in &handles {
        watchers.spawn(log_local_progress(&scheduler, handle));
        if options.watch {
            match ProgressStream::connect(options.server.as_str(), handle.id()).await {
                Ok(stream) => {
                    watchers.spawn(log_server_progress(stream, handle.name().to_string()));
                }
                Err(e) => {
                    tracing::warn!(job_id = %handle.id(), "cannot watch server progress: {e}");
                }
            }
        }
    }

    let canceller = batch.canceller();
    let run = batch.run();
    tokio::pin!(run);
    let report = tokio::select! {
        report = &mut run => report,
        () = interrupt => {
            let canceled = canceller.cancel_all();
            tracing::warn!(canceled, "interrupted, canceling uploads");
            run.await
        }
    };

    let drained = tokio::time::timeout(WATCH_GRACE, async {
        while watchers.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        watchers.abort_all();
    }

    log_report(&report);
    Ok(report)
}

fn log_local_progress(
    scheduler: &TransferScheduler<TcpConnector>,
    handle: &JobHandle,
) -> impl Future<Output = ()> + Send + 'static {
    let mut sub = scheduler.progress().subscribe(handle.id().clone());
    let name = handle.name().to_string();
    async move {
        while let Some(event) = sub.recv().await {
            tracing::debug!(name = %name, kind = %event.kind, percent = event.percent, "sent");
        }
    }
}

async fn log_server_progress(mut stream: ProgressStream, name: String) {
    loop {
        match stream.next_event().await {
            Ok(Some(event)) => {
                tracing::info!(name = %name, kind = %event.kind, percent = event.percent, "server");
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(name = %name, "server progress stream failed: {e}");
                break;
            }
        }
    }
}

fn log_report(report: &BatchReport) {
    for outcome in &report.outcomes {
        let job = &outcome.job;
        match outcome.state() {
            JobState::Succeeded => tracing::info!(
                job_id = %job.id,
                name = %job.name,
                bytes = job.bytes_transferred,
                "uploaded"
            ),
            JobState::Canceled => tracing::warn!(
                job_id = %job.id,
                name = %job.name,
                bytes = job.bytes_transferred,
                total = job.total_bytes,
                "canceled"
            ),
            _ => tracing::error!(
                job_id = %job.id,
                name = %job.name,
                error = outcome.error.as_ref().map(ToString::to_string).unwrap_or_default(),
                "failed"
            ),
        }
    }
    tracing::info!(
        succeeded = report.succeeded,
        canceled = report.canceled,
        failed = report.failed,
        bytes = report.bytes_transferred(),
        peak_active = report.peak_active,
        "batch finished"
    );
}
