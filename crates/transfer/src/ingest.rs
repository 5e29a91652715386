use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use dropstream_protocol::{JobId, ProgressEvent, percent_of};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::progress::ProgressChannel;
use crate::validation::sanitize_file_name;
use crate::{DEFAULT_CHUNK_SIZE, TransferError, clamp_chunk_size};

/// Default bytes buffered in front of the destination file: 64 MiB.
pub const DEFAULT_WRITE_BUFFER: usize = 64 * 1024 * 1024;

/// Smallest write buffer an ingest session will use.
const MIN_WRITE_BUFFER: usize = 8 * 1024;

/// Staging directory for part files, inside the upload directory.
///
/// Sanitized names never contain a separator, so no upload can land inside
/// it; the directory name itself is refused as an upload name.
pub const PART_DIR: &str = ".dropstream-parts";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOptions {
    /// Bytes buffered in front of the destination before intake waits on it.
    ///
    /// The buffer grows with received data and is kept until the session
    /// ends, so this is also the memory ceiling of one upload.
    pub write_buffer_bytes: usize,
    /// Largest accepted upload, if any.
    pub max_file_bytes: Option<u64>,
    /// Read size for the inbound stream.
    pub chunk_size: usize,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            write_buffer_bytes: DEFAULT_WRITE_BUFFER,
            max_file_bytes: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// What the sender declared about an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestRequest {
    pub job_id: JobId,
    pub file_name: String,
    /// `None` when the sender did not know the size.
    pub expected_bytes: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    Open,
    ClosedSuccess,
    ClosedAborted,
    ClosedFailed,
}

impl IngestState {
    pub fn is_closed(self) -> bool {
        self != Self::Open
    }
}

/// Where an ingest session writes the bytes it receives.
pub trait IngestDestination: AsyncWrite + Unpin + Send {
    /// Makes everything written so far durable.
    fn sync(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

impl IngestDestination for File {
    async fn sync(&mut self) -> io::Result<()> {
        self.sync_all().await
    }
}

/// Final account of one ingest.
#[derive(Debug)]
pub struct IngestReport {
    pub job_id: JobId,
    /// Sanitized name the upload was (or would have been) saved under.
    pub file_name: String,
    pub destination: PathBuf,
    pub bytes_received: u64,
    /// Hex SHA-256 of the persisted bytes, on success only.
    pub sha256: Option<String>,
    pub state: IngestState,
    /// `Aborted` for a canceled upload; the cause for a failed one.
    pub error: Option<TransferError>,
}

/// Returns the part file used for `job_id` under the upload directory `dir`.
pub fn part_file_path(dir: &Path, job_id: &JobId) -> PathBuf {
    dir.join(PART_DIR).join(format!("{job_id}.part"))
}

/// Server-side mirror of one inbound upload.
///
/// Bytes land in a part file under [`PART_DIR`] and are renamed into place
/// only after the whole stream arrived, so a canceled or failed upload never
/// leaves a partial file or replaces an existing one.
pub struct IngestSession<W = File> {
    job_id: JobId,
    file_name: String,
    destination: PathBuf,
    part_path: PathBuf,
    expected_bytes: Option<u64>,
    bytes_received: u64,
    writer: W,
    /// Received bytes not yet handed to `writer`.
    pending: Vec<u8>,
    flush_threshold: usize,
    hasher: Sha256,
    max_file_bytes: Option<u64>,
    chunk_size: usize,
    progress: ProgressChannel,
}

impl IngestSession<File> {
    /// Validates the request and creates the part file in `dir`.
    ///
    /// A rejected request still publishes `failed` for its job id.
    pub async fn open(
        dir: &Path,
        request: IngestRequest,
        options: &IngestOptions,
        progress: ProgressChannel,
    ) -> Result<Self, TransferError> {
        progress.begin(&request.job_id);
        let job_id = request.job_id.clone();
        let result = Self::create(dir, request, options, progress.clone()).await;
        if let Err(e) = &result {
            progress.publish(ProgressEvent::failed(job_id.clone(), 0.0));
            warn!(%job_id, error = %e, "upload rejected");
        }
        result
    }

    async fn create(
        dir: &Path,
        request: IngestRequest,
        options: &IngestOptions,
        progress: ProgressChannel,
    ) -> Result<Self, TransferError> {
        let file_name = sanitize_file_name(&request.file_name)?;
        if file_name == PART_DIR {
            return Err(TransferError::InvalidName(format!(
                "reserved file name: {file_name:?}"
            )));
        }

        if let (Some(size), Some(limit)) = (request.expected_bytes, options.max_file_bytes) {
            if size > limit {
                return Err(TransferError::TooLarge { size, limit });
            }
        }

        tokio::fs::create_dir_all(dir.join(PART_DIR))
            .await
            .map_err(TransferError::SinkWrite)?;
        let part_path = part_file_path(dir, &request.job_id);
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&part_path)
            .await
            .map_err(TransferError::SinkWrite)?;

        debug!(
            job_id = %request.job_id,
            name = %file_name,
            expected_bytes = ?request.expected_bytes,
            "ingest opened"
        );

        let destination = dir.join(&file_name);
        Ok(IngestSession::with_destination(
            request,
            file_name,
            destination,
            part_path,
            file,
            options,
            progress,
        ))
    }
}

impl<W: IngestDestination> IngestSession<W> {
    /// Builds a session around an already opened destination.
    ///
    /// `part_path` is what `writer` writes to; it is renamed onto
    /// `destination` on success and removed otherwise.
    pub fn with_destination(
        request: IngestRequest,
        file_name: String,
        destination: PathBuf,
        part_path: PathBuf,
        writer: W,
        options: &IngestOptions,
        progress: ProgressChannel,
    ) -> Self {
        Self {
            job_id: request.job_id,
            file_name,
            destination,
            part_path,
            expected_bytes: request.expected_bytes,
            bytes_received: 0,
            writer,
            pending: Vec::new(),
            flush_threshold: options.write_buffer_bytes.max(MIN_WRITE_BUFFER),
            hasher: Sha256::new(),
            max_file_bytes: options.max_file_bytes,
            chunk_size: clamp_chunk_size(options.chunk_size),
            progress,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn expected_bytes(&self) -> Option<u64> {
        self.expected_bytes
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Consumes `body` until it ends, fails or `shutdown` fires, then closes
    /// the session.
    pub async fn run<R>(mut self, body: &mut R, shutdown: &CancellationToken) -> IngestReport
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut result = self.receive(body, shutdown).await;
        if result.is_ok() {
            result = self.flush().await;
        }

        let IngestSession {
            job_id,
            file_name,
            destination,
            part_path,
            expected_bytes,
            bytes_received,
            writer,
            hasher,
            progress,
            ..
        } = self;
        drop(writer);

        if result.is_ok() {
            result = tokio::fs::rename(&part_path, &destination)
                .await
                .map_err(TransferError::SinkWrite);
        }

        let percent = match expected_bytes {
            Some(expected) => percent_of(bytes_received, expected),
            None => 0.0,
        };

        let (state, sha256, error) = match result {
            Ok(()) => {
                progress.publish(ProgressEvent::success(job_id.clone()));
                info!(
                    %job_id,
                    name = %file_name,
                    bytes = bytes_received,
                    "upload saved"
                );
                (
                    IngestState::ClosedSuccess,
                    Some(hex::encode(hasher.finalize())),
                    None,
                )
            }
            Err(TransferError::Aborted) => {
                remove_part_file(&part_path).await;
                progress.publish(ProgressEvent::canceled(job_id.clone(), percent));
                info!(
                    %job_id,
                    name = %file_name,
                    bytes = bytes_received,
                    "upload aborted"
                );
                (IngestState::ClosedAborted, None, Some(TransferError::Aborted))
            }
            Err(e) => {
                remove_part_file(&part_path).await;
                progress.publish(ProgressEvent::failed(job_id.clone(), percent));
                warn!(
                    %job_id,
                    name = %file_name,
                    bytes = bytes_received,
                    error = %e,
                    "upload failed"
                );
                (IngestState::ClosedFailed, None, Some(e))
            }
        };

        IngestReport {
            job_id,
            file_name,
            destination,
            bytes_received,
            sha256,
            state,
            error,
        }
    }

    async fn receive<R>(
        &mut self,
        body: &mut R,
        shutdown: &CancellationToken,
    ) -> Result<(), TransferError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buf = vec![0u8; self.chunk_size];

        loop {
            let n = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Err(TransferError::Aborted),
                read = body.read(&mut buf) => match read {
                    Ok(n) => n,
                    Err(e) if is_disconnect(&e) => {
                        debug!(job_id = %self.job_id, error = %e, "sender disconnected");
                        return Err(TransferError::Aborted);
                    }
                    Err(e) => return Err(TransferError::SourceRead(e)),
                },
            };

            if n == 0 {
                return match self.expected_bytes {
                    Some(expected) if self.bytes_received < expected => {
                        debug!(
                            job_id = %self.job_id,
                            received = self.bytes_received,
                            expected,
                            "stream ended early"
                        );
                        Err(TransferError::Aborted)
                    }
                    _ => Ok(()),
                };
            }

            let total = self.bytes_received + n as u64;
            match (self.expected_bytes, self.max_file_bytes) {
                (Some(expected), _) if total > expected => {
                    return Err(TransferError::SizeMismatch {
                        expected,
                        actual: total,
                    });
                }
                (None, Some(limit)) if total > limit => {
                    return Err(TransferError::TooLarge { size: total, limit });
                }
                _ => {}
            }

            self.buffer(&buf[..n]);
            if self.pending.len() >= self.flush_threshold {
                // Waiting on the destination here stops intake from the socket.
                self.write_pending().await?;
            }
            self.hasher.update(&buf[..n]);
            self.bytes_received = total;

            if let Some(expected) = self.expected_bytes {
                self.progress.publish(ProgressEvent::progress(
                    self.job_id.clone(),
                    percent_of(total, expected),
                ));
            }
        }
    }

    /// Appends to the pending buffer, growing it no further than one chunk
    /// past the flush threshold.
    fn buffer(&mut self, bytes: &[u8]) {
        let needed = self.pending.len() + bytes.len();
        if needed > self.pending.capacity() {
            let target = (self.pending.capacity() * 2)
                .max(needed)
                .min(self.flush_threshold + self.chunk_size)
                .max(needed);
            self.pending.reserve_exact(target - self.pending.len());
        }
        self.pending.extend_from_slice(bytes);
    }

    async fn write_pending(&mut self) -> Result<(), TransferError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.writer
            .write_all(&self.pending)
            .await
            .map_err(TransferError::SinkWrite)?;
        self.pending.clear();
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), TransferError> {
        self.write_pending().await?;
        self.writer.flush().await.map_err(TransferError::SinkWrite)?;
        self.writer.sync().await.map_err(TransferError::SinkWrite)
    }
}

/// Errors that mean the sender went away rather than that we broke.
fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

async fn remove_part_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove part file");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll, Waker};
    use std::time::Duration;

    use dropstream_protocol::EventKind;
    use tokio::io::ReadBuf;

    use super::*;
    use crate::ProgressSubscription;

    fn request(name: &str, expected: Option<u64>) -> IngestRequest {
        IngestRequest {
            job_id: JobId::generate(),
            file_name: name.into(),
            expected_bytes: expected,
        }
    }

    fn options() -> IngestOptions {
        IngestOptions {
            write_buffer_bytes: 32 * 1024,
            max_file_bytes: None,
            chunk_size: 16 * 1024,
        }
    }

    /// Upload directory contents; part files show up as `PART_DIR/<name>`.
    fn entries(dir: &Path) -> Vec<String> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir).unwrap() {
            let name = entry.unwrap().file_name().to_string_lossy().into_owned();
            if name == PART_DIR {
                for part in std::fs::read_dir(dir.join(PART_DIR)).unwrap() {
                    let part = part.unwrap().file_name().to_string_lossy().into_owned();
                    names.push(format!("{PART_DIR}/{part}"));
                }
            } else {
                names.push(name);
            }
        }
        names.sort();
        names
    }

    fn drain(sub: &mut ProgressSubscription) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(ev) = sub.try_recv() {
            events.push(ev);
        }
        events
    }

    async fn ingest(
        dir: &Path,
        req: IngestRequest,
        opts: &IngestOptions,
        body: Vec<u8>,
    ) -> (IngestReport, Vec<ProgressEvent>) {
        let progress = ProgressChannel::new();
        let mut sub = progress.subscribe(req.job_id.clone());
        let session = IngestSession::open(dir, req, opts, progress).await.unwrap();
        let report = session
            .run(&mut Cursor::new(body), &CancellationToken::new())
            .await;
        (report, drain(&mut sub))
    }

    #[tokio::test]
    async fn saves_upload_and_removes_part_file() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..100 * 1024).map(|i| (i % 251) as u8).collect();
        let (report, events) = ingest(
            dir.path(),
            request("clip.mp4", Some(data.len() as u64)),
            &options(),
            data.clone(),
        )
        .await;

        assert_eq!(report.state, IngestState::ClosedSuccess);
        assert!(report.error.is_none());
        assert_eq!(report.bytes_received, data.len() as u64);
        assert_eq!(report.destination, dir.path().join("clip.mp4"));
        assert_eq!(std::fs::read(&report.destination).unwrap(), data);
        assert_eq!(entries(dir.path()), ["clip.mp4"]);
        assert_eq!(
            report.sha256.as_deref(),
            Some(hex::encode(Sha256::digest(&data)).as_str())
        );

        let (terminal, rest) = events.split_last().unwrap();
        assert_eq!(terminal.kind, EventKind::Success);
        assert!(!rest.is_empty());
        assert!(rest.windows(2).all(|w| w[0].percent <= w[1].percent));
    }

    #[tokio::test]
    async fn zero_byte_upload() {
        let dir = tempfile::tempdir().unwrap();
        let (report, events) =
            ingest(dir.path(), request("empty.txt", Some(0)), &options(), Vec::new()).await;

        assert_eq!(report.state, IngestState::ClosedSuccess);
        assert_eq!(std::fs::read(dir.path().join("empty.txt")).unwrap().len(), 0);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Success);
    }

    #[tokio::test]
    async fn unknown_size_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let (report, events) =
            ingest(dir.path(), request("notes.txt", None), &options(), b"hello".to_vec()).await;

        assert_eq!(report.state, IngestState::ClosedSuccess);
        assert_eq!(std::fs::read(dir.path().join("notes.txt")).unwrap(), b"hello");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Success);
    }

    #[tokio::test]
    async fn early_end_is_an_abort_and_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (report, events) = ingest(
            dir.path(),
            request("big.iso", Some(1000)),
            &options(),
            vec![1u8; 600],
        )
        .await;

        assert_eq!(report.state, IngestState::ClosedAborted);
        assert!(matches!(report.error, Some(TransferError::Aborted)));
        assert_eq!(report.bytes_received, 600);
        assert!(report.sha256.is_none());
        assert!(entries(dir.path()).is_empty());

        let terminal = events.last().unwrap();
        assert_eq!(terminal.kind, EventKind::Canceled);
        assert_eq!(terminal.percent, 60.0);
        assert!(events.iter().all(|e| e.kind != EventKind::Failed));
    }

    #[tokio::test]
    async fn extra_bytes_are_a_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let (report, events) =
            ingest(dir.path(), request("a.bin", Some(10)), &options(), vec![0u8; 20]).await;

        assert_eq!(report.state, IngestState::ClosedFailed);
        assert!(matches!(
            report.error,
            Some(TransferError::SizeMismatch {
                expected: 10,
                actual: 20
            })
        ));
        assert!(entries(dir.path()).is_empty());
        assert_eq!(events.last().unwrap().kind, EventKind::Failed);
    }

    #[tokio::test]
    async fn failed_upload_keeps_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("report.pdf"), b"original").unwrap();

        let (report, _) = ingest(
            dir.path(),
            request("report.pdf", Some(100)),
            &options(),
            vec![9u8; 40],
        )
        .await;

        assert_eq!(report.state, IngestState::ClosedAborted);
        assert_eq!(std::fs::read(dir.path().join("report.pdf")).unwrap(), b"original");
        assert_eq!(entries(dir.path()), ["report.pdf"]);
    }

    #[tokio::test]
    async fn successful_upload_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("report.pdf"), b"original").unwrap();

        let (report, _) = ingest(
            dir.path(),
            request("report.pdf", Some(7)),
            &options(),
            b"updated".to_vec(),
        )
        .await;

        assert_eq!(report.state, IngestState::ClosedSuccess);
        assert_eq!(std::fs::read(dir.path().join("report.pdf")).unwrap(), b"updated");
    }

    #[tokio::test]
    async fn aborted_job_leaves_saved_dot_part_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        let victim = JobId::parse("victim").unwrap();

        // A file that happens to look like a part file name.
        let (saved, _) = ingest(
            dir.path(),
            request(".victim.part", Some(5)),
            &options(),
            b"keep!".to_vec(),
        )
        .await;
        assert_eq!(saved.state, IngestState::ClosedSuccess);

        let (aborted, _) = ingest(
            dir.path(),
            IngestRequest {
                job_id: victim,
                file_name: "other.bin".into(),
                expected_bytes: Some(100),
            },
            &options(),
            vec![1u8; 10],
        )
        .await;
        assert_eq!(aborted.state, IngestState::ClosedAborted);

        assert_eq!(std::fs::read(dir.path().join(".victim.part")).unwrap(), b"keep!");
        assert_eq!(entries(dir.path()), [".victim.part"]);
    }

    #[tokio::test]
    async fn upload_named_like_a_part_file_cannot_replace_one_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let victim_id = JobId::parse("victim").unwrap();
        let session = IngestSession::open(
            dir.path(),
            IngestRequest {
                job_id: victim_id.clone(),
                file_name: "good.txt".into(),
                expected_bytes: Some(10),
            },
            &options(),
            ProgressChannel::new(),
        )
        .await
        .unwrap();

        let (mut client, mut server) = tokio::io::duplex(1024);
        let task = tokio::spawn(async move {
            session.run(&mut server, &CancellationToken::new()).await
        });
        client.write_all(b"GOOD-").await.unwrap();

        let (other, _) = ingest(
            dir.path(),
            request(&format!(".{victim_id}.part"), Some(10)),
            &options(),
            b"EVILEVIL!!".to_vec(),
        )
        .await;
        assert_eq!(other.state, IngestState::ClosedSuccess);

        client.write_all(b"BYTES").await.unwrap();
        drop(client);
        let report = task.await.unwrap();

        assert_eq!(report.state, IngestState::ClosedSuccess);
        assert_eq!(std::fs::read(dir.path().join("good.txt")).unwrap(), b"GOOD-BYTES");
        assert_eq!(
            std::fs::read(dir.path().join(".victim.part")).unwrap(),
            b"EVILEVIL!!"
        );
        assert_eq!(
            report.sha256.as_deref(),
            Some(hex::encode(Sha256::digest(b"GOOD-BYTES")).as_str())
        );
    }

    #[tokio::test]
    async fn part_dir_name_is_reserved() {
        let dir = tempfile::tempdir().unwrap();
        let err = IngestSession::open(
            dir.path(),
            request(PART_DIR, Some(3)),
            &options(),
            ProgressChannel::new(),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, TransferError::InvalidName(_)));
    }

    #[tokio::test]
    async fn declared_size_over_limit_is_rejected_up_front() {
        let dir = tempfile::tempdir().unwrap();
        let progress = ProgressChannel::new();
        let req = request("huge.bin", Some(200));
        let mut sub = progress.subscribe(req.job_id.clone());
        let opts = IngestOptions {
            max_file_bytes: Some(100),
            ..options()
        };

        let err = IngestSession::open(dir.path(), req, &opts, progress)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransferError::TooLarge { size: 200, limit: 100 }));
        assert!(entries(dir.path()).is_empty());
        assert_eq!(sub.recv().await.unwrap().kind, EventKind::Failed);
    }

    #[tokio::test]
    async fn unknown_size_over_limit_fails() {
        let dir = tempfile::tempdir().unwrap();
        let opts = IngestOptions {
            max_file_bytes: Some(100),
            ..options()
        };
        let (report, _) = ingest(dir.path(), request("huge.bin", None), &opts, vec![0u8; 150]).await;

        assert_eq!(report.state, IngestState::ClosedFailed);
        assert!(matches!(report.error, Some(TransferError::TooLarge { .. })));
        assert!(entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn sanitizes_declared_name() {
        let dir = tempfile::tempdir().unwrap();
        let (report, _) = ingest(
            dir.path(),
            request("../../etc/pass:wd", Some(3)),
            &options(),
            b"abc".to_vec(),
        )
        .await;

        assert_eq!(report.file_name, "pass_wd");
        assert_eq!(entries(dir.path()), ["pass_wd"]);
    }

    #[tokio::test]
    async fn invalid_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = IngestSession::open(
            dir.path(),
            request("..", Some(3)),
            &options(),
            ProgressChannel::new(),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, TransferError::InvalidName(_)));
    }

    struct ResetReader {
        sent: bool,
    }

    impl AsyncRead for ResetReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.sent {
                return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
            }
            self.sent = true;
            buf.put_slice(&[7u8; 512]);
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn connection_reset_is_an_abort() {
        let dir = tempfile::tempdir().unwrap();
        let session = IngestSession::open(
            dir.path(),
            request("movie.mkv", Some(4096)),
            &options(),
            ProgressChannel::new(),
        )
        .await
        .unwrap();

        let report = session
            .run(&mut ResetReader { sent: false }, &CancellationToken::new())
            .await;
        assert_eq!(report.state, IngestState::ClosedAborted);
        assert_eq!(report.bytes_received, 512);
        assert!(entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn shutdown_aborts_a_stalled_upload() {
        let dir = tempfile::tempdir().unwrap();
        let progress = ProgressChannel::new();
        let req = request("stalled.bin", Some(1024 * 1024));
        let mut sub = progress.subscribe(req.job_id.clone());
        let session = IngestSession::open(dir.path(), req, &options(), progress)
            .await
            .unwrap();

        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        client.write_all(&[1u8; 1000]).await.unwrap();

        let shutdown = CancellationToken::new();
        let task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { session.run(&mut server, &shutdown).await })
        };

        // Wait for the first chunk to be consumed before shutting down.
        let first = sub.recv().await.unwrap();
        assert_eq!(first.kind, EventKind::Progress);
        shutdown.cancel();

        let report = task.await.unwrap();
        assert_eq!(report.state, IngestState::ClosedAborted);
        assert_eq!(report.bytes_received, 1000);
        assert!(entries(dir.path()).is_empty());
        assert_eq!(sub.recv().await.unwrap().kind, EventKind::Canceled);
        drop(client);
    }

    #[tokio::test]
    async fn write_buffer_grows_with_data() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = IngestSession::open(
            dir.path(),
            request("large.bin", Some(1 << 30)),
            &IngestOptions::default(),
            ProgressChannel::new(),
        )
        .await
        .unwrap();
        assert_eq!(session.pending.capacity(), 0);

        session.buffer(&[0u8; 1024]);
        assert!(session.pending.capacity() < 64 * 1024);

        for _ in 0..(DEFAULT_WRITE_BUFFER / DEFAULT_CHUNK_SIZE) {
            session.buffer(&vec![0u8; DEFAULT_CHUNK_SIZE]);
        }
        assert!(session.pending.capacity() <= DEFAULT_WRITE_BUFFER + DEFAULT_CHUNK_SIZE);
    }

    /// Reader that counts how many reads returned data.
    struct CountingReader {
        data: Cursor<Vec<u8>>,
        reads: Arc<AtomicUsize>,
    }

    impl AsyncRead for CountingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let before = buf.filled().len();
            let poll = Pin::new(&mut self.data).poll_read(cx, buf);
            if buf.filled().len() > before {
                self.reads.fetch_add(1, Ordering::SeqCst);
            }
            poll
        }
    }

    #[derive(Default)]
    struct Gate {
        open: AtomicBool,
        waker: Mutex<Option<Waker>>,
    }

    impl Gate {
        fn open(&self) {
            self.open.store(true, Ordering::SeqCst);
            if let Some(waker) = self.waker.lock().unwrap().take() {
                waker.wake();
            }
        }
    }

    /// Destination that accepts nothing until its gate opens.
    struct GatedWriter {
        gate: Arc<Gate>,
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl AsyncWrite for GatedWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if !self.gate.open.load(Ordering::SeqCst) {
                *self.gate.waker.lock().unwrap() = Some(cx.waker().clone());
                if !self.gate.open.load(Ordering::SeqCst) {
                    return Poll::Pending;
                }
            }
            self.written.lock().unwrap().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    impl IngestDestination for GatedWriter {
        async fn sync(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_destination_suspends_intake() {
        const CHUNK: usize = 16 * 1024;
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..8 * CHUNK).map(|i| (i % 253) as u8).collect();
        let req = request("slow.bin", Some(data.len() as u64));
        let part_path = part_file_path(dir.path(), &req.job_id);
        std::fs::create_dir_all(part_path.parent().unwrap()).unwrap();
        std::fs::write(&part_path, b"").unwrap();

        let gate = Arc::new(Gate::default());
        let written = Arc::new(Mutex::new(Vec::new()));
        let opts = IngestOptions {
            write_buffer_bytes: 0,
            max_file_bytes: None,
            chunk_size: CHUNK,
        };
        let session = IngestSession::with_destination(
            req,
            "slow.bin".into(),
            dir.path().join("slow.bin"),
            part_path,
            GatedWriter {
                gate: Arc::clone(&gate),
                written: Arc::clone(&written),
            },
            &opts,
            ProgressChannel::new(),
        );

        let reads = Arc::new(AtomicUsize::new(0));
        let mut body = CountingReader {
            data: Cursor::new(data.clone()),
            reads: Arc::clone(&reads),
        };
        let task = tokio::spawn(async move {
            session.run(&mut body, &CancellationToken::new()).await
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(reads.load(Ordering::SeqCst), 1);
        assert!(written.lock().unwrap().is_empty());

        gate.open();
        let report = task.await.unwrap();

        assert_eq!(report.state, IngestState::ClosedSuccess);
        assert_eq!(report.bytes_received, data.len() as u64);
        assert_eq!(reads.load(Ordering::SeqCst), 8);
        assert_eq!(*written.lock().unwrap(), data);
    }
}
