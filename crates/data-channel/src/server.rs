//! TCP ingest server (receiver side).
//!
//! Accepts connections until shut down. Upload connections are persisted
//! through an [`IngestSession`]; subscribe connections receive the progress
//! of one job as a text event stream.

use std::collections::HashSet;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dropstream_protocol::{
    DEFAULT_PORT, HEADER_TIMEOUT, JobId, STATUS_BAD_REQUEST, STATUS_CLIENT_CLOSED,
    STATUS_CONFLICT, STATUS_INTERNAL_ERROR, encode_event,
};
use dropstream_transfer::{
    IngestOptions, IngestRequest, IngestSession, IngestState, ProgressChannel, TransferError,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::TCP_BUFFER_SIZE;
use crate::error::DataChannelError;
use crate::wire::{
    RequestKind, UploadResponse, read_request_kind, read_subscribe, read_upload_header,
    write_upload_response,
};

/// Bytes of an already rejected upload read and discarded so the sender
/// can still read the response.
const REJECT_DRAIN_LIMIT: u64 = 1024 * 1024;

/// Time spent discarding a rejected upload's body.
const REJECT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: IpAddr,
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
    pub upload_dir: PathBuf,
    pub ingest: IngestOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            upload_dir: PathBuf::from("uploads"),
            ingest: IngestOptions::default(),
        }
    }
}

/// The ingest server.
pub struct IngestServer {
    config: ServerConfig,
    progress: ProgressChannel,
    in_flight: Mutex<HashSet<JobId>>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

/// Marks a job id as in flight until dropped.
struct InFlightGuard<'a> {
    server: &'a IngestServer,
    job_id: JobId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.server.in_flight_ids().remove(&self.job_id);
    }
}

impl IngestServer {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            progress: ProgressChannel::new(),
            in_flight: Mutex::new(HashSet::new()),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Server-side progress of every upload, keyed by job id.
    pub fn progress(&self) -> &ProgressChannel {
        &self.progress
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`bind`](Self::bind).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of uploads currently being received.
    pub fn in_flight(&self) -> usize {
        self.in_flight_ids().len()
    }

    /// Stops accepting and aborts every upload in progress.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn in_flight_ids(&self) -> MutexGuard<'_, HashSet<JobId>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claim(&self, job_id: &JobId) -> Option<InFlightGuard<'_>> {
        if !self.in_flight_ids().insert(job_id.clone()) {
            return None;
        }
        Some(InFlightGuard {
            server: self,
            job_id: job_id.clone(),
        })
    }

    /// Creates the upload directory and binds the listener.
    pub async fn bind(&self) -> Result<TcpListener, DataChannelError> {
        tokio::fs::create_dir_all(&self.config.upload_dir).await?;
        let addr = SocketAddr::new(self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(local_addr);
        info!(
            %local_addr,
            upload_dir = %self.config.upload_dir.display(),
            "ingest server listening"
        );
        Ok(listener)
    }

    /// Binds and serves until [`shutdown`](Self::shutdown).
    pub async fn run(self: &Arc<Self>) -> Result<(), DataChannelError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accepts connections on `listener` until shutdown, then waits for the
    /// open connections to wind down.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<(), DataChannelError> {
        let tracker = TaskTracker::new();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("server shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tracker.spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    warn!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            error!("accept error: {e}");
                        }
                    }
                }
            }
        }

        drop(listener);
        tracker.close();
        tracker.wait().await;
        Ok(())
    }

    async fn handle_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), DataChannelError> {
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let mut reader = BufReader::with_capacity(TCP_BUFFER_SIZE, reader);

        match self.read_header(read_request_kind(&mut reader)).await? {
            RequestKind::Upload => self.handle_upload(reader, writer, peer_addr).await,
            RequestKind::Subscribe => self.handle_subscribe(reader, writer, peer_addr).await,
        }
    }

    /// Bounds a header read by [`HEADER_TIMEOUT`] and shutdown.
    async fn read_header<T>(
        &self,
        read: impl Future<Output = Result<T, DataChannelError>>,
    ) -> Result<T, DataChannelError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(DataChannelError::Cancelled),
            result = tokio::time::timeout(HEADER_TIMEOUT, read) => {
                result.unwrap_or(Err(DataChannelError::Timeout))
            }
        }
    }

    async fn handle_upload(
        &self,
        mut reader: BufReader<OwnedReadHalf>,
        mut writer: OwnedWriteHalf,
        peer_addr: SocketAddr,
    ) -> Result<(), DataChannelError> {
        let header = match self.read_header(read_upload_header(&mut reader)).await {
            Ok(header) => header,
            Err(e) => {
                if !matches!(e, DataChannelError::Cancelled) {
                    let response = UploadResponse::error(STATUS_BAD_REQUEST, e.to_string());
                    let _ = write_upload_response(&mut writer, &response).await;
                }
                return Err(e);
            }
        };

        let Some(_guard) = self.claim(&header.job_id) else {
            warn!(job_id = %header.job_id, %peer_addr, "upload already in progress");
            let response = UploadResponse::error(
                STATUS_CONFLICT,
                format!("upload {} already in progress", header.job_id),
            );
            reject(&mut reader, &mut writer, &response).await;
            return Ok(());
        };

        let request = IngestRequest {
            job_id: header.job_id.clone(),
            file_name: header.file_name,
            expected_bytes: header.size,
        };
        let session = match IngestSession::open(
            &self.config.upload_dir,
            request,
            &self.config.ingest,
            self.progress.clone(),
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                let response = UploadResponse::error(status_for(&e), e.to_string());
                reject(&mut reader, &mut writer, &response).await;
                return Ok(());
            }
        };

        info!(
            job_id = %header.job_id,
            name = %session.file_name(),
            size = ?header.size,
            %peer_addr,
            "upload started"
        );

        let report = session.run(&mut reader, &self.cancel).await;
        let response = match (report.state, report.sha256) {
            (IngestState::ClosedSuccess, Some(sha256)) => UploadResponse::ok(sha256),
            _ => match &report.error {
                Some(e) => UploadResponse::error(status_for(e), e.to_string()),
                None => UploadResponse::error(STATUS_INTERNAL_ERROR, "upload not saved"),
            },
        };

        // The sender may already be gone.
        if let Err(e) = write_upload_response(&mut writer, &response).await {
            debug!(job_id = %header.job_id, "could not send response: {e}");
        }
        let _ = writer.shutdown().await;
        Ok(())
    }

    async fn handle_subscribe(
        &self,
        mut reader: BufReader<OwnedReadHalf>,
        mut writer: OwnedWriteHalf,
        peer_addr: SocketAddr,
    ) -> Result<(), DataChannelError> {
        let job_id = self.read_header(read_subscribe(&mut reader)).await?;
        let mut subscription = self.progress.subscribe(job_id.clone());
        debug!(%job_id, %peer_addr, "progress subscriber attached");

        let mut probe = [0u8; 1];
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,

                event = subscription.recv() => {
                    let Some(event) = event else { break };
                    let frame = encode_event(event.kind, &event.payload())?;
                    if let Err(e) = writer.write_all(frame.as_bytes()).await {
                        debug!(%job_id, "subscriber write failed: {e}");
                        break;
                    }
                    if event.is_terminal() {
                        break;
                    }
                }

                // Subscribers send nothing after the header; EOF means gone.
                read = reader.read(&mut probe) => {
                    if matches!(read, Ok(0) | Err(_)) {
                        debug!(%job_id, %peer_addr, "progress subscriber disconnected");
                        break;
                    }
                }
            }
        }

        drop(subscription);
        let _ = writer.shutdown().await;
        Ok(())
    }
}

/// Sends `response` for an upload that will not be ingested, then discards
/// what the sender may already have written.
async fn reject(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    response: &UploadResponse,
) {
    if write_upload_response(writer, response).await.is_err() {
        return;
    }
    let _ = writer.shutdown().await;
    let mut body = reader.take(REJECT_DRAIN_LIMIT);
    let _ = tokio::time::timeout(
        REJECT_DRAIN_TIMEOUT,
        tokio::io::copy(&mut body, &mut tokio::io::sink()),
    )
    .await;
}

fn status_for(error: &TransferError) -> u16 {
    match error {
        TransferError::InvalidName(_) | TransferError::TooLarge { .. } => STATUS_BAD_REQUEST,
        TransferError::Aborted => STATUS_CLIENT_CLOSED,
        _ => STATUS_INTERNAL_ERROR,
    }
}
