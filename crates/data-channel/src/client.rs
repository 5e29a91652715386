//! TCP upload client (sender side).
//!
//! [`TcpUploadSink`] streams one file body to the server and reads back its
//! verdict; [`TcpConnector`] opens one per scheduled job. [`ProgressStream`]
//! follows the server-side progress of a job.

use std::io;
use std::time::Duration;

use dropstream_protocol::{EventDecoder, JobId, ProgressEvent};
use dropstream_transfer::{ChunkSink, SinkConnector, TransferError, TransferJob};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, info};

use crate::error::DataChannelError;
use crate::wire::{UploadHeader, read_upload_response, write_subscribe, write_upload_header};
use crate::{RESPONSE_TIMEOUT, TCP_BUFFER_SIZE, TCP_CONNECT_TIMEOUT};

/// How long a failed write waits for the server to explain itself.
const REJECTION_GRACE: Duration = Duration::from_secs(2);

async fn connect(addr: impl ToSocketAddrs) -> Result<TcpStream, DataChannelError> {
    match tokio::time::timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true)?;
            Ok(stream)
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(DataChannelError::Timeout),
    }
}

/// Opens a [`TcpUploadSink`] per job against one server.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    server: String,
    buffer_size: usize,
}

impl TcpConnector {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            buffer_size: TCP_BUFFER_SIZE,
        }
    }

    /// Write buffer per connection; a full buffer must drain before the
    /// pump reads more.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }

    pub fn server(&self) -> &str {
        &self.server
    }
}

impl SinkConnector for TcpConnector {
    type Sink = TcpUploadSink;

    async fn connect(&self, job: &TransferJob) -> Result<TcpUploadSink, TransferError> {
        Ok(TcpUploadSink::connect(self.server.as_str(), job, self.buffer_size).await?)
    }
}

/// One upload connection.
///
/// Writes are buffered; [`ready`](ChunkSink::ready) drains the buffer once it
/// is half full, so a slow receiver (a full TCP send window) holds back reads
/// on the sending side.
pub struct TcpUploadSink {
    job_id: JobId,
    reader: OwnedReadHalf,
    writer: BufWriter<OwnedWriteHalf>,
    high_water: usize,
    hasher: Sha256,
}

impl TcpUploadSink {
    /// Connects and sends the upload header for `job`.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        job: &TransferJob,
        buffer_size: usize,
    ) -> Result<Self, DataChannelError> {
        let stream = connect(addr).await?;
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let mut writer = BufWriter::with_capacity(buffer_size, writer);

        let header = UploadHeader {
            job_id: job.id.clone(),
            file_name: job.name.clone(),
            size: Some(job.total_bytes),
        };
        write_upload_header(&mut writer, &header).await?;
        writer.flush().await?;

        debug!(
            job_id = %job.id,
            %peer,
            size = job.total_bytes,
            "upload connection opened"
        );

        Ok(Self {
            job_id: job.id.clone(),
            reader,
            writer,
            high_water: (buffer_size / 2).max(1),
            hasher: Sha256::new(),
        })
    }

    /// Replaces a write error with the server's verdict when it already sent
    /// one (it answers early when it rejects an upload).
    async fn explain(&mut self, e: io::Error) -> io::Error {
        match tokio::time::timeout(REJECTION_GRACE, read_upload_response(&mut self.reader)).await
        {
            Ok(Ok(response)) if !response.is_ok() => io::Error::new(
                e.kind(),
                format!(
                    "server rejected upload ({}): {}",
                    response.status, response.message
                ),
            ),
            _ => e,
        }
    }
}

impl ChunkSink for TcpUploadSink {
    async fn ready(&mut self) -> io::Result<()> {
        if self.writer.buffer().len() >= self.high_water {
            if let Err(e) = self.writer.flush().await {
                return Err(self.explain(e).await);
            }
        }
        Ok(())
    }

    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        if let Err(e) = self.writer.write_all(chunk).await {
            return Err(self.explain(e).await);
        }
        self.hasher.update(chunk);
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), TransferError> {
        if let Err(e) = self.writer.shutdown().await {
            return Err(TransferError::SinkWrite(self.explain(e).await));
        }

        let response =
            match tokio::time::timeout(RESPONSE_TIMEOUT, read_upload_response(&mut self.reader))
                .await
            {
                Ok(result) => result?,
                Err(_) => return Err(DataChannelError::Timeout.into()),
            };

        if !response.is_ok() {
            return Err(TransferError::Rejected {
                status: response.status,
                message: response.message,
            });
        }

        let local = hex::encode(self.hasher.finalize_reset());
        if let Some(remote) = &response.sha256 {
            if !remote.eq_ignore_ascii_case(&local) {
                return Err(TransferError::ChecksumMismatch);
            }
        }

        info!(job_id = %self.job_id, sha256 = %local, "upload confirmed by server");
        Ok(())
    }

    async fn abort(&mut self) {
        // Unflushed bytes are dropped; the server sees a short body.
        let _ = self.writer.get_mut().shutdown().await;
        debug!(job_id = %self.job_id, "upload connection aborted");
    }
}

/// Server-side progress of one job, read from a subscription connection.
pub struct ProgressStream {
    job_id: JobId,
    lines: Lines<BufReader<TcpStream>>,
    decoder: EventDecoder,
    done: bool,
}

impl ProgressStream {
    /// Opens a subscription for `job_id`.
    ///
    /// Subscribing before the upload starts is fine; subscribing after the
    /// server finished the job yields an empty stream.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        job_id: &JobId,
    ) -> Result<Self, DataChannelError> {
        let mut stream = connect(addr).await?;
        write_subscribe(&mut stream, job_id).await?;
        stream.flush().await?;
        Ok(Self {
            job_id: job_id.clone(),
            lines: BufReader::new(stream).lines(),
            decoder: EventDecoder::new(),
            done: false,
        })
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Next event, or `None` once the terminal event was seen or the server
    /// closed the stream.
    pub async fn next_event(&mut self) -> Result<Option<ProgressEvent>, DataChannelError> {
        if self.done {
            return Ok(None);
        }
        while let Some(line) = self.lines.next_line().await? {
            if let Some((kind, payload)) = self.decoder.feed_line(&line)? {
                let event = ProgressEvent::new(self.job_id.clone(), kind, payload.load_percent);
                self.done = event.is_terminal();
                return Ok(Some(event));
            }
        }
        self.done = true;
        Ok(None)
    }
}
