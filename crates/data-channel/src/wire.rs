//! TCP wire format for uploads and subscriptions.
//!
//! # Wire format
//!
//! ```text
//! REQUEST KIND (client -> server): [1 byte: 0x01=upload, 0x02=subscribe]
//!
//! UPLOAD (client -> server):
//!   [2 bytes BE: id_len][id_len bytes: job id UTF-8]
//!   [2 bytes BE: name_len][name_len bytes: file name UTF-8]
//!   [8 bytes BE: size, u64::MAX = unknown]
//!   [raw body], then the client half-closes
//!
//! UPLOAD RESPONSE (server -> client):
//!   [2 bytes BE: status][2 bytes BE: msg_len][msg_len bytes: message UTF-8]
//!   [1 byte: digest_len][digest_len bytes: hex SHA-256, 0 = none]
//!
//! SUBSCRIBE (client -> server):
//!   [2 bytes BE: id_len][id_len bytes: job id UTF-8]
//!   then the server writes a text event stream until the terminal event
//! ```

use dropstream_protocol::{
    JobId, MAX_JOB_ID_LEN, REQUEST_SUBSCRIBE, REQUEST_UPLOAD, STATUS_OK, UNKNOWN_SIZE,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::DataChannelError;

/// What a new connection asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Upload,
    Subscribe,
}

impl RequestKind {
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Upload => REQUEST_UPLOAD,
            Self::Subscribe => REQUEST_SUBSCRIBE,
        }
    }
}

/// Header sent ahead of an upload body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadHeader {
    pub job_id: JobId,
    /// Declared file name, not yet sanitized.
    pub file_name: String,
    /// Body length; `None` when unknown.
    pub size: Option<u64>,
}

/// Server verdict for one upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResponse {
    pub status: u16,
    pub message: String,
    /// Hex SHA-256 of the persisted bytes.
    pub sha256: Option<String>,
}

impl UploadResponse {
    pub fn ok(sha256: String) -> Self {
        Self {
            status: STATUS_OK,
            message: "saved".into(),
            sha256: Some(sha256),
        }
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            sha256: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

async fn write_str16<W: AsyncWrite + Unpin>(
    writer: &mut W,
    value: &str,
    what: &str,
) -> Result<(), DataChannelError> {
    let bytes = value.as_bytes();
    let len = u16::try_from(bytes.len()).map_err(|_| {
        DataChannelError::Protocol(format!(
            "{what} too long: {} bytes (max {})",
            bytes.len(),
            u16::MAX
        ))
    })?;
    writer.write_u16(len).await?;
    writer.write_all(bytes).await?;
    Ok(())
}

async fn read_str16<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_len: usize,
    what: &str,
) -> Result<String, DataChannelError> {
    let len = reader.read_u16().await? as usize;
    if len > max_len {
        return Err(DataChannelError::Protocol(format!(
            "{what} too long: {len} bytes (max {max_len})"
        )));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf)
        .map_err(|e| DataChannelError::Protocol(format!("invalid UTF-8 {what}: {e}")))
}

async fn read_job_id<R: AsyncRead + Unpin>(reader: &mut R) -> Result<JobId, DataChannelError> {
    let raw = read_str16(reader, MAX_JOB_ID_LEN, "job id").await?;
    Ok(JobId::parse(&raw)?)
}

/// Reads the request kind byte that opens every connection.
pub async fn read_request_kind<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<RequestKind, DataChannelError> {
    match reader.read_u8().await? {
        REQUEST_UPLOAD => Ok(RequestKind::Upload),
        REQUEST_SUBSCRIBE => Ok(RequestKind::Subscribe),
        other => Err(DataChannelError::Protocol(format!(
            "unknown request kind: {other:#04x}"
        ))),
    }
}

/// Writes the request kind and upload header.
pub async fn write_upload_header<W: AsyncWrite + Unpin>(
    writer: &mut W,
    header: &UploadHeader,
) -> Result<(), DataChannelError> {
    writer.write_u8(RequestKind::Upload.as_byte()).await?;
    write_str16(writer, header.job_id.as_str(), "job id").await?;
    write_str16(writer, &header.file_name, "file name").await?;
    writer.write_u64(header.size.unwrap_or(UNKNOWN_SIZE)).await?;
    Ok(())
}

/// Reads an upload header (after the request kind byte).
pub async fn read_upload_header<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<UploadHeader, DataChannelError> {
    let job_id = read_job_id(reader).await?;
    let file_name = read_str16(reader, u16::MAX as usize, "file name").await?;
    let size = match reader.read_u64().await? {
        UNKNOWN_SIZE => None,
        n => Some(n),
    };
    Ok(UploadHeader {
        job_id,
        file_name,
        size,
    })
}

/// Writes the request kind and subscribe header.
pub async fn write_subscribe<W: AsyncWrite + Unpin>(
    writer: &mut W,
    job_id: &JobId,
) -> Result<(), DataChannelError> {
    writer.write_u8(RequestKind::Subscribe.as_byte()).await?;
    write_str16(writer, job_id.as_str(), "job id").await?;
    Ok(())
}

/// Reads a subscribe header (after the request kind byte).
pub async fn read_subscribe<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<JobId, DataChannelError> {
    read_job_id(reader).await
}

/// Writes an upload response and flushes.
pub async fn write_upload_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &UploadResponse,
) -> Result<(), DataChannelError> {
    writer.write_u16(response.status).await?;
    write_str16(writer, &response.message, "message").await?;
    let digest = response.sha256.as_deref().unwrap_or_default().as_bytes();
    let digest_len = u8::try_from(digest.len())
        .map_err(|_| DataChannelError::Protocol(format!("digest too long: {}", digest.len())))?;
    writer.write_u8(digest_len).await?;
    writer.write_all(digest).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads an upload response.
pub async fn read_upload_response<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<UploadResponse, DataChannelError> {
    let status = reader.read_u16().await?;
    let message = read_str16(reader, u16::MAX as usize, "message").await?;
    let digest_len = reader.read_u8().await? as usize;
    let sha256 = if digest_len == 0 {
        None
    } else {
        let mut buf = vec![0u8; digest_len];
        reader.read_exact(&mut buf).await?;
        Some(
            String::from_utf8(buf)
                .map_err(|e| DataChannelError::Protocol(format!("invalid digest: {e}")))?,
        )
    };
    Ok(UploadResponse {
        status,
        message,
        sha256,
    })
}
