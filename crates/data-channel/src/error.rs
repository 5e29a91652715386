//! Error types for the data channel.

use std::io;

use dropstream_protocol::ProtocolError;
use dropstream_transfer::TransferError;

/// Errors produced by the TCP data channel.
#[derive(Debug, thiserror::Error)]
pub enum DataChannelError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("connection timed out")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid frame: {0}")]
    Frame(#[from] ProtocolError),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

impl From<DataChannelError> for TransferError {
    fn from(e: DataChannelError) -> Self {
        match e {
            DataChannelError::Io(e) => TransferError::SinkWrite(e),
            DataChannelError::Timeout => {
                TransferError::SinkWrite(io::Error::new(io::ErrorKind::TimedOut, "timed out"))
            }
            DataChannelError::Cancelled => TransferError::Aborted,
            DataChannelError::Protocol(msg) => {
                TransferError::SinkWrite(io::Error::new(io::ErrorKind::InvalidData, msg))
            }
            DataChannelError::Frame(e) => {
                TransferError::SinkWrite(io::Error::new(io::ErrorKind::InvalidData, e))
            }
            DataChannelError::Transfer(e) => e,
        }
    }
}
