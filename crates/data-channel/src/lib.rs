//! TCP transport for uploads and progress subscriptions.
//!
//! Every request uses its own connection. An upload streams one file body
//! into the server's [`IngestServer`]; a subscription reads the server-side
//! progress of one job as a text event stream.
//!
//! # Wire format
//!
//! See [`wire`] module for the binary protocol specification.

pub mod client;
pub mod error;
pub mod server;
pub mod wire;

pub use client::{ProgressStream, TcpConnector, TcpUploadSink};
pub use error::DataChannelError;
pub use server::{IngestServer, ServerConfig};
pub use wire::{RequestKind, UploadHeader, UploadResponse};

use std::time::Duration;

/// TCP read/write buffer size (256 KB).
pub const TCP_BUFFER_SIZE: usize = 256 * 1024;

/// Timeout for the TCP connection attempt.
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Time the server has to answer once the body has been sent.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);
