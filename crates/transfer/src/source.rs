use std::fmt;
use std::io::Cursor;
use std::path::Path;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::TransferError;

/// A sequentially readable origin of bytes with a known total length.
pub struct ByteSource {
    name: String,
    total_bytes: u64,
    reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl ByteSource {
    pub fn new(
        name: impl Into<String>,
        total_bytes: u64,
        reader: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            total_bytes,
            reader: Box::new(reader),
        }
    }

    /// In-memory source, mostly useful for tests and small payloads.
    pub fn from_bytes(name: impl Into<String>, data: Vec<u8>) -> Self {
        let len = data.len() as u64;
        Self::new(name, len, Cursor::new(data))
    }

    /// Opens a file; the name is its final path component and the size is
    /// taken from its metadata.
    pub async fn from_file(path: &Path) -> Result<Self, TransferError> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(TransferError::SourceRead)?;
        let metadata = file.metadata().await.map_err(TransferError::SourceRead)?;
        if !metadata.is_file() {
            return Err(TransferError::InvalidName(format!(
                "not a regular file: {}",
                path.display()
            )));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| TransferError::InvalidName(path.display().to_string()))?;
        Ok(Self::new(name, metadata.len(), file))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub(crate) async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf).await
    }
}

impl fmt::Debug for ByteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteSource")
            .field("name", &self.name)
            .field("total_bytes", &self.total_bytes)
            .finish_non_exhaustive()
    }
}
