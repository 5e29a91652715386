use std::future::Future;
use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::TransferError;
use crate::types::TransferJob;

/// Consumer of a job's bytes that can hold the producer back.
///
/// The pump awaits [`ready`](ChunkSink::ready) before reading each chunk, so
/// a sink that is not ready suspends reads from the source.
pub trait ChunkSink: Send {
    /// Resolves when the sink can accept another chunk.
    fn ready(&mut self) -> impl Future<Output = io::Result<()>> + Send;

    fn write_chunk(&mut self, chunk: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    /// Graceful close after the last chunk. May surface a remote rejection.
    fn finish(&mut self) -> impl Future<Output = Result<(), TransferError>> + Send;

    /// Best-effort close without completing the transfer.
    fn abort(&mut self) -> impl Future<Output = ()> + Send;
}

/// Opens a sink for each job the scheduler admits.
pub trait SinkConnector: Send + Sync + 'static {
    type Sink: ChunkSink + 'static;

    fn connect(
        &self,
        job: &TransferJob,
    ) -> impl Future<Output = Result<Self::Sink, TransferError>> + Send;
}

/// Adapts any [`AsyncWrite`] into a [`ChunkSink`].
///
/// Readiness is implied by the writer itself: a write that cannot make
/// progress stays pending, which holds the pump back.
pub struct WriterSink<W> {
    writer: W,
}

impl<W> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: AsyncWrite + Send + Unpin> ChunkSink for WriterSink<W> {
    async fn ready(&mut self) -> io::Result<()> {
        Ok(())
    }

    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.writer.write_all(chunk).await
    }

    async fn finish(&mut self) -> Result<(), TransferError> {
        self.writer
            .shutdown()
            .await
            .map_err(TransferError::SinkWrite)
    }

    async fn abort(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writer_sink_collects_bytes() {
        let mut sink = WriterSink::new(Vec::new());
        sink.ready().await.unwrap();
        sink.write_chunk(b"abc").await.unwrap();
        sink.write_chunk(b"def").await.unwrap();
        sink.finish().await.unwrap();
        assert_eq!(sink.into_inner(), b"abcdef");
    }
}
