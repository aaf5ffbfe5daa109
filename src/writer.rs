//! Dedicated writer task for one connected stream.
//!
//! Every outbound block for a session goes through an mpsc channel to a single
//! task that owns the write half of the stream. Callers never share the socket
//! behind a lock, and concurrent senders never interleave partial blocks.
//!
//! # Architecture
//!
//! ```text
//! send_and_wait ─┐
//! reply handler ─┼─► mpsc::Sender<OutboundData> ─► Writer Task ─► TcpStream / serial
//! linktest      ─┘
//! ```
//!
//! Each [`OutboundData`] carries a completion slot so the sender learns whether
//! its bytes reached the stream. A whole batch must be written within the
//! configured write timeout (T8); otherwise every sender in the batch is told
//! it failed and the task ends.

use std::io::IoSlice;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Result, SecsError};

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Maximum chunks to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Encoded bytes waiting for the writer task.
#[derive(Debug)]
pub struct OutboundData {
    pub bytes: Bytes,
    /// Resolved with `true` once the bytes were flushed.
    pub done: oneshot::Sender<bool>,
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Channel capacity for the outbound queue.
    pub channel_capacity: usize,
    /// Bound on writing one batch (T8).
    pub write_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Handle for sending bytes to the writer task.
///
/// This is cheaply cloneable.
#[derive(Clone, Debug)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundData>,
}

impl WriterHandle {
    /// Queue `bytes` and wait until the writer has flushed them.
    pub async fn send(&self, bytes: Bytes) -> Result<()> {
        let (done, written) = oneshot::channel();
        self.tx
            .send(OutboundData { bytes, done })
            .await
            .map_err(|_| SecsError::ConnectionClosed)?;

        match written.await {
            Ok(true) => Ok(()),
            Ok(false) => Err(SecsError::SendFailed),
            Err(_) => Err(SecsError::ConnectionClosed),
        }
    }

    /// Whether the writer task has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the writer task has gone away.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Spawn the writer task and return a handle for sending bytes.
///
/// The task ends cleanly when every handle is dropped, and with an error when
/// a write fails or exceeds the write timeout.
pub fn spawn_writer_task<W>(writer: W, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let task = tokio::spawn(writer_loop(rx, writer, config.write_timeout));
    (WriterHandle { tx }, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundData>,
    mut writer: W,
    write_timeout: Duration,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let Some(first) = rx.recv().await else {
            let _ = writer.shutdown().await;
            return Ok(());
        };

        // Collect additional ready chunks (non-blocking)
        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(data) => batch.push(data),
                Err(_) => break,
            }
        }

        let chunks: Vec<Bytes> = batch.iter().map(|d| d.bytes.clone()).collect();
        let outcome = match tokio::time::timeout(write_timeout, write_batch(&mut writer, &chunks)).await {
            Ok(result) => result,
            Err(_) => Err(SecsError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "write did not complete within T8",
            ))),
        };

        let ok = outcome.is_ok();
        for data in batch {
            let _ = data.done.send(ok);
        }

        if let Err(e) = outcome {
            tracing::error!("Writer task failed: {}", e);
            return Err(e);
        }
    }
}

/// Write a batch of chunks using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(Bytes::len).sum();
    if total_size == 0 {
        return Ok(());
    }

    let mut total_written = 0;
    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(SecsError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for remaining data after a partial write.
fn build_remaining_slices(batch: &[Bytes], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut skipped = 0;

    for chunk in batch {
        let start = skipped;
        let end = skipped + chunk.len();
        if skip_bytes < end && !chunk.is_empty() {
            slices.push(IoSlice::new(&chunk[skip_bytes.saturating_sub(start)..]));
        }
        skipped = end;
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn test_send_reaches_stream() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        handle.send(Bytes::from_static(b"hello")).await.unwrap();

        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_concurrent_senders_do_not_interleave() {
        let (client, mut server) = duplex(64 * 1024);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        let mut tasks = Vec::new();
        for i in 0..10u8 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                handle.send(Bytes::from(vec![i; 100])).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let mut buf = vec![0u8; 1000];
        server.read_exact(&mut buf).await.unwrap();
        for chunk in buf.chunks(100) {
            assert!(chunk.iter().all(|b| *b == chunk[0]));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_timeout_fails_sender() {
        // The reader never drains, so the second write blocks.
        let (client, _server) = duplex(8);
        let config = WriterConfig {
            write_timeout: Duration::from_millis(100),
            ..WriterConfig::default()
        };
        let (handle, task) = spawn_writer_task(client, config);

        let err = handle.send(Bytes::from(vec![0u8; 64])).await.unwrap_err();
        assert!(matches!(err, SecsError::SendFailed));
        assert!(task.await.unwrap().is_err());
    }

    #[test]
    fn test_build_remaining_slices_partial() {
        let batch = vec![Bytes::from_static(b"abc"), Bytes::from_static(b"defgh")];

        let slices = build_remaining_slices(&batch, 0);
        assert_eq!(slices.len(), 2);

        let slices = build_remaining_slices(&batch, 2);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), 1);

        let slices = build_remaining_slices(&batch, 4);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].len(), 4);
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        drop(handle);

        let result = task.await.unwrap();
        assert!(result.is_ok());
    }
}
