//! In-memory pipe between a producer and a consumer of archive bytes.
//!
//! A transfer connects one side that only knows how to write a byte stream
//! (an archive being packed, an object being downloaded) to one side that
//! only knows how to read one (an object being uploaded, an archive being
//! unpacked). Both run at the same time over a bounded buffer, so memory use
//! is capped by [`Transfer::buffer_size`] however large the archive is.
//!
//! # Outcome
//!
//! The consumer's error always wins. A producer error is reported when the
//! consumer succeeded after reading the pipe to end-of-stream, since the
//! consumer then saw everything the producer managed to write. A producer that
//! fails only after the consumer already returned (the consumer stopped
//! reading early and the producer hit a closed pipe) is logged and ignored.

use crate::error::{ErrorKind, Result, Side};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, DuplexStream, ReadBuf};
use tokio::sync::oneshot;
use tracing::instrument;

/// Default capacity of the in-memory pipe.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Writing end of a transfer, owned by the producer. Dropping it signals
/// end-of-stream to the consumer.
pub type PipeWriter = DuplexStream;

/// Reading end of a transfer, owned by the consumer.
#[derive(Debug)]
pub struct PipeReader {
    inner: DuplexStream,
    eof: Arc<AtomicBool>,
}

impl AsyncRead for PipeReader {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let polled = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &polled
            && buf.filled().len() == before
            && buf.remaining() > 0
        {
            self.eof.store(true, Ordering::Release);
        }
        polled
    }
}

/// Settings for a single producer/consumer transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transfer {
    buffer_size: usize,
    timeout: Option<Duration>,
}

impl Default for Transfer {
    fn default() -> Self {
        Self { buffer_size: DEFAULT_BUFFER_SIZE, timeout: None }
    }
}

impl Transfer {
    /// Capacity of the pipe in bytes (at least one).
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// Deadline for the whole transfer. `None` waits forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Run `produce` and `consume` concurrently, connected by a pipe.
    ///
    /// `produce` runs on its own task and owns the writing end, so the
    /// consumer sees end-of-stream as soon as the producer finishes, whether
    /// it succeeded or not. `consume` runs on the calling task. Both always
    /// run to completion before this returns, unless the deadline fires, in
    /// which case the producer task is aborted and
    /// [`TimedOut`](ErrorKind::TimedOut) is returned.
    ///
    /// # Examples
    ///
    /// ```
    /// use stash_cache::transfer::Transfer;
    /// use tokio::io::{AsyncReadExt, AsyncWriteExt};
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() {
    /// let mut received = Vec::new();
    /// let buffer = &mut received;
    /// Transfer::default()
    ///     .pipe(
    ///         |mut sink| async move {
    ///             sink.write_all(b"hello\ngo\n").await.unwrap();
    ///             Ok(())
    ///         },
    ///         move |mut source| async move {
    ///             source.read_to_end(buffer).await.unwrap();
    ///             Ok(())
    ///         },
    ///     )
    ///     .await
    ///     .unwrap();
    /// assert_eq!(received, b"hello\ngo\n");
    /// # }
    /// ```
    #[instrument(skip_all, fields(buffer_size = self.buffer_size))]
    pub async fn pipe<P, PF, C, CF>(&self, produce: P, consume: C) -> Result<()>
    where
        P: FnOnce(PipeWriter) -> PF + Send + 'static,
        PF: Future<Output = Result<()>> + Send + 'static,
        C: FnOnce(PipeReader) -> CF,
        CF: Future<Output = Result<()>>,
    {
        let (sink, source) = tokio::io::duplex(self.buffer_size);
        let eof = Arc::new(AtomicBool::new(false));
        let source = PipeReader { inner: source, eof: Arc::clone(&eof) };
        let (result_tx, result_rx) = oneshot::channel();
        let producer = tokio::spawn(async move {
            let result = produce(sink).await;
            // The receiver is gone only if the transfer timed out.
            _ = result_tx.send(result);
        });

        let joined = join(consume(source), result_rx, &eof);
        match self.timeout {
            None => joined.await,
            Some(limit) => match tokio::time::timeout(limit, joined).await {
                Ok(result) => result,
                Err(elapsed) => {
                    producer.abort();
                    tracing::warn!(timeout = ?limit, "Transfer timed out");
                    Err(exn::Exn::from(elapsed).raise(ErrorKind::TimedOut(limit)))
                },
            },
        }
    }
}

async fn join<CF>(consume: CF, produced: oneshot::Receiver<Result<()>>, eof: &AtomicBool) -> Result<()>
where
    CF: Future<Output = Result<()>>,
{
    // The reading end is dropped together with the consumer's future, which
    // unblocks a producer still waiting for buffer space.
    let consumed = consume.await;
    let produced = produced.await;
    match (consumed, produced) {
        (Err(err), produced) => {
            if let Ok(Err(discarded)) = produced {
                tracing::debug!(side = %Side::Produce, error = ?discarded, "Discarding producer error");
            }
            tracing::debug!(side = %Side::Consume, "Transfer failed");
            Err(err)
        },
        (Ok(()), Ok(Ok(()))) => Ok(()),
        (Ok(()), Ok(Err(err))) if eof.load(Ordering::Acquire) => {
            tracing::debug!(side = %Side::Produce, "Transfer failed");
            Err(err)
        },
        (Ok(()), Ok(Err(err))) => {
            tracing::debug!(error = ?err, "Producer failed after the consumer finished early; ignoring");
            Ok(())
        },
        (Ok(()), Err(closed)) => {
            tracing::debug!(side = %Side::Produce, "Producer went away without a result");
            Err(exn::Exn::from(closed).raise(ErrorKind::Aborted(Side::Produce)))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stash_archive::error::ErrorKind as ArchiveErrorKind;
    use stash_storage::error::ErrorKind as StorageErrorKind;
    use std::path::PathBuf;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pack_failure() -> crate::error::Error {
        exn::Exn::from(ErrorKind::Pack(ArchiveErrorKind::SourceNotFound(PathBuf::from("mount1"))))
    }

    fn put_failure() -> crate::error::Error {
        exn::Exn::from(ErrorKind::Put(StorageErrorKind::BackendError("bucket gone".to_string())))
    }

    #[tokio::test]
    async fn test_bytes_arrive_in_order() {
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let mut received = Vec::new();
        let buffer = &mut received;
        Transfer::default()
            .with_buffer_size(1024)
            .pipe(
                move |mut sink| async move {
                    for chunk in payload.chunks(777) {
                        sink.write_all(chunk).await.unwrap();
                    }
                    Ok(())
                },
                move |mut source| async move {
                    source.read_to_end(buffer).await.unwrap();
                    Ok(())
                },
            )
            .await
            .unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_producer_error_after_full_read() {
        let err = Transfer::default()
            .pipe(
                |mut sink| async move {
                    sink.write_all(b"partial archive").await.unwrap();
                    Err(pack_failure())
                },
                |mut source| async move {
                    let mut buf = Vec::new();
                    source.read_to_end(&mut buf).await.unwrap();
                    assert_eq!(buf, b"partial archive");
                    Ok(())
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(&*err, ErrorKind::Pack(ArchiveErrorKind::SourceNotFound(_))));
        assert_eq!(err.side(), Some(Side::Produce));
    }

    #[tokio::test]
    async fn test_producer_error_after_consumer_returned_is_ignored() {
        let result = Transfer::default()
            .with_buffer_size(64)
            .pipe(
                |mut sink| async move {
                    // Blocks on the full pipe until the consumer drops its end.
                    let written = sink.write_all(&[0u8; 4096]).await;
                    assert!(written.is_err());
                    Err(pack_failure())
                },
                |mut source| async move {
                    let mut head = [0u8; 10];
                    source.read_exact(&mut head).await.unwrap();
                    Ok(())
                },
            )
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_consumer_error_wins() {
        let err = Transfer::default()
            .pipe(
                |mut sink| async move {
                    _ = sink.write_all(b"bytes").await;
                    Err(pack_failure())
                },
                |_source| async move { Err(put_failure()) },
            )
            .await
            .unwrap_err();
        assert!(matches!(&*err, ErrorKind::Put(_)));
        assert_eq!(err.side(), Some(Side::Consume));
    }

    #[tokio::test]
    async fn test_consumer_error_unblocks_producer() {
        // The producer writes far more than the pipe holds; it must not hang
        // once the consumer gives up.
        let err = Transfer::default()
            .with_buffer_size(16)
            .pipe(
                |mut sink| async move {
                    for _ in 0..1024 {
                        if sink.write_all(&[1u8; 1024]).await.is_err() {
                            break;
                        }
                    }
                    Ok(())
                },
                |_source| async move { Err(put_failure()) },
            )
            .await
            .unwrap_err();
        assert!(matches!(&*err, ErrorKind::Put(_)));
    }

    #[tokio::test]
    async fn test_empty_producer() {
        let mut received = vec![1u8];
        let buffer = &mut received;
        Transfer::default()
            .pipe(
                |_sink| async move { Ok(()) },
                move |mut source| async move {
                    buffer.clear();
                    source.read_to_end(buffer).await.unwrap();
                    Ok(())
                },
            )
            .await
            .unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn test_producer_panic_is_aborted() {
        let err = Transfer::default()
            .pipe(
                |_sink| async move {
                    let blow_up = true;
                    if blow_up {
                        panic!("producer blew up");
                    }
                    Ok(())
                },
                |mut source| async move {
                    let mut buf = Vec::new();
                    _ = source.read_to_end(&mut buf).await;
                    Ok(())
                },
            )
            .await
            .unwrap_err();
        assert_eq!(*err, ErrorKind::Aborted(Side::Produce));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_aborts_hung_producer() {
        let err = Transfer::default()
            .with_timeout(Some(Duration::from_secs(30)))
            .pipe(
                |_sink| async move {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                },
                |mut source| async move {
                    let mut buf = Vec::new();
                    _ = source.read_to_end(&mut buf).await;
                    Ok(())
                },
            )
            .await
            .unwrap_err();
        assert_eq!(*err, ErrorKind::TimedOut(Duration::from_secs(30)));
    }

    #[test]
    fn test_buffer_size_at_least_one() {
        assert_eq!(Transfer::default().buffer_size(), DEFAULT_BUFFER_SIZE);
        assert_eq!(Transfer::default().with_buffer_size(0).buffer_size(), 1);
    }
}
