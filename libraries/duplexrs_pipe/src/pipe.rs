use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{mpsc, watch};

pub const DEFAULT_PIPE_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("pipe is closed")]
pub struct ClosedPipeError;

/// Creates an in-process byte conduit with one write end, one read end and a
/// cloneable closing handle. `capacity` is counted in chunks; a writer stalls
/// once that many chunks sit undrained.
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader, PipeCloser) {
    let (sender, receiver) = mpsc::channel::<Vec<u8>>(capacity.max(1));
    let (closed_sender, closed_receiver) = watch::channel(false);

    let writer = PipeWriter {
        sender: sender.clone(),
        closed: closed_receiver.clone(),
    };

    let reader = PipeReader {
        receiver,
        closed: closed_receiver,
        chunk: Vec::new(),
        offset: 0,
    };

    let closer = PipeCloser {
        sender,
        closed: Arc::new(closed_sender),
    };

    (writer, reader, closer)
}

pub struct PipeWriter {
    sender: mpsc::Sender<Vec<u8>>,
    closed: watch::Receiver<bool>,
}

impl PipeWriter {
    /// Appends a chunk to the conduit, waiting for the reader to drain prior
    /// data if the buffer is full. Fails once the pipe has been closed, even
    /// if the close happens mid-wait.
    pub async fn write(&mut self, bytes: Vec<u8>) -> Result<(), ClosedPipeError> {
        if bytes.is_empty() {
            return Ok(());
        }

        if *self.closed.borrow() {
            return Err(ClosedPipeError);
        }

        tokio::select! {
            _ = self.closed.changed() => Err(ClosedPipeError),
            result = self.sender.send(bytes) => result.map_err(|_| ClosedPipeError),
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

pub struct PipeReader {
    receiver: mpsc::Receiver<Vec<u8>>,
    closed: watch::Receiver<bool>,

    // unread tail of the chunk most recently pulled off the queue
    chunk: Vec<u8>,
    offset: usize,
}

impl PipeReader {
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if this.offset < this.chunk.len() {
                let take = buf.remaining().min(this.chunk.len() - this.offset);
                buf.put_slice(&this.chunk[this.offset..this.offset + take]);
                this.offset += take;
                return Poll::Ready(Ok(()));
            }

            match this.receiver.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    this.chunk = chunk;
                    this.offset = 0;
                }
                // every write end is gone, nothing more can arrive
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => {
                    // the queue is drained; closed now means end-of-stream
                    if *this.closed.borrow() {
                        return Poll::Ready(Ok(()));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct PipeCloser {
    sender: mpsc::Sender<Vec<u8>>,
    closed: Arc<watch::Sender<bool>>,
}

impl PipeCloser {
    /// Closes the pipe. Monotonic and idempotent: only the first call
    /// transitions the state, and that call returns true. Any writer stalled
    /// on backpressure fails with `ClosedPipeError`; a reader parked on an
    /// empty queue wakes up and observes end-of-stream.
    pub fn close(&self) -> bool {
        let was_closed = self.closed.send_replace(true);

        if !was_closed {
            // empty sentinel chunk wakes a reader parked on an empty queue;
            // writers skip empty chunks so only close() ever enqueues one
            let _ = self.sender.try_send(Vec::new());

            log::debug!(target: "duplexrs_pipe::pipe", "pipe closed");
        }

        !was_closed
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use test_log::test;
    use tokio::io::AsyncReadExt;
    use tokio::time::timeout;

    #[test(tokio::test)]
    async fn delivers_bytes_in_write_order() -> anyhow::Result<()> {
        let _ = env_logger::builder().is_test(true).try_init();

        let (mut writer, mut reader, _closer) = pipe(4);

        writer.write(vec![0x01, 0x02]).await?;
        writer.write(vec![0x03]).await?;

        let mut received = vec![0_u8; 3];
        reader.read_exact(&mut received).await?;

        assert_eq!(received, vec![0x01, 0x02, 0x03]);

        Ok(())
    }

    #[test(tokio::test)]
    async fn empty_writes_are_ignored() -> anyhow::Result<()> {
        let (mut writer, mut reader, _closer) = pipe(4);

        writer.write(Vec::new()).await?;
        writer.write(vec![0x2a]).await?;

        let mut received = vec![0_u8; 1];
        reader.read_exact(&mut received).await?;

        assert_eq!(received, vec![0x2a]);

        Ok(())
    }

    #[test(tokio::test)]
    async fn close_wakes_blocked_reader_with_end_of_stream() -> anyhow::Result<()> {
        let (_writer, mut reader, closer) = pipe(4);

        let read_task = tokio::spawn(async move {
            let mut buffer = [0_u8; 16];
            reader.read(&mut buffer).await
        });

        // let the reader park on the empty queue first
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(closer.close());

        let read = timeout(Duration::from_secs(1), read_task).await??;
        assert_eq!(read?, 0);

        Ok(())
    }

    #[test(tokio::test)]
    async fn write_after_close_fails() {
        let (mut writer, _reader, closer) = pipe(4);

        closer.close();

        let result = writer.write(vec![0xff]).await;
        assert_eq!(result, Err(ClosedPipeError));
        assert!(writer.is_closed());
    }

    #[test(tokio::test)]
    async fn buffered_bytes_survive_close_until_drained() -> anyhow::Result<()> {
        let (mut writer, mut reader, closer) = pipe(4);

        writer.write(vec![0x0a, 0x0b]).await?;
        closer.close();

        let mut received = Vec::new();
        reader.read_to_end(&mut received).await?;

        assert_eq!(received, vec![0x0a, 0x0b]);

        Ok(())
    }

    #[test(tokio::test)]
    async fn close_is_idempotent_and_monotonic() {
        let (_writer, _reader, closer) = pipe(4);

        assert!(!closer.is_closed());
        assert!(closer.close());
        assert!(!closer.close());
        assert!(closer.is_closed());
    }

    #[test(tokio::test)]
    async fn close_unblocks_writer_stalled_on_backpressure() -> anyhow::Result<()> {
        let (mut writer, _reader, closer) = pipe(1);

        // fill the only slot so the next write has to wait
        writer.write(vec![0x01]).await?;

        let write_task = tokio::spawn(async move { writer.write(vec![0x02]).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        closer.close();

        let result = timeout(Duration::from_secs(1), write_task).await??;
        assert_eq!(result, Err(ClosedPipeError));

        Ok(())
    }

    #[test(tokio::test)]
    async fn dropping_the_reader_fails_later_writes() {
        let (mut writer, reader, _closer) = pipe(4);

        drop(reader);

        let result = writer.write(vec![0x01]).await;
        assert_eq!(result, Err(ClosedPipeError));
    }
}
