//! Connection writer: drains the subscriber queue back onto the socket

use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::signal::CloseSignal;
use crate::broker::SubscriberQueue;
use crate::error::{RelayError, Result};
use crate::types::{ConnectionId, Message};

pub struct Writer<W> {
    id: ConnectionId,
    sink: W,
    queue: SubscriberQueue,
    close: CloseSignal,
}

impl<W> Writer<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(id: ConnectionId, sink: W, queue: SubscriberQueue, close: CloseSignal) -> Self {
        Self {
            id,
            sink,
            queue,
            close,
        }
    }

    /// Deliver queued messages until the close signal fires or the broker lets
    /// go of the queue. Hands the sink back so the supervisor can shut it down.
    ///
    /// A hard write error ends the writer with `Err`; it does not fire the close
    /// signal itself.
    pub async fn run(mut self) -> Result<W> {
        loop {
            let msg = tokio::select! {
                biased;

                () = self.close.fired() => {
                    tracing::debug!("Close write handler");
                    break;
                }

                msg = self.queue.recv() => match msg {
                    Some(msg) => msg,
                    None => {
                        tracing::debug!("Subscriber queue closed by broker");
                        break;
                    }
                },
            };

            // No echo
            if msg.origin() == self.id {
                continue;
            }

            tokio::select! {
                biased;

                () = self.close.fired() => break,

                res = write_message(&mut self.sink, &msg) => {
                    if let Err(e) = res {
                        tracing::error!("Can't write to peer: {}", e);
                        return Err(e);
                    }
                }
            }
        }

        Ok(self.sink)
    }
}

/// Write one payload. A short write is logged, then the remainder is pushed out.
async fn write_message<W>(sink: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = msg.payload();
    let written = sink.write(payload).await.map_err(RelayError::Write)?;

    if written < payload.len() {
        tracing::error!(written, len = payload.len(), "Can't fully write message in one go");
        sink.write_all(&payload[written..])
            .await
            .map_err(RelayError::Write)?;
    }

    sink.flush().await.map_err(RelayError::Write)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, BrokerHandle};
    use crate::config::RelayConfig;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    fn start_broker() -> BrokerHandle {
        let (broker, handle) = Broker::new(&RelayConfig::default());
        broker.start();
        handle
    }

    /// Accepts at most `chunk` bytes per write, optionally failing every write
    #[derive(Default)]
    struct TrickleSink {
        written: Vec<u8>,
        chunk: usize,
        fail: bool,
    }

    impl AsyncWrite for TrickleSink {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.fail {
                return Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
            }
            let n = buf.len().min(self.chunk);
            self.written.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_writes_others_and_suppresses_echo() {
        let broker = start_broker();
        let me = ConnectionId::new();
        let other = ConnectionId::new();

        let (sink, mut peer) = tokio::io::duplex(256);
        let queue = broker.subscribe().await;
        let close = CloseSignal::new();
        let writer = tokio::spawn(Writer::new(me, sink, queue, close.clone()).run());

        broker.publish(Message::new(me, b"mine\n").unwrap()).await;
        broker.publish(Message::new(other, b"theirs\n").unwrap()).await;

        let mut buf = [0u8; 7];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"theirs\n");

        close.fire();
        let sink = tokio::time::timeout(Duration::from_secs(1), writer)
            .await
            .expect("writer should stop on close")
            .unwrap();
        assert!(sink.is_ok());

        // Nothing else was written: the echo was discarded
        drop(sink);
        let mut rest = Vec::new();
        peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_short_write_completes_message() {
        let broker = start_broker();
        let queue = broker.subscribe().await;
        let close = CloseSignal::new();
        let sink = TrickleSink {
            chunk: 3,
            ..Default::default()
        };
        let writer = tokio::spawn(Writer::new(ConnectionId::new(), sink, queue, close.clone()).run());

        broker
            .publish(Message::new(ConnectionId::new(), b"hello\n").unwrap())
            .await;
        broker.stats().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        close.fire();
        let sink = writer.await.unwrap().unwrap();
        assert_eq!(sink.written, b"hello\n");
    }

    #[tokio::test]
    async fn test_hard_write_error_returns_without_firing_close() {
        let broker = start_broker();
        let queue = broker.subscribe().await;
        let close = CloseSignal::new();
        let sink = TrickleSink {
            chunk: 64,
            fail: true,
            ..Default::default()
        };
        let writer = tokio::spawn(Writer::new(ConnectionId::new(), sink, queue, close.clone()).run());

        broker
            .publish(Message::new(ConnectionId::new(), b"boom\n").unwrap())
            .await;

        let result = tokio::time::timeout(Duration::from_secs(1), writer)
            .await
            .expect("writer should stop on write error")
            .unwrap();
        assert!(matches!(result, Err(RelayError::Write(_))));
        assert!(!close.is_fired());
    }

    #[tokio::test]
    async fn test_broker_stop_ends_writer() {
        let broker = start_broker();
        let queue = broker.subscribe().await;
        let (sink, _peer) = tokio::io::duplex(64);
        let writer = tokio::spawn(Writer::new(ConnectionId::new(), sink, queue, CloseSignal::new()).run());

        broker.stop();
        let result = tokio::time::timeout(Duration::from_secs(1), writer)
            .await
            .expect("writer should stop once its queue closes")
            .unwrap();
        assert!(result.is_ok());
    }
}
