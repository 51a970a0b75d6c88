//! Per-connection supervisor
//!
//! Each accepted stream gets three tasks:
//!
//! ```text
//!            inbound            publish
//! Reader ------------> Supervisor --------> Broker
//!   |                      |                  |
//!   +---- close signal ----+                  | SubscriberQueue
//!                          v                  v
//!                       cleanup            Writer ----> socket
//! ```
//!
//! The supervisor drives `Active -> Closing -> Closed` and runs cleanup exactly
//! once, whichever task noticed the end first.

pub mod reader;
pub mod signal;
pub mod writer;

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::Instrument;

use crate::broker::BrokerHandle;
use crate::config::RelayConfig;
use crate::error::Result;
use crate::types::{ConnectionId, Message};

pub use reader::{ReadExit, Reader};
pub use signal::{CloseGuard, CloseSignal};
pub use writer::Writer;

/// Lifecycle of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Active,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Only forward moves are allowed; nothing returns to `Active`
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!((self, next), (Active, Closing) | (Closing, Closed))
    }
}

/// Supervisor for one accepted stream
pub struct Connection {
    id: ConnectionId,
    peer: String,
    broker: BrokerHandle,
    config: Arc<RelayConfig>,
    state: ConnectionState,
}

impl Connection {
    /// `peer` is a display label only; identity comes from `id`
    pub fn new(
        id: ConnectionId,
        peer: impl Into<String>,
        broker: BrokerHandle,
        config: Arc<RelayConfig>,
    ) -> Self {
        Self {
            id,
            peer: peer.into(),
            broker,
            config,
            state: ConnectionState::Active,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Run the connection over `stream` to completion
    pub async fn run<S>(self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let span = tracing::info_span!("conn", id = %self.id, peer = %self.peer);
        self.supervise(stream).instrument(span).await
    }

    async fn supervise<S>(mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        tracing::info!("New connection");

        let queue = self.broker.subscribe().await;
        let subscription = queue.id();

        let (read_half, write_half) = tokio::io::split(stream);
        let (inbound_tx, mut inbound_rx) = mpsc::channel::<Vec<u8>>(1);
        let close = CloseSignal::new();

        let reader = Reader::new(read_half, inbound_tx, close.clone())
            .max_message_len(self.config.max_message_len)
            .retry_policy(self.config.read_retry_limit, self.config.read_retry_backoff);
        let reader_task = tokio::spawn(reader.run().in_current_span());

        let writer = Writer::new(self.id, write_half, queue, close.clone());
        let mut writer_task = tokio::spawn(writer.run().in_current_span());

        // Set once the writer finishes on its own
        let mut writer_done = None;

        loop {
            tokio::select! {
                biased;

                bytes = inbound_rx.recv() => match bytes {
                    Some(bytes) => self.publish(&bytes).await,
                    None => break,
                },

                () = close.fired() => break,

                res = &mut writer_task => {
                    writer_done = Some(res);
                    // Unblock a reader stuck on a read nobody will answer
                    reader_task.abort();
                    break;
                }
            }
        }

        self.transition(ConnectionState::Closing);

        let read_exit = reader_task.await;
        let write_exit = match writer_done {
            Some(res) => res,
            None => writer_task.await,
        };
        finish(read_exit, write_exit).await;

        self.broker.unsubscribe(subscription).await;
        self.transition(ConnectionState::Closed);

        tracing::info!("Client disconnected");
    }

    async fn publish(&self, bytes: &[u8]) {
        match Message::with_limit(self.id, bytes, self.config.max_message_len) {
            Ok(msg) => {
                tracing::info!(len = msg.len(), "Message from client");
                self.broker.publish(msg).await;
            }
            Err(e) => tracing::warn!("Discarding inbound chunk: {}", e),
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid connection transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::debug!(from = ?self.state, to = ?next, "Connection state change");
        self.state = next;
    }
}

/// Log how both halves ended and close the socket
async fn finish<S: AsyncWrite>(
    read_exit: std::result::Result<ReadExit, JoinError>,
    write_exit: std::result::Result<Result<tokio::io::WriteHalf<S>>, JoinError>,
) {
    match read_exit {
        Ok(exit) => tracing::debug!(?exit, "Reader finished"),
        Err(e) if e.is_cancelled() => tracing::debug!("Reader cancelled"),
        Err(e) => tracing::error!("Reader task failed: {}", e),
    }

    match write_exit {
        Ok(Ok(mut sink)) => {
            if let Err(e) = sink.shutdown().await {
                tracing::debug!("Socket shutdown failed: {}", e);
            }
        }
        // Socket is already broken; dropping the half is enough
        Ok(Err(e)) => tracing::debug!("Writer ended with error: {}", e),
        Err(e) => tracing::error!("Writer task failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};

    const WAIT: Duration = Duration::from_secs(2);

    fn start_broker() -> BrokerHandle {
        let (broker, handle) = Broker::new(&RelayConfig::default());
        broker.start();
        handle
    }

    /// Start a supervised connection over an in-memory pipe, returning the client end
    fn connect(broker: &BrokerHandle) -> (DuplexStream, tokio::task::JoinHandle<()>) {
        let (client, server) = tokio::io::duplex(1024);
        let conn = Connection::new(
            ConnectionId::new(),
            "test",
            broker.clone(),
            Arc::new(RelayConfig::default()),
        );
        (client, tokio::spawn(conn.run(server)))
    }

    async fn wait_for_subscribers(broker: &BrokerHandle, n: usize) {
        tokio::time::timeout(WAIT, async {
            while broker.stats().await.unwrap().subscribers != n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("subscriber count never settled");
    }

    #[test]
    fn test_state_transitions() {
        use ConnectionState::*;

        assert!(Active.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Closed));

        assert!(!Active.can_transition_to(Closed));
        assert!(!Closing.can_transition_to(Active));
        assert!(!Closed.can_transition_to(Active));
        assert!(!Closed.can_transition_to(Closing));
    }

    #[tokio::test]
    async fn test_relays_between_connections() {
        let broker = start_broker();
        let (mut a, _ta) = connect(&broker);
        let (mut b, _tb) = connect(&broker);
        wait_for_subscribers(&broker, 2).await;

        a.write_all(b"hello\n").await.unwrap();

        let mut buf = [0u8; 6];
        tokio::time::timeout(WAIT, b.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"hello\n");

        // Sender never hears its own message
        let mut one = [0u8; 1];
        assert!(tokio::time::timeout(Duration::from_millis(100), a.read(&mut one))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_eof_runs_cleanup_once() {
        let broker = start_broker();
        let (client, task) = connect(&broker);
        wait_for_subscribers(&broker, 1).await;

        drop(client);
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(broker.stats().await.unwrap().subscribers, 0);
    }

    #[tokio::test]
    async fn test_oversize_drops_only_offender() {
        let broker = start_broker();
        let (mut bad, bad_task) = connect(&broker);
        let (mut a, _ta) = connect(&broker);
        let (mut b, _tb) = connect(&broker);
        wait_for_subscribers(&broker, 3).await;

        bad.write_all(&[b'x'; 100]).await.unwrap();
        tokio::time::timeout(WAIT, bad_task).await.unwrap().unwrap();

        // Offender's socket is closed
        let mut rest = Vec::new();
        tokio::time::timeout(WAIT, bad.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());

        wait_for_subscribers(&broker, 2).await;
        a.write_all(b"still up\n").await.unwrap();
        let mut buf = [0u8; 9];
        tokio::time::timeout(WAIT, b.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"still up\n");
    }

    #[tokio::test]
    async fn test_broker_stop_tears_down_connection() {
        let broker = start_broker();
        let (_client, task) = connect(&broker);
        wait_for_subscribers(&broker, 1).await;

        broker.stop();
        tokio::time::timeout(WAIT, task)
            .await
            .expect("connection should close when the broker stops")
            .unwrap();
    }
}
