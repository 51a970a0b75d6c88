//! Connection reader: socket bytes in, size-checked chunks out to the supervisor

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

use super::signal::CloseSignal;
use crate::error::RelayError;
use crate::types::MESSAGE_LEN_LIMIT;

/// Why a reader stopped
#[derive(Debug)]
pub enum ReadExit {
    /// Peer closed its end of the stream
    Eof,
    /// A single read came back larger than the message ceiling
    Oversize(usize),
    /// Fatal read error, or too many transient ones in a row
    Failed(RelayError),
    /// The supervisor stopped taking messages
    SupervisorGone,
}

pub struct Reader<R> {
    stream: R,
    inbound: mpsc::Sender<Vec<u8>>,
    close: CloseSignal,
    max_message_len: usize,
    retry_limit: u32,
    retry_backoff: Duration,
}

impl<R> Reader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(stream: R, inbound: mpsc::Sender<Vec<u8>>, close: CloseSignal) -> Self {
        Self {
            stream,
            inbound,
            close,
            max_message_len: crate::types::MAX_MESSAGE_LEN,
            retry_limit: 8,
            retry_backoff: Duration::from_millis(50),
        }
    }

    /// Set the message ceiling, capped at [`MESSAGE_LEN_LIMIT`]
    pub fn max_message_len(mut self, len: usize) -> Self {
        self.max_message_len = len.min(MESSAGE_LEN_LIMIT);
        self
    }

    pub fn retry_policy(mut self, limit: u32, backoff: Duration) -> Self {
        self.retry_limit = limit;
        self.retry_backoff = backoff;
        self
    }

    /// Read until end of stream, an oversize chunk, or a fatal error.
    ///
    /// The close signal fires when this returns or when the future is dropped.
    pub async fn run(mut self) -> ReadExit {
        let _guard = self.close.guard();

        // One spare byte so an oversize chunk is visible in a single read
        let mut buf = vec![0u8; self.max_message_len.saturating_add(1)];
        let mut failures = 0u32;

        loop {
            match self.stream.read(&mut buf).await {
                Ok(0) => {
                    tracing::info!("EOF from peer");
                    return ReadExit::Eof;
                }
                Ok(n) if n > self.max_message_len => {
                    tracing::info!(len = n, max = self.max_message_len, "Invalid message, dropping connection");
                    return ReadExit::Oversize(n);
                }
                Ok(n) => {
                    failures = 0;
                    if self.inbound.send(buf[..n].to_vec()).await.is_err() {
                        return ReadExit::SupervisorGone;
                    }
                }
                Err(e) if RelayError::is_fatal_read(&e) => {
                    tracing::info!("Read failed: {}", e);
                    return ReadExit::Failed(RelayError::Read(e));
                }
                Err(e) => {
                    failures += 1;
                    if failures > self.retry_limit {
                        tracing::error!(failures, "Can't read, giving up: {}", e);
                        return ReadExit::Failed(RelayError::Read(e));
                    }
                    tracing::warn!(attempt = failures, "Can't read, retrying: {}", e);
                    tokio::time::sleep(self.retry_backoff).await;
                }
            }
        }
    }
}
