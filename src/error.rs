use std::io;

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors that can occur while relaying messages
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Message of {len} bytes exceeds the {max} byte limit")]
    Oversize { len: usize, max: usize },

    #[error("Read failed: {0}")]
    Read(io::Error),

    #[error("Write failed: {0}")]
    Write(io::Error),

    #[error("Broker has stopped")]
    BrokerStopped,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error")]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Whether a read error should end the connection rather than be retried
    pub fn is_fatal_read(err: &io::Error) -> bool {
        matches!(
            err.kind(),
            io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::NotConnected
                | io::ErrorKind::UnexpectedEof
        )
    }
}
