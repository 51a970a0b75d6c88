use std::fmt;
use std::sync::Arc;

use ulid::Ulid;

use crate::error::{RelayError, Result};

/// Largest payload a single read may carry
pub const MAX_MESSAGE_LEN: usize = 64;

/// Hard upper bound for a configured message ceiling; sizes the read buffer
pub const MESSAGE_LEN_LIMIT: usize = 64 * 1024;

/// Default number of messages a subscriber queue holds before the broker drops
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 5;

/// Opaque identity assigned to a connection when it is accepted.
///
/// Only used to suppress echo; never derived from the remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Ulid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key of one registration in the broker's subscriber set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Ulid);

impl SubscriptionId {
    pub(crate) fn new() -> Self {
        Self(Ulid::new())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A chunk of bytes published by one connection.
///
/// Cloning is cheap: the payload is shared between every queue it lands in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    origin: ConnectionId,
    payload: Arc<[u8]>,
}

impl Message {
    /// Build a message, rejecting payloads above [`MAX_MESSAGE_LEN`]
    pub fn new(origin: ConnectionId, payload: &[u8]) -> Result<Self> {
        Self::with_limit(origin, payload, MAX_MESSAGE_LEN)
    }

    /// Build a message against a configured size ceiling
    pub fn with_limit(origin: ConnectionId, payload: &[u8], max: usize) -> Result<Self> {
        if payload.len() > max {
            return Err(RelayError::Oversize {
                len: payload.len(),
                max,
            });
        }
        Ok(Self {
            origin,
            payload: Arc::from(payload),
        })
    }

    pub fn origin(&self) -> ConnectionId {
        self.origin
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
        assert_ne!(a.to_string(), b.to_string());
    }

    #[test]
    fn test_message_at_limit() {
        let origin = ConnectionId::new();
        let payload = [b'x'; MAX_MESSAGE_LEN];

        let msg = Message::new(origin, &payload).unwrap();
        assert_eq!(msg.len(), MAX_MESSAGE_LEN);
        assert_eq!(msg.origin(), origin);
    }

    #[test]
    fn test_message_over_limit() {
        let payload = [b'x'; MAX_MESSAGE_LEN + 1];

        match Message::new(ConnectionId::new(), &payload) {
            Err(RelayError::Oversize { len, max }) => {
                assert_eq!(len, MAX_MESSAGE_LEN + 1);
                assert_eq!(max, MAX_MESSAGE_LEN);
            }
            other => panic!("Expected Oversize error, got {:?}", other),
        }
    }

    #[test]
    fn test_message_custom_limit() {
        let origin = ConnectionId::new();
        assert!(Message::with_limit(origin, b"hello\n", 6).is_ok());
        assert!(Message::with_limit(origin, b"hello!\n", 6).is_err());
    }

    #[test]
    fn test_message_clone_shares_payload() {
        let msg = Message::new(ConnectionId::new(), b"hello\n").unwrap();
        let copy = msg.clone();
        assert_eq!(copy.payload(), b"hello\n");
        assert_eq!(copy, msg);
    }
}
