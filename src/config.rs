//! Relay configuration
//!
//! Everything is read from environment variables (a `.env` file is loaded by
//! `main` before this runs). Unset, unparsable or zero values fall back to the
//! defaults below with a warning; a message ceiling above [`MESSAGE_LEN_LIMIT`]
//! is capped.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{RelayError, Result};
use crate::types::{MAX_MESSAGE_LEN, MESSAGE_LEN_LIMIT, SUBSCRIBER_QUEUE_CAPACITY};

const DEFAULT_ADDR: &str = "0.0.0.0:9001";

/// Runtime settings for the broker and connection handling
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the accept loop binds to
    pub addr: SocketAddr,
    /// Largest accepted read; anything larger drops the connection
    pub max_message_len: usize,
    /// Capacity of each subscriber queue
    pub queue_capacity: usize,
    /// Capacity of the broker's command inbox
    pub broker_inbox: usize,
    /// Consecutive transient read errors tolerated before giving up
    pub read_retry_limit: u32,
    /// Pause between read retries
    pub read_retry_backoff: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 9001)),
            max_message_len: MAX_MESSAGE_LEN,
            queue_capacity: SUBSCRIBER_QUEUE_CAPACITY,
            broker_inbox: 64,
            read_retry_limit: 8,
            read_retry_backoff: Duration::from_millis(50),
        }
    }
}

impl RelayConfig {
    /// Load config from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let addr = match std::env::var("RELAY_ADDR") {
            Ok(v) => match v.trim().parse() {
                Ok(addr) => addr,
                Err(e) => {
                    tracing::warn!(
                        value = %v,
                        "Invalid RELAY_ADDR ({}), using {}",
                        e,
                        DEFAULT_ADDR
                    );
                    defaults.addr
                }
            },
            Err(_) => defaults.addr,
        };

        let mut max_message_len =
            positive_var("RELAY_MAX_MESSAGE_LEN").unwrap_or(defaults.max_message_len);
        if max_message_len > MESSAGE_LEN_LIMIT {
            tracing::warn!(
                requested = max_message_len,
                limit = MESSAGE_LEN_LIMIT,
                "RELAY_MAX_MESSAGE_LEN too large, capping"
            );
            max_message_len = MESSAGE_LEN_LIMIT;
        }
        let queue_capacity =
            positive_var("RELAY_QUEUE_CAPACITY").unwrap_or(defaults.queue_capacity);
        let broker_inbox = positive_var("RELAY_BROKER_INBOX").unwrap_or(defaults.broker_inbox);

        // Zero is meaningful here: give up on the first transient error
        let read_retry_limit = match std::env::var("RELAY_READ_RETRY_LIMIT") {
            Ok(v) => v.trim().parse().unwrap_or_else(|_| {
                tracing::warn!(
                    name = "RELAY_READ_RETRY_LIMIT",
                    value = %v,
                    "Ignoring invalid value, using default"
                );
                defaults.read_retry_limit
            }),
            Err(_) => defaults.read_retry_limit,
        };

        let read_retry_backoff = positive_var("RELAY_READ_RETRY_BACKOFF_MS")
            .map(|ms| Duration::from_millis(ms as u64))
            .unwrap_or(defaults.read_retry_backoff);

        let config = Self {
            addr,
            max_message_len,
            queue_capacity,
            broker_inbox,
            read_retry_limit,
            read_retry_backoff,
        };

        tracing::info!(
            addr = %config.addr,
            max_message_len = config.max_message_len,
            queue_capacity = config.queue_capacity,
            broker_inbox = config.broker_inbox,
            read_retry_limit = config.read_retry_limit,
            read_retry_backoff_ms = config.read_retry_backoff.as_millis() as u64,
            "Relay config loaded"
        );

        config
    }

    /// Reject settings the relay cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_message_len == 0 || self.max_message_len > MESSAGE_LEN_LIMIT {
            return Err(RelayError::Config(format!(
                "max_message_len must be between 1 and {}, got {}",
                MESSAGE_LEN_LIMIT, self.max_message_len
            )));
        }
        if self.queue_capacity == 0 {
            return Err(RelayError::Config("queue_capacity must be at least 1".to_string()));
        }
        if self.broker_inbox == 0 {
            return Err(RelayError::Config("broker_inbox must be at least 1".to_string()));
        }
        if self.read_retry_backoff.is_zero() {
            return Err(RelayError::Config("read_retry_backoff must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Parse a strictly positive integer variable, warning on junk
fn positive_var(name: &str) -> Option<usize> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<usize>() {
        Ok(0) | Err(_) => {
            tracing::warn!(name, value = %raw, "Ignoring invalid value, using default");
            None
        }
        Ok(n) => Some(n),
    }
}
