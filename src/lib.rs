// Public API for integration tests and embedding the relay

pub mod broker;
pub mod config;
pub mod connection;
pub mod error;
pub mod server;
pub mod types;

pub use broker::{Broker, BrokerHandle, BrokerStats, SubscriberQueue};
pub use config::RelayConfig;
pub use connection::{Connection, ConnectionState};
pub use error::{RelayError, Result};
pub use types::{ConnectionId, Message, SubscriptionId};
