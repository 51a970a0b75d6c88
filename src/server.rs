//! TCP accept loop

use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::broker::BrokerHandle;
use crate::config::RelayConfig;
use crate::connection::Connection;
use crate::types::ConnectionId;

/// Accept connections until `shutdown` completes.
///
/// Each accepted socket gets a fresh [`ConnectionId`] and its own supervisor
/// task. Connections already running are left to finish on their own.
pub async fn serve<F>(
    listener: TcpListener,
    broker: BrokerHandle,
    config: Arc<RelayConfig>,
    shutdown: F,
) where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => {
                tracing::info!("Accept loop shutting down");
                break;
            }

            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let conn = Connection::new(
                        ConnectionId::new(),
                        addr.to_string(),
                        broker.clone(),
                        config.clone(),
                    );
                    tokio::spawn(conn.run(stream));
                }
                Err(e) => {
                    tracing::error!("Can't accept: {}", e);
                }
            },
        }
    }
}
