//! Broker actor
//!
//! Owns the set of subscriber queues. Every mutation and every fan-out runs on
//! the broker's own task; the rest of the process only talks to it through a
//! [`BrokerHandle`].
//!
//! ```text
//! Supervisor --subscribe/unsubscribe/publish--> Broker --try_send--> SubscriberQueue --> Writer
//! ```

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::types::{Message, SubscriptionId};

/// Requests processed by the broker loop, one at a time
#[derive(Debug)]
enum Command {
    Subscribe {
        id: SubscriptionId,
        queue: mpsc::Sender<Message>,
    },
    Unsubscribe(SubscriptionId),
    Publish(Message),
    Stats(oneshot::Sender<BrokerStats>),
}

/// Counters kept by the broker loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Queues currently registered
    pub subscribers: usize,
    /// Messages fanned out
    pub published: u64,
    /// Successful enqueues across all subscribers
    pub delivered: u64,
    /// Enqueues skipped because the subscriber's queue was full
    pub dropped: u64,
}

/// Receiving end of one subscription.
///
/// Fed by the broker with a non-blocking offer, so a consumer that falls
/// behind loses messages instead of stalling everyone else.
#[derive(Debug)]
pub struct SubscriberQueue {
    id: SubscriptionId,
    rx: mpsc::Receiver<Message>,
}

impl SubscriberQueue {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next message; `None` once the broker has let go of the queue
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

/// Cloneable entry point into a running [`Broker`]
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    inbox: mpsc::Sender<Command>,
    stop: CancellationToken,
    queue_capacity: usize,
}

impl BrokerHandle {
    /// Allocate a fresh queue and register it.
    ///
    /// Never fails: if the broker is gone the queue comes back already closed.
    pub async fn subscribe(&self) -> SubscriberQueue {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = SubscriptionId::new();

        if self
            .inbox
            .send(Command::Subscribe { id, queue: tx })
            .await
            .is_err()
        {
            tracing::debug!(subscription = %id, "Subscribe after broker stopped");
        }

        SubscriberQueue { id, rx }
    }

    /// Remove a queue from the broker. Unknown or already removed ids are ignored.
    pub async fn unsubscribe(&self, id: SubscriptionId) {
        if self.inbox.send(Command::Unsubscribe(id)).await.is_err() {
            tracing::debug!(subscription = %id, "Unsubscribe after broker stopped");
        }
    }

    /// Hand a message over for fan-out. Returns once the broker has accepted it,
    /// not once it has been delivered.
    pub async fn publish(&self, msg: Message) {
        if self.inbox.send(Command::Publish(msg)).await.is_err() {
            tracing::debug!("Publish after broker stopped, message discarded");
        }
    }

    /// Snapshot of the broker's counters, answered from inside the loop
    pub async fn stats(&self) -> Result<BrokerStats> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(Command::Stats(tx))
            .await
            .map_err(|_| RelayError::BrokerStopped)?;
        rx.await.map_err(|_| RelayError::BrokerStopped)
    }

    /// Terminate the broker loop. Irreversible; calling it again does nothing.
    pub fn stop(&self) {
        if !self.stop.is_cancelled() {
            tracing::info!("Stopping broker");
        }
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}

/// The actor itself. Create with [`Broker::new`], then [`Broker::start`] it.
pub struct Broker {
    inbox: mpsc::Receiver<Command>,
    stop: CancellationToken,
    subscribers: HashMap<SubscriptionId, mpsc::Sender<Message>>,
    stats: BrokerStats,
}

impl Broker {
    pub fn new(config: &RelayConfig) -> (Self, BrokerHandle) {
        let (tx, rx) = mpsc::channel(config.broker_inbox.max(1));
        let stop = CancellationToken::new();

        let broker = Self {
            inbox: rx,
            stop: stop.clone(),
            subscribers: HashMap::new(),
            stats: BrokerStats::default(),
        };
        let handle = BrokerHandle {
            inbox: tx,
            stop,
            queue_capacity: config.queue_capacity.max(1),
        };

        (broker, handle)
    }

    /// Spawn the control loop onto the runtime
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run the control loop until stopped or every handle is dropped
    pub async fn run(mut self) {
        tracing::info!("Broker started");

        loop {
            tokio::select! {
                biased;

                () = self.stop.cancelled() => {
                    break;
                }

                cmd = self.inbox.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => {
                        tracing::debug!("All broker handles dropped");
                        break;
                    }
                },
            }
        }

        // Dropping the senders closes every subscriber queue
        tracing::info!(
            subscribers = self.subscribers.len(),
            published = self.stats.published,
            dropped = self.stats.dropped,
            "Broker stopped"
        );
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Subscribe { id, queue } => {
                self.subscribers.insert(id, queue);
                tracing::debug!(
                    subscription = %id,
                    subscribers = self.subscribers.len(),
                    "Subscribed"
                );
            }

            Command::Unsubscribe(id) => {
                if self.subscribers.remove(&id).is_some() {
                    tracing::debug!(
                        subscription = %id,
                        subscribers = self.subscribers.len(),
                        "Unsubscribed"
                    );
                }
            }

            Command::Publish(msg) => self.fan_out(msg),

            Command::Stats(reply) => {
                let stats = BrokerStats {
                    subscribers: self.subscribers.len(),
                    ..self.stats
                };
                // Requester may have given up waiting
                let _ = reply.send(stats);
            }
        }
    }

    /// Offer `msg` to every registered queue without ever waiting on one
    fn fan_out(&mut self, msg: Message) {
        let mut delivered = 0;
        let mut dropped = 0;

        self.subscribers.retain(|id, queue| match queue.try_send(msg.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(subscription = %id, origin = %msg.origin(), "Queue full, message dropped");
                dropped += 1;
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(subscription = %id, "Queue receiver gone, pruning");
                false
            }
        });

        self.stats.published += 1;
        self.stats.delivered += delivered;
        self.stats.dropped += dropped;
    }
}
