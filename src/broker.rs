//! Broker bridge.
//!
//! The service talks to a message broker only through [`BrokerClient`].
//! [`BrokerBridge`] forwards one accepted payload per request and bounds the
//! wait with the configured send timeout. [`InMemoryBroker`] is the bundled
//! client: one bounded channel per declared destination, enough for the
//! service and its listener to exchange messages inside one process.
//! Payloads meant for consumers outside the process go through
//! [`crate::stomp::StompBroker`] instead.

use crate::config::BrokerSettings;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// Decoded request body handed to the broker.
pub type Payload = Map<String, Value>;

/// A payload addressed to a destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub destination: String,
    pub payload: Payload,
}

/// Broker failures.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Messaging is switched off in the configuration.
    #[error("messaging is disabled")]
    Disabled,

    /// The broker does not know the destination.
    #[error("unknown destination: {0}")]
    UnknownDestination(String),

    /// The send was not acknowledged in time.
    #[error("send to {destination} timed out after {}ms", .timeout.as_millis())]
    Timeout {
        destination: String,
        timeout: Duration,
    },

    /// The destination no longer accepts messages.
    #[error("destination {0} is closed")]
    Closed(String),

    /// The broker refused the operation.
    #[error("broker rejected request: {0}")]
    Rejected(String),

    /// The network broker could not be reached or dropped the connection.
    #[error("broker connection failed: {0}")]
    Connection(String),
}

/// Stream of messages from one source.
#[derive(Debug)]
pub struct Subscription {
    source: String,
    receiver: mpsc::Receiver<QueueMessage>,
}

impl Subscription {
    pub fn new(source: impl Into<String>, receiver: mpsc::Receiver<QueueMessage>) -> Self {
        Self {
            source: source.into(),
            receiver,
        }
    }

    /// Name of the subscribed source.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Next message, or `None` once the source is closed.
    pub async fn next(&mut self) -> Option<QueueMessage> {
        self.receiver.recv().await
    }
}

/// Capability the service needs from a message broker.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Send `message`, waiting at most `timeout` for the broker to accept it.
    async fn send(&self, message: QueueMessage, timeout: Duration) -> Result<(), BrokerError>;

    /// Start receiving messages from `source`.
    async fn subscribe(&self, source: &str) -> Result<Subscription, BrokerError>;
}

/// Client used while messaging is disabled; never connects anywhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledBroker;

#[async_trait]
impl BrokerClient for DisabledBroker {
    async fn send(&self, _message: QueueMessage, _timeout: Duration) -> Result<(), BrokerError> {
        Err(BrokerError::Disabled)
    }

    async fn subscribe(&self, _source: &str) -> Result<Subscription, BrokerError> {
        Err(BrokerError::Disabled)
    }
}

struct Queue {
    sender: mpsc::Sender<QueueMessage>,
    /// Taken by the single subscriber.
    receiver: Mutex<Option<mpsc::Receiver<QueueMessage>>>,
}

enum Unclaimed {
    /// The receiver belongs to a subscriber; the message is handed back.
    Claimed(QueueMessage),
    Closed,
}

impl Queue {
    /// Enqueue without waiting while no subscriber holds the receiver,
    /// evicting the oldest buffered message when the queue is full.
    fn push_unclaimed(&self, message: QueueMessage) -> Result<(), Unclaimed> {
        let mut slot = self.receiver.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(receiver) = slot.as_mut() else {
            return Err(Unclaimed::Claimed(message));
        };

        let message = match self.sender.try_send(message) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(message)) => message,
            Err(TrySendError::Closed(_)) => return Err(Unclaimed::Closed),
        };
        if let Ok(evicted) = receiver.try_recv() {
            debug!(destination = %evicted.destination, "No subscriber, dropped oldest message");
        }
        self.sender.try_send(message).map_err(|_| Unclaimed::Closed)
    }
}

/// In-process broker with a fixed set of bounded destinations.
///
/// Until a destination is subscribed to, it retains only the most recent
/// `capacity` messages and sends never wait. Once subscribed, a full
/// destination makes senders wait up to their timeout.
pub struct InMemoryBroker {
    queues: HashMap<String, Queue>,
}

impl InMemoryBroker {
    /// Declare `destinations`, each buffering up to `capacity` messages.
    pub fn new<I, S>(destinations: I, capacity: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let queues = destinations
            .into_iter()
            .map(|name| {
                let (sender, receiver) = mpsc::channel(capacity.max(1));
                (
                    name.into(),
                    Queue {
                        sender,
                        receiver: Mutex::new(Some(receiver)),
                    },
                )
            })
            .collect();
        Self { queues }
    }

    /// Broker declaring every destination from the settings.
    pub fn from_settings(settings: &BrokerSettings) -> Self {
        Self::new(settings.destinations.iter().cloned(), settings.queue_capacity)
    }

    /// Names of the declared destinations, sorted.
    pub fn destinations(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.queues.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn queue(&self, name: &str) -> Result<&Queue, BrokerError> {
        self.queues
            .get(name)
            .ok_or_else(|| BrokerError::UnknownDestination(name.to_string()))
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn send(&self, message: QueueMessage, timeout: Duration) -> Result<(), BrokerError> {
        let destination = message.destination.clone();
        let queue = self.queue(&destination)?;

        // Without a subscriber nobody drains the queue: keep the newest messages
        let message = match queue.push_unclaimed(message) {
            Ok(()) => return Ok(()),
            Err(Unclaimed::Claimed(message)) => message,
            Err(Unclaimed::Closed) => return Err(BrokerError::Closed(destination)),
        };

        // A subscriber exists, so a full queue applies back-pressure
        match tokio::time::timeout(timeout, queue.sender.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(BrokerError::Closed(destination)),
            Err(_) => Err(BrokerError::Timeout {
                destination,
                timeout,
            }),
        }
    }

    async fn subscribe(&self, source: &str) -> Result<Subscription, BrokerError> {
        let receiver = self
            .queue(source)?
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| {
                BrokerError::Rejected(format!("source {source} already has a subscriber"))
            })?;
        debug!(source = %source, "Subscribed");
        Ok(Subscription::new(source, receiver))
    }
}

/// Forwards accepted payloads to the broker, one send per call.
#[derive(Clone)]
pub struct BrokerBridge {
    client: Arc<dyn BrokerClient>,
    timeout: Duration,
}

impl BrokerBridge {
    pub fn new(client: Arc<dyn BrokerClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Send `payload` to `destination` and wait for the outcome.
    ///
    /// The wait is bounded even if the client ignores its timeout argument.
    pub async fn forward(&self, destination: &str, payload: Payload) -> Result<(), BrokerError> {
        let message = QueueMessage {
            destination: destination.to_string(),
            payload,
        };

        // Send once, bounded by the configured timeout
        let result = match tokio::time::timeout(self.timeout, self.client.send(message, self.timeout))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout {
                destination: destination.to_string(),
                timeout: self.timeout,
            }),
        };

        match &result {
            Ok(()) => info!(destination = %destination, "Payload forwarded"),
            Err(e) => warn!(destination = %destination, error = %e, "Forward failed"),
        }
        result
    }
}
