//! Background consumer for broker sources.
//!
//! One task per configured source pulls messages and passes each to a
//! [`MessageHandler`]. A handler that errors or panics only loses its own
//! message; the loop moves on to the next one.

use crate::broker::{BrokerClient, BrokerError, QueueMessage, Subscription};
use crate::config::BrokerSettings;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Callback invoked for every received message.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: QueueMessage) -> anyhow::Result<()>;
}

/// Default handler: logs what arrived.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(&self, message: QueueMessage) -> anyhow::Result<()> {
        let received_at = Utc::now().to_rfc3339();
        let payload = Value::Object(message.payload);
        info!(
            source = %message.destination,
            received_at = %received_at,
            payload = %payload,
            "Message received"
        );
        Ok(())
    }
}

/// Delivery counters of a stopped listener.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub delivered: u64,
    pub failed: u64,
}

impl ListenerStats {
    fn merge(self, other: Self) -> Self {
        Self {
            delivered: self.delivered + other.delivered,
            failed: self.failed + other.failed,
        }
    }
}

/// Running listener tasks. Dropping the handle also stops them.
pub struct ListenerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<ListenerStats>>,
}

impl ListenerHandle {
    /// Number of subscribed sources.
    pub fn source_count(&self) -> usize {
        self.tasks.len()
    }

    /// Stop every task and wait for it to finish.
    pub async fn shutdown(self) -> ListenerStats {
        let _ = self.shutdown.send(true);
        let mut stats = ListenerStats::default();
        for task in self.tasks {
            match task.await {
                Ok(task_stats) => stats = stats.merge(task_stats),
                Err(e) => error!(error = %e, "Listener task failed"),
            }
        }
        info!(
            delivered = stats.delivered,
            failed = stats.failed,
            "Listener stopped"
        );
        stats
    }
}

/// Subscribes to sources and drives the handler.
pub struct Listener {
    client: Arc<dyn BrokerClient>,
    handler: Arc<dyn MessageHandler>,
}

impl Listener {
    pub fn new(client: Arc<dyn BrokerClient>, handler: Arc<dyn MessageHandler>) -> Self {
        Self { client, handler }
    }

    /// Subscribe to every source and spawn one consumer task per source.
    pub async fn start(&self, sources: &[String]) -> Result<ListenerHandle, BrokerError> {
        let mut subscriptions = Vec::with_capacity(sources.len());
        for source in sources {
            subscriptions.push(self.client.subscribe(source).await?);
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let tasks = subscriptions
            .into_iter()
            .map(|subscription| {
                info!(source = %subscription.source(), "Listening");
                tokio::spawn(consume(
                    subscription,
                    self.handler.clone(),
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        Ok(ListenerHandle { shutdown, tasks })
    }

    /// Start on the configured sources, or do nothing while messaging is disabled.
    pub async fn start_configured(
        &self,
        settings: &BrokerSettings,
    ) -> Result<Option<ListenerHandle>, BrokerError> {
        if !settings.enabled {
            debug!("Messaging disabled, listener not started");
            return Ok(None);
        }
        self.start(&settings.consumer.sources).await.map(Some)
    }
}

async fn consume(
    mut subscription: Subscription,
    handler: Arc<dyn MessageHandler>,
    mut shutdown: watch::Receiver<bool>,
) -> ListenerStats {
    let mut stats = ListenerStats::default();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            next = subscription.next() => match next {
                Some(message) => {
                    if dispatch(subscription.source(), &handler, message).await {
                        stats.delivered += 1;
                    } else {
                        stats.failed += 1;
                    }
                }
                None => {
                    info!(source = %subscription.source(), "Source closed");
                    break;
                }
            },
        }
    }
    stats
}

/// Run the handler for one message in its own task so a panic stays contained.
async fn dispatch(source: &str, handler: &Arc<dyn MessageHandler>, message: QueueMessage) -> bool {
    let handler = handler.clone();
    match tokio::spawn(async move { handler.handle(message).await }).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(source = %source, error = %e, "Message handler failed");
            false
        }
        Err(e) => {
            error!(source = %source, error = %e, "Message handler panicked");
            false
        }
    }
}
