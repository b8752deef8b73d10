//! In-process broker — tokio broadcast channel acting as both publisher and subscriber
//!
//! Lets the service and its clients run in one process without Redis or
//! RabbitMQ. Slow subscribers that lag behind the channel capacity lose the
//! oldest notifications (logged).

use super::{ConfigurationEventMessage, MessageHandler, Publisher, Subscriber};
use crate::error::{ConfigServiceError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const DEFAULT_CAPACITY: usize = 1024;

/// In-memory pub/sub broker
pub struct InMemoryBroker {
    sender: broadcast::Sender<ConfigurationEventMessage>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    published: AtomicU64,
}

impl InMemoryBroker {
    /// Broker with the default channel capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Broker buffering at most `capacity` undelivered notifications per subscriber
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            tasks: Mutex::new(Vec::new()),
            published: AtomicU64::new(0),
        }
    }

    /// Total messages published
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Number of active subscriptions
    pub fn subscription_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Publisher for InMemoryBroker {
    fn name(&self) -> &str {
        "memory"
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn publish(&self, topic: &str, message: &str) -> Result<()> {
        self.published.fetch_add(1, Ordering::Relaxed);
        // No receivers is not an error: nobody is listening yet
        let _ = self
            .sender
            .send(ConfigurationEventMessage::new(topic, message));
        Ok(())
    }
}

#[async_trait]
impl Subscriber for InMemoryBroker {
    fn name(&self) -> &str {
        "memory"
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<()> {
        let mut rx = self.sender.subscribe();
        let topic = topic.to_string();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) if msg.topic == topic => handler(msg),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            topic = %topic,
                            skipped,
                            "In-memory subscriber lagged, notifications dropped"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.tasks
            .lock()
            .map_err(|_| ConfigServiceError::Other("subscriber task list poisoned".into()))?
            .push(handle);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let handles: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            handle.abort();
        }
        Ok(())
    }
}
