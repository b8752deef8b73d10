//! Pub/sub transports — change notifications between service and clients
//!
//! Every notification is a [`ConfigurationEventMessage`] whose topic and
//! message are both the name of the changed resource. Subscribers always
//! re-fetch content from the fetch endpoint.
//!
//! | Transport | Routing | Payload |
//! |-----------|---------|---------|
//! | Redis     | channel = topic | message string |
//! | RabbitMQ  | fanout exchange, filtered by topic | JSON envelope |
//! | In-memory | tokio broadcast, filtered by topic | struct |

pub mod memory;
pub mod rabbitmq;
pub mod redis_pubsub;

pub use self::memory::InMemoryBroker;
pub use self::rabbitmq::{RabbitMqPublisher, RabbitMqSubscriber};
pub use self::redis_pubsub::{RedisPublisher, RedisSubscriber};

use crate::config::{RabbitMqOptions, RedisConnection};
use crate::error::{ConfigServiceError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Wire payload of a change notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConfigurationEventMessage {
    /// Routing topic (the resource name)
    pub topic: String,
    /// Message body (the resource name)
    pub message: String,
}

impl ConfigurationEventMessage {
    /// Create a message
    pub fn new(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Notification that `resource` changed
    pub fn for_resource(resource: &str) -> Self {
        Self::new(resource, resource)
    }

    /// Name of the resource to re-fetch
    pub fn resource(&self) -> &str {
        if self.message.is_empty() {
            &self.topic
        } else {
            &self.message
        }
    }

    /// Encode as the JSON envelope
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode the JSON envelope
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Callback invoked on the transport's task for every matching notification
pub type MessageHandler = Arc<dyn Fn(ConfigurationEventMessage) + Send + Sync>;

/// Fire-and-forget publisher
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Transport name for logging
    fn name(&self) -> &str;

    /// Acquire the connection
    async fn initialize(&self) -> Result<()>;

    /// Publish `message` on `topic`
    async fn publish(&self, topic: &str, message: &str) -> Result<()>;

    /// Release the connection
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Topic subscriber
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Transport name for logging
    fn name(&self) -> &str;

    /// Acquire the connection
    async fn initialize(&self) -> Result<()>;

    /// Invoke `handler` for every notification on `topic` until shutdown.
    /// Returns once the subscription is registered.
    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<()>;

    /// Stop listener tasks and release the connection
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Publishes every message through each inner publisher.
///
/// All publishers are attempted; the first failure is returned afterwards.
pub struct FanoutPublisher {
    publishers: Vec<Arc<dyn Publisher>>,
}

impl FanoutPublisher {
    /// Wrap a set of publishers
    pub fn new(publishers: Vec<Arc<dyn Publisher>>) -> Self {
        Self { publishers }
    }

    /// Number of inner publishers
    pub fn len(&self) -> usize {
        self.publishers.len()
    }

    /// Whether there are no inner publishers
    pub fn is_empty(&self) -> bool {
        self.publishers.is_empty()
    }
}

#[async_trait]
impl Publisher for FanoutPublisher {
    fn name(&self) -> &str {
        "fanout"
    }

    async fn initialize(&self) -> Result<()> {
        let mut first_err = None;
        for publisher in &self.publishers {
            if let Err(e) = publisher.initialize().await {
                tracing::error!(transport = publisher.name(), error = %e, "Publisher initialization failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    async fn publish(&self, topic: &str, message: &str) -> Result<()> {
        let mut first_err = None;
        for publisher in &self.publishers {
            if let Err(e) = publisher.publish(topic, message).await {
                tracing::error!(transport = publisher.name(), topic, error = %e, "Publish failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    async fn shutdown(&self) -> Result<()> {
        for publisher in &self.publishers {
            if let Err(e) = publisher.shutdown().await {
                tracing::warn!(transport = publisher.name(), error = %e, "Publisher shutdown failed");
            }
        }
        Ok(())
    }
}

/// Build the publisher for the configured transports.
///
/// `None` when no transport is configured (detection-only mode).
pub fn publisher_from_config(
    redis: Option<&RedisConnection>,
    rabbitmq: Option<&RabbitMqOptions>,
) -> Result<Option<Arc<dyn Publisher>>> {
    let mut publishers: Vec<Arc<dyn Publisher>> = Vec::new();
    if let Some(redis) = redis {
        publishers.push(Arc::new(RedisPublisher::new(redis)?));
    }
    if let Some(rabbitmq) = rabbitmq {
        publishers.push(Arc::new(RabbitMqPublisher::new(rabbitmq.clone())?));
    }

    Ok(match publishers.len() {
        0 => None,
        1 => publishers.pop(),
        _ => Some(Arc::new(FanoutPublisher::new(publishers)) as Arc<dyn Publisher>),
    })
}

/// Build one subscriber per configured transport
pub fn subscribers_from_config(
    redis: Option<&RedisConnection>,
    rabbitmq: Option<&RabbitMqOptions>,
) -> Result<Vec<Arc<dyn Subscriber>>> {
    let mut subscribers: Vec<Arc<dyn Subscriber>> = Vec::new();
    if let Some(redis) = redis {
        subscribers.push(Arc::new(RedisSubscriber::new(redis)?));
    }
    if let Some(rabbitmq) = rabbitmq {
        subscribers.push(Arc::new(RabbitMqSubscriber::new(rabbitmq.clone())?));
    }
    Ok(subscribers)
}

pub(crate) fn transport_err(
    transport: &str,
    action: &str,
    e: impl std::fmt::Display,
) -> ConfigServiceError {
    ConfigServiceError::Transport(format!("{} {} failed: {}", transport, action, e))
}
