//! RabbitMQ transport — fanout exchange with a JSON envelope
//!
//! The publisher declares the durable fanout exchange and publishes the
//! `{"Topic","Message"}` envelope with the topic as routing key. Each
//! subscription binds its own exclusive, auto-delete queue and drops
//! envelopes for other topics.

use super::{transport_err, ConfigurationEventMessage, MessageHandler, Publisher, Subscriber};
use crate::config::RabbitMqOptions;
use crate::error::{ConfigServiceError, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// An open connection plus the channel used on it
struct AmqpSession {
    connection: Connection,
    channel: Channel,
}

impl AmqpSession {
    async fn open(options: &RabbitMqOptions) -> Result<Self> {
        let connection = Connection::connect(&options.amqp_uri(), ConnectionProperties::default())
            .await
            .map_err(|e| transport_err("rabbitmq", "connect", e))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| transport_err("rabbitmq", "open channel", e))?;
        channel
            .exchange_declare(
                &options.exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| transport_err("rabbitmq", "declare exchange", e))?;

        tracing::info!(
            host = %options.hostname,
            vhost = %options.virtual_host,
            exchange = %options.exchange,
            "RabbitMQ session opened"
        );
        Ok(Self {
            connection,
            channel,
        })
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn close(self) {
        if let Err(e) = self.connection.close(200, "shutdown").await {
            tracing::debug!(error = %e, "RabbitMQ connection close failed");
        }
    }
}

/// Lazily (re)opened session shared by publisher and subscriber
struct SessionSlot {
    options: RabbitMqOptions,
    session: Mutex<Option<AmqpSession>>,
}

impl SessionSlot {
    fn new(options: RabbitMqOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            session: Mutex::new(None),
        })
    }

    /// Channel of the open session, reconnecting if it was closed
    async fn channel(&self) -> Result<Channel> {
        let mut guard = self.session.lock().await;
        if let Some(ref session) = *guard {
            if session.is_open() {
                return Ok(session.channel.clone());
            }
        }
        if let Some(stale) = guard.take() {
            stale.close().await;
        }

        let session = AmqpSession::open(&self.options).await?;
        let channel = session.channel.clone();
        *guard = Some(session);
        Ok(channel)
    }

    async fn close(&self) {
        if let Some(session) = self.session.lock().await.take() {
            session.close().await;
        }
    }
}

/// RabbitMQ publisher
pub struct RabbitMqPublisher {
    slot: SessionSlot,
}

impl RabbitMqPublisher {
    /// Create from options; does not connect
    pub fn new(options: RabbitMqOptions) -> Result<Self> {
        Ok(Self {
            slot: SessionSlot::new(options)?,
        })
    }

    /// Connection options
    pub fn options(&self) -> &RabbitMqOptions {
        &self.slot.options
    }
}

#[async_trait]
impl Publisher for RabbitMqPublisher {
    fn name(&self) -> &str {
        "rabbitmq"
    }

    async fn initialize(&self) -> Result<()> {
        self.slot.channel().await.map(|_| ())
    }

    async fn publish(&self, topic: &str, message: &str) -> Result<()> {
        let body = ConfigurationEventMessage::new(topic, message).to_json()?;
        let channel = self.slot.channel().await?;

        let confirm = channel
            .basic_publish(
                &self.slot.options.exchange,
                topic,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default(),
            )
            .await
            .map_err(|e| transport_err("rabbitmq", "publish", e))?;
        confirm
            .await
            .map_err(|e| transport_err("rabbitmq", "publish confirm", e))?;

        tracing::debug!(topic, exchange = %self.slot.options.exchange, "Published to rabbitmq");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.slot.close().await;
        Ok(())
    }
}

/// RabbitMQ subscriber
pub struct RabbitMqSubscriber {
    slot: SessionSlot,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl RabbitMqSubscriber {
    /// Create from options; does not connect
    pub fn new(options: RabbitMqOptions) -> Result<Self> {
        Ok(Self {
            slot: SessionSlot::new(options)?,
            tasks: std::sync::Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Subscriber for RabbitMqSubscriber {
    fn name(&self) -> &str {
        "rabbitmq"
    }

    async fn initialize(&self) -> Result<()> {
        self.slot.channel().await.map(|_| ())
    }

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<()> {
        let channel = self.slot.channel().await?;

        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| transport_err("rabbitmq", "declare queue", e))?;
        channel
            .queue_bind(
                queue.name().as_str(),
                &self.slot.options.exchange,
                topic,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| transport_err("rabbitmq", "bind queue", e))?;
        let mut consumer = channel
            .basic_consume(
                queue.name().as_str(),
                &format!("a3s-config:{}", topic),
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| transport_err("rabbitmq", "consume", e))?;

        let topic = topic.to_string();
        tracing::info!(topic = %topic, queue = %queue.name(), "Subscribed to rabbitmq exchange");

        let handle = tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::error!(topic = %topic, error = %e, "RabbitMQ consumer error");
                        break;
                    }
                };
                match ConfigurationEventMessage::from_json(&delivery.data) {
                    Ok(msg) if msg.topic == topic => handler(msg),
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(topic = %topic, error = %e, "Ignoring malformed rabbitmq envelope");
                    }
                }
            }
            tracing::warn!(topic = %topic, "RabbitMQ subscription ended");
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
        self.slot.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn unreachable() -> RabbitMqOptions {
        RabbitMqOptions {
            hostname: "127.0.0.1".into(),
            port: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_new_validates_options() {
        let mut options = RabbitMqOptions::default();
        options.hostname.clear();
        assert!(RabbitMqPublisher::new(options.clone()).is_err());
        assert!(RabbitMqSubscriber::new(options).is_err());
    }

    #[test]
    fn test_publisher_keeps_options() {
        let publisher = RabbitMqPublisher::new(RabbitMqOptions::default()).unwrap();
        assert_eq!(publisher.options().exchange, "configuration-service");
        assert_eq!(publisher.name(), "rabbitmq");
    }

    #[tokio::test]
    async fn test_publish_to_unreachable_broker_fails() {
        let publisher = RabbitMqPublisher::new(unreachable()).unwrap();
        let err = publisher.publish("app.json", "app.json").await.unwrap_err();
        assert!(matches!(err, ConfigServiceError::Transport(_)));
    }

    #[tokio::test]
    async fn test_subscribe_to_unreachable_broker_fails() {
        let subscriber = RabbitMqSubscriber::new(unreachable()).unwrap();
        let handler: MessageHandler = Arc::new(|_| {});
        assert!(subscriber.subscribe("app.json", handler).await.is_err());
        assert!(Subscriber::shutdown(&subscriber).await.is_ok());
    }
}
