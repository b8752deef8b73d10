//! Redis pub/sub transport — channel per resource
//!
//! The publisher keeps one multiplexed connection, connected on
//! `initialize()` or lazily on first publish, and dropped after a failed
//! publish so the next one reconnects. Each subscription owns a dedicated
//! pub/sub connection driven by its own task.

use super::{transport_err, ConfigurationEventMessage, MessageHandler, Publisher, Subscriber};
use crate::config::RedisConnection;
use crate::error::{ConfigServiceError, Result};
use ::redis::AsyncCommands;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Redis publisher
pub struct RedisPublisher {
    client: ::redis::Client,
    redis_url: String,
    /// Owned connection (lazily connected)
    connection: Arc<Mutex<Option<::redis::aio::MultiplexedConnection>>>,
}

impl RedisPublisher {
    /// Create from connection settings; does not connect
    pub fn new(settings: &RedisConnection) -> Result<Self> {
        let redis_url = settings.to_url()?;
        let client = ::redis::Client::open(redis_url.as_str()).map_err(|e| {
            ConfigServiceError::Config(format!("Invalid redis connection '{}': {}", redis_url, e))
        })?;
        Ok(Self {
            client,
            redis_url,
            connection: Arc::new(Mutex::new(None)),
        })
    }

    /// Normalized redis URL
    pub fn redis_url(&self) -> &str {
        &self.redis_url
    }

    /// Get or create the Redis connection
    async fn get_connection(&self) -> Result<::redis::aio::MultiplexedConnection> {
        let mut guard = self.connection.lock().await;
        if let Some(ref conn) = *guard {
            return Ok(conn.clone());
        }

        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| transport_err("redis", "connect", e))?;
        *guard = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl Publisher for RedisPublisher {
    fn name(&self) -> &str {
        "redis"
    }

    async fn initialize(&self) -> Result<()> {
        self.get_connection().await?;
        tracing::info!(redis_url = self.redis_url, "Redis publisher connected");
        Ok(())
    }

    async fn publish(&self, topic: &str, message: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let result: ::redis::RedisResult<i64> = conn.publish(topic, message).await;
        match result {
            Ok(receivers) => {
                tracing::debug!(topic, receivers, "Published to redis");
                Ok(())
            }
            Err(e) => {
                self.connection.lock().await.take();
                Err(transport_err("redis", "publish", e))
            }
        }
    }

    async fn shutdown(&self) -> Result<()> {
        self.connection.lock().await.take();
        Ok(())
    }
}

/// Redis subscriber
pub struct RedisSubscriber {
    client: ::redis::Client,
    redis_url: String,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl RedisSubscriber {
    /// Create from connection settings; does not connect
    pub fn new(settings: &RedisConnection) -> Result<Self> {
        let redis_url = settings.to_url()?;
        let client = ::redis::Client::open(redis_url.as_str()).map_err(|e| {
            ConfigServiceError::Config(format!("Invalid redis connection '{}': {}", redis_url, e))
        })?;
        Ok(Self {
            client,
            redis_url,
            tasks: std::sync::Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Subscriber for RedisSubscriber {
    fn name(&self) -> &str {
        "redis"
    }

    async fn initialize(&self) -> Result<()> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| transport_err("redis", "connect", e))?;
        let _pong: String = ::redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| transport_err("redis", "ping", e))?;
        tracing::info!(redis_url = self.redis_url, "Redis subscriber reachable");
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<()> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| transport_err("redis", "connect", e))?;
        pubsub
            .subscribe(topic)
            .await
            .map_err(|e| transport_err("redis", "subscribe", e))?;

        let topic = topic.to_string();
        tracing::info!(topic = %topic, "Subscribed to redis channel");

        let handle = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                match msg.get_payload::<String>() {
                    Ok(payload) => {
                        handler(ConfigurationEventMessage::new(msg.get_channel_name(), payload))
                    }
                    Err(e) => {
                        tracing::warn!(
                            topic = %topic,
                            error = %e,
                            "Ignoring undecodable redis message"
                        );
                    }
                }
            }
            tracing::warn!(topic = %topic, "Redis subscription stream ended");
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
