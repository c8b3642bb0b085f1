// src/message.rs
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

use crate::rabbitmq::connection::Generation;
use crate::rabbitmq::transport::TransportChannel;
use crate::rabbitmq::{RabbitMQError, Result};

/// AMQP basic properties carried by a published or delivered message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub message_id: Option<String>,
    pub expiration: Option<String>,
    pub priority: Option<u8>,
    /// 1 = transient, 2 = persistent
    pub delivery_mode: Option<u8>,
    /// Seconds since the Unix epoch
    pub timestamp: Option<u64>,
    #[serde(default)]
    pub headers: BTreeMap<String, serde_json::Value>,
}

impl MessageProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_content_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.content_encoding = Some(encoding.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_expiration(mut self, expiration: impl Into<String>) -> Self {
        self.expiration = Some(expiration.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn persistent(mut self) -> Self {
        self.delivery_mode = Some(2);
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Settlement state shared by a delivered message and its consumer loop.
pub(crate) struct Settlement {
    channel: Arc<dyn TransportChannel>,
    generation: u64,
    current: Arc<Generation>,
    no_ack: bool,
    settled: AtomicBool,
}

impl Settlement {
    pub(crate) fn new(
        channel: Arc<dyn TransportChannel>,
        generation: u64,
        current: Arc<Generation>,
        no_ack: bool,
    ) -> Self {
        Self {
            channel,
            generation,
            current,
            no_ack,
            settled: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.no_ack || self.settled.load(Ordering::Acquire)
    }

    fn is_stale(&self) -> bool {
        !self.current.is_current(self.generation) || !self.channel.is_open()
    }

    pub(crate) async fn settle(&self, queue: &str, delivery_tag: u64, ack: bool, requeue: bool) -> Result<()> {
        if self.no_ack {
            return Ok(());
        }
        if self.is_stale() {
            warn!(queue = %queue, delivery_tag, generation = self.generation, "Cannot settle delivery from a retired channel");
            return Err(RabbitMQError::StaleDelivery {
                queue: queue.to_string(),
                delivery_tag,
            });
        }
        if self.settled.swap(true, Ordering::AcqRel) {
            return Err(RabbitMQError::AlreadySettled(delivery_tag));
        }
        let outcome = if ack {
            self.channel.basic_ack(delivery_tag).await
        } else {
            self.channel.basic_nack(delivery_tag, requeue).await
        };
        outcome.map_err(|e| RabbitMQError::AckError(e.to_string()))
    }
}

/// A delivery handed to a `MessageHandler`
#[derive(Clone)]
pub struct Message {
    queue: String,
    body: Vec<u8>,
    properties: MessageProperties,
    delivery_tag: u64,
    redelivered: bool,
    settlement: Arc<Settlement>,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("queue", &self.queue)
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("len", &self.body.len())
            .field("properties", &self.properties)
            .finish()
    }
}

impl Message {
    pub(crate) fn new(
        queue: String,
        body: Vec<u8>,
        properties: MessageProperties,
        delivery_tag: u64,
        redelivered: bool,
        settlement: Arc<Settlement>,
    ) -> Self {
        Self {
            queue,
            body,
            properties,
            delivery_tag,
            redelivered,
            settlement,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    /// Body as UTF-8, lossy.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn properties(&self) -> &MessageProperties {
        &self.properties
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// True once acked/nacked/rejected, and always in no-ack mode.
    pub fn is_settled(&self) -> bool {
        self.settlement.is_settled()
    }

    pub async fn ack(&self) -> Result<()> {
        self.settlement.settle(&self.queue, self.delivery_tag, true, false).await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.settlement.settle(&self.queue, self.delivery_tag, false, requeue).await
    }

    /// Single-message rejection; same wire effect as `nack` for one delivery.
    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.nack(requeue).await
    }
}
