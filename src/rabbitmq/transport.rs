// src/rabbitmq/transport.rs
//
// The transport seam: everything the supervisor, pool and consumers need from an
// AMQP 0-9-1 client library. `LapinTransport` is the production implementation,
// `testing::MemoryBroker` the in-process one.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use thiserror::Error;

use crate::config::ConnectionConfig;
use crate::message::MessageProperties;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Publish was negatively acknowledged by the broker")]
    Nacked,

    #[error("Connection or channel is closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl TransportError {
    /// Transient errors are the ones a reconnect can cure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionError(_)
                | TransportError::ChannelError(_)
                | TransportError::Nacked
                | TransportError::Closed
                | TransportError::Io(_)
        )
    }
}

/// Options for `queue.declare`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub passive: bool,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            passive: false,
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }
}

impl QueueOptions {
    pub fn passive() -> Self {
        Self {
            passive: true,
            durable: false,
            ..Self::default()
        }
    }

    pub fn durable(durable: bool) -> Self {
        Self {
            durable,
            ..Self::default()
        }
    }
}

/// Broker answer to `queue.declare`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Options for `basic.consume`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub no_ack: bool,
    pub exclusive: bool,
}

/// A raw delivery as handed over by the transport
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, TransportError>>;

/// Opens physical connections to a broker
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn TransportConnection>, TransportError>;
}

/// One physical broker connection
#[async_trait]
pub trait TransportConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>, TransportError>;

    fn is_open(&self) -> bool;

    /// Resolves once the connection is lost (socket error, missed heartbeat,
    /// broker-initiated close). Returns immediately if it is already gone.
    async fn closed(&self);

    async fn close(&self) -> Result<(), TransportError>;
}

/// One AMQP channel. Not shared between consumers; the publish channel is
/// serialized by the pool.
#[async_trait]
pub trait TransportChannel: Send + Sync {
    fn id(&self) -> u16;

    fn is_open(&self) -> bool;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), TransportError>;

    async fn confirm_select(&self) -> Result<(), TransportError>;

    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueOptions,
    ) -> Result<QueueInfo, TransportError>;

    async fn queue_purge(&self, queue: &str) -> Result<u32, TransportError>;

    /// Publishes through the default exchange, routing key = queue name.
    async fn basic_publish(
        &self,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), TransportError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, TransportError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors() {
        assert!(TransportError::ConnectionError("reset".into()).is_transient());
        assert!(TransportError::Nacked.is_transient());
        assert!(!TransportError::NotFound("q".into()).is_transient());
        assert!(!TransportError::Protocol("PRECONDITION_FAILED".into()).is_transient());
    }

    #[test]
    fn passive_options_do_not_request_durability() {
        let options = QueueOptions::passive();
        assert!(options.passive);
        assert!(!options.durable);
        assert!(QueueOptions::default().durable);
    }
}
