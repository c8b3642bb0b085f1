// src/rabbitmq/lapin_transport.rs
use amq_protocol_types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions, QueuePurgeOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::uri::AMQPUri;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::transport::{
    ConsumeOptions, Delivery, DeliveryStream, QueueInfo, QueueOptions, Transport, TransportChannel,
    TransportConnection, TransportError,
};
use crate::config::ConnectionConfig;
use crate::message::MessageProperties;

impl From<lapin::Error> for TransportError {
    fn from(err: lapin::Error) -> Self {
        match &err {
            lapin::Error::ProtocolError(amqp) => match amqp.kind() {
                AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => {
                    TransportError::NotFound(amqp.get_message().as_str().to_string())
                }
                AMQPErrorKind::Hard(_) => TransportError::ConnectionError(err.to_string()),
                _ => TransportError::Protocol(err.to_string()),
            },
            lapin::Error::IOError(io) => TransportError::Io(io.to_string()),
            lapin::Error::InvalidChannel(_)
            | lapin::Error::InvalidChannelState(_)
            | lapin::Error::InvalidConnectionState(_) => TransportError::Closed,
            _ => TransportError::ChannelError(err.to_string()),
        }
    }
}

/// Production transport backed by `lapin`
#[derive(Debug, Clone, Default)]
pub struct LapinTransport;

impl LapinTransport {
    pub fn new() -> Self {
        Self
    }

    fn uri(config: &ConnectionConfig) -> AMQPUri {
        let mut uri = AMQPUri::default();
        uri.authority.host = config.host.clone();
        uri.authority.port = config.port;
        uri.authority.userinfo.username = config.username.clone();
        uri.authority.userinfo.password = config.password.clone();
        uri.vhost = config.vhost().to_string();
        uri.query.heartbeat = Some(config.heartbeat_seconds);
        uri.query.connection_timeout = Some(config.connection_timeout_ms);
        uri
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn open(&self, config: &ConnectionConfig) -> Result<Arc<dyn TransportConnection>, TransportError> {
        let properties = ConnectionProperties::default().with_connection_name(config.connection_name().into());
        let connection = Connection::connect_uri(Self::uri(config), properties).await?;

        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        let on_error = Arc::clone(&closed);
        connection.on_error(move |err| {
            warn!(error = %err, "RabbitMQ connection error");
            on_error.send_replace(true);
        });

        debug!(name = %config.connection_name(), "Opened RabbitMQ connection");
        Ok(Arc::new(LapinConnection { connection, closed }))
    }
}

struct LapinConnection {
    connection: Connection,
    closed: Arc<watch::Sender<bool>>,
}

#[async_trait]
impl TransportConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>, TransportError> {
        let channel = self.connection.create_channel().await?;
        Ok(Arc::new(LapinChannel { channel }))
    }

    fn is_open(&self) -> bool {
        !*self.closed.borrow() && self.connection.status().connected()
    }

    async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    async fn close(&self) -> Result<(), TransportError> {
        let result = if self.connection.status().connected() {
            self.connection.close(200, "Closing connection").await.map_err(TransportError::from)
        } else {
            Ok(())
        };
        self.closed.send_replace(true);
        result
    }
}

struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl TransportChannel for LapinChannel {
    fn id(&self) -> u16 {
        self.channel.id()
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), TransportError> {
        Ok(self.channel.basic_qos(prefetch_count, BasicQosOptions::default()).await?)
    }

    async fn confirm_select(&self) -> Result<(), TransportError> {
        Ok(self.channel.confirm_select(ConfirmSelectOptions::default()).await?)
    }

    async fn queue_declare(&self, queue: &str, options: QueueOptions) -> Result<QueueInfo, TransportError> {
        let declared = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: options.passive,
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(QueueInfo {
            name: declared.name().as_str().to_string(),
            message_count: declared.message_count(),
            consumer_count: declared.consumer_count(),
        })
    }

    async fn queue_purge(&self, queue: &str) -> Result<u32, TransportError> {
        Ok(self.channel.queue_purge(queue, QueuePurgeOptions::default()).await?)
    }

    async fn basic_publish(
        &self,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), TransportError> {
        let confirmation = self
            .channel
            .basic_publish(
                "",
                routing_key,
                BasicPublishOptions::default(),
                body,
                to_basic_properties(properties),
            )
            .await?
            .await?;
        if confirmation.is_nack() {
            return Err(TransportError::Nacked);
        }
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, TransportError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        let stream = consumer.map(|delivery| {
            delivery
                .map(|delivery| Delivery {
                    delivery_tag: delivery.delivery_tag,
                    redelivered: delivery.redelivered,
                    properties: from_basic_properties(&delivery.properties),
                    body: delivery.data,
                })
                .map_err(TransportError::from)
        });
        Ok(stream.boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        Ok(self.channel.basic_cancel(consumer_tag, BasicCancelOptions::default()).await?)
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        Ok(self.channel.basic_ack(delivery_tag, BasicAckOptions::default()).await?)
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        let options = BasicNackOptions {
            requeue,
            ..BasicNackOptions::default()
        };
        Ok(self.channel.basic_nack(delivery_tag, options).await?)
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(self.channel.close(200, "Closing channel").await?)
    }
}

fn short(value: &str) -> ShortString {
    ShortString::from(value.to_string())
}

pub(crate) fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(value) = &properties.content_type {
        basic = basic.with_content_type(short(value));
    }
    if let Some(value) = &properties.content_encoding {
        basic = basic.with_content_encoding(short(value));
    }
    if let Some(value) = &properties.correlation_id {
        basic = basic.with_correlation_id(short(value));
    }
    if let Some(value) = &properties.reply_to {
        basic = basic.with_reply_to(short(value));
    }
    if let Some(value) = &properties.message_id {
        basic = basic.with_message_id(short(value));
    }
    if let Some(value) = &properties.expiration {
        basic = basic.with_expiration(short(value));
    }
    if let Some(value) = properties.priority {
        basic = basic.with_priority(value);
    }
    if let Some(value) = properties.delivery_mode {
        basic = basic.with_delivery_mode(value);
    }
    if let Some(value) = properties.timestamp {
        basic = basic.with_timestamp(value);
    }
    if !properties.headers.is_empty() {
        let mut table = FieldTable::default();
        for (key, value) in &properties.headers {
            table.insert(short(key), json_to_amqp(value));
        }
        basic = basic.with_headers(table);
    }
    basic
}

pub(crate) fn from_basic_properties(basic: &BasicProperties) -> MessageProperties {
    let text = |value: &Option<ShortString>| value.as_ref().map(|v| v.as_str().to_string());
    MessageProperties {
        content_type: text(basic.content_type()),
        content_encoding: text(basic.content_encoding()),
        correlation_id: text(basic.correlation_id()),
        reply_to: text(basic.reply_to()),
        message_id: text(basic.message_id()),
        expiration: text(basic.expiration()),
        priority: *basic.priority(),
        delivery_mode: *basic.delivery_mode(),
        timestamp: *basic.timestamp(),
        headers: basic
            .headers()
            .as_ref()
            .map(table_to_json)
            .unwrap_or_default(),
    }
}

/// Arrays and objects travel as JSON text in a long string.
fn json_to_amqp(value: &serde_json::Value) -> AMQPValue {
    use serde_json::Value;
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => AMQPValue::LongLongInt(i),
            (None, Some(f)) => AMQPValue::Double(f),
            (None, None) => AMQPValue::Void,
        },
        Value::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
        Value::Array(_) | Value::Object(_) => AMQPValue::LongString(LongString::from(value.to_string())),
    }
}

fn amqp_to_json(value: &AMQPValue) -> serde_json::Value {
    use serde_json::Value;
    match value {
        AMQPValue::Boolean(b) => Value::Bool(*b),
        AMQPValue::ShortShortInt(v) => Value::from(*v),
        AMQPValue::ShortShortUInt(v) => Value::from(*v),
        AMQPValue::ShortInt(v) => Value::from(*v),
        AMQPValue::ShortUInt(v) => Value::from(*v),
        AMQPValue::LongInt(v) => Value::from(*v),
        AMQPValue::LongUInt(v) => Value::from(*v),
        AMQPValue::LongLongInt(v) => Value::from(*v),
        AMQPValue::Timestamp(v) => Value::from(*v),
        AMQPValue::Float(v) => serde_json::Number::from_f64(f64::from(*v)).map_or(Value::Null, Value::Number),
        AMQPValue::Double(v) => serde_json::Number::from_f64(*v).map_or(Value::Null, Value::Number),
        AMQPValue::ShortString(s) => Value::String(s.as_str().to_string()),
        AMQPValue::LongString(s) => Value::String(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::FieldArray(items) => array_to_json(items),
        AMQPValue::FieldTable(table) => Value::Object(table_to_json(table).into_iter().collect()),
        _ => Value::Null,
    }
}

fn array_to_json(items: &FieldArray) -> serde_json::Value {
    serde_json::Value::Array(items.as_slice().iter().map(amqp_to_json).collect())
}

fn table_to_json(table: &FieldTable) -> BTreeMap<String, serde_json::Value> {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_string(), amqp_to_json(value)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn uri_carries_connection_settings() {
        let config = ConnectionConfig::default()
            .with_host("mq.internal")
            .with_port(5673)
            .with_credentials("svc", "pw")
            .with_vhost("billing");
        let uri = LapinTransport::uri(&config);
        assert_eq!(uri.authority.host, "mq.internal");
        assert_eq!(uri.authority.port, 5673);
        assert_eq!(uri.authority.userinfo.username, "svc");
        assert_eq!(uri.vhost, "billing");
        assert_eq!(uri.query.heartbeat, Some(30));
    }

    #[test]
    fn default_vhost_is_root() {
        let uri = LapinTransport::uri(&ConnectionConfig::default());
        assert_eq!(uri.vhost, "/");
    }

    #[test]
    fn properties_survive_conversion() {
        let properties = MessageProperties::new()
            .with_content_type("application/json")
            .with_message_id("m-1")
            .persistent()
            .with_timestamp(1_700_000_000)
            .with_header("attempt", 2)
            .with_header("source", "billing");

        let back = from_basic_properties(&to_basic_properties(&properties));
        assert_eq!(back, properties);
    }

    #[test]
    fn nested_headers_become_json_text() {
        let properties = MessageProperties::new().with_header("tags", json!(["a", "b"]));
        let back = from_basic_properties(&to_basic_properties(&properties));
        assert_eq!(back.headers.get("tags"), Some(&json!("[\"a\",\"b\"]")));
    }

    #[test]
    fn invalid_channel_is_closed() {
        let err = TransportError::from(lapin::Error::InvalidChannel(7));
        assert_eq!(err, TransportError::Closed);
        assert!(err.is_transient());
    }
}
