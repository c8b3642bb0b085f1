//! In-memory broker with fault injection
//!
//! Models the parts of RabbitMQ the client relies on: durable named queues behind
//! the default exchange, per-channel delivery tags, prefetch-limited round-robin
//! dispatch, requeue on channel or connection loss, and the broker closing a
//! channel after a failed passive declare.

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

use crate::config::ConnectionConfig;
use crate::message::MessageProperties;
use crate::rabbitmq::transport::{
    ConsumeOptions, Delivery, DeliveryStream, QueueInfo, QueueOptions, Transport, TransportChannel,
    TransportConnection, TransportError,
};

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
}

struct ConsumerSlot {
    tag: String,
    channel: u64,
    no_ack: bool,
    sender: UnboundedSender<Result<Delivery, TransportError>>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

struct ChannelState {
    connection: u64,
    open: bool,
    prefetch: u16,
    next_tag: u64,
    unacked: HashMap<u64, (String, StoredMessage)>,
}

struct ConnectionEntry {
    closed: Arc<watch::Sender<bool>>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    channels: HashMap<u64, ChannelState>,
    connections: HashMap<u64, ConnectionEntry>,
    next_id: u64,
    refuse: bool,
    fail_next_opens: u32,
    fail_next_channels: u32,
    nack_next_publishes: u32,
    open_attempts: usize,
    opens: usize,
    closes: usize,
    channels_opened: usize,
    published: usize,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn connection_open(&self, connection: u64) -> bool {
        self.connections
            .get(&connection)
            .is_some_and(|entry| !*entry.closed.borrow())
    }

    fn channel_open(&self, channel: u64) -> bool {
        self.channels
            .get(&channel)
            .is_some_and(|state| state.open && self.connection_open(state.connection))
    }

    fn check_channel(&self, channel: u64) -> Result<(), TransportError> {
        if self.channel_open(channel) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    fn has_capacity(&self, slot: &ConsumerSlot) -> bool {
        if slot.no_ack {
            return true;
        }
        match self.channels.get(&slot.channel) {
            Some(channel) => channel.prefetch == 0 || channel.unacked.len() < channel.prefetch as usize,
            None => false,
        }
    }

    /// Pushes ready messages to consumers with spare prefetch capacity.
    fn dispatch(&mut self, queue: &str) {
        loop {
            let Some(state) = self.queues.get(queue) else {
                return;
            };
            if state.ready.is_empty() || state.consumers.is_empty() {
                return;
            }
            let count = state.consumers.len();
            let start = state.next_consumer % count;
            let chosen = (0..count)
                .map(|offset| (start + offset) % count)
                .find(|&index| self.has_capacity(&state.consumers[index]));
            let Some(index) = chosen else {
                return;
            };

            let Some(state) = self.queues.get_mut(queue) else {
                return;
            };
            state.next_consumer = index + 1;
            let Some(message) = state.ready.pop_front() else {
                return;
            };
            let channel_id = state.consumers[index].channel;
            let no_ack = state.consumers[index].no_ack;

            let Some(channel) = self.channels.get_mut(&channel_id) else {
                return;
            };
            channel.next_tag += 1;
            let delivery_tag = channel.next_tag;
            if !no_ack {
                channel.unacked.insert(delivery_tag, (queue.to_string(), message.clone()));
            }

            let delivery = Delivery {
                delivery_tag,
                redelivered: message.redelivered,
                body: message.body.clone(),
                properties: message.properties.clone(),
            };
            let Some(state) = self.queues.get_mut(queue) else {
                return;
            };
            if state.consumers[index].sender.unbounded_send(Ok(delivery)).is_err() {
                // Receiver dropped without a cancel: forget the consumer, keep the message.
                state.consumers.remove(index);
                state.ready.push_front(message);
                if let Some(channel) = self.channels.get_mut(&channel_id) {
                    channel.unacked.remove(&delivery_tag);
                }
            }
        }
    }

    fn requeue(&mut self, queue: &str, mut message: StoredMessage) {
        message.redelivered = true;
        if let Some(state) = self.queues.get_mut(queue) {
            state.ready.push_front(message);
        }
    }

    /// Closes a channel: consumers end (optionally with an error) and unacked
    /// messages go back to their queues.
    fn close_channel(&mut self, channel: u64, error: Option<TransportError>) {
        let unacked = match self.channels.get_mut(&channel) {
            Some(state) if state.open => {
                state.open = false;
                std::mem::take(&mut state.unacked)
            }
            _ => return,
        };

        let mut touched = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|slot| {
                if slot.channel != channel {
                    return true;
                }
                if let Some(err) = &error {
                    let _ = slot.sender.unbounded_send(Err(err.clone()));
                }
                false
            });
            if queue.consumers.len() != before {
                touched.push(name.clone());
            }
        }

        let mut tags: Vec<u64> = unacked.keys().copied().collect();
        tags.sort_unstable_by(|a, b| b.cmp(a));
        let mut unacked = unacked;
        for tag in tags {
            if let Some((queue, message)) = unacked.remove(&tag) {
                self.requeue(&queue, message);
                touched.push(queue);
            }
        }

        touched.sort();
        touched.dedup();
        for queue in touched {
            self.dispatch(&queue);
        }
    }

    fn close_connection(&mut self, connection: u64, error: Option<TransportError>) {
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, state)| state.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            self.close_channel(channel, error.clone());
        }
        if let Some(entry) = self.connections.get(&connection) {
            entry.closed.send_replace(true);
        }
    }
}

/// In-process broker. Cheap to clone; clones share the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// While set, every `open` fails with a connection error.
    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse = refuse;
    }

    pub fn fail_next_opens(&self, count: u32) {
        self.lock().fail_next_opens = count;
    }

    /// The next `count` channel opens fail with a channel error; the connection stays up.
    pub fn fail_next_channels(&self, count: u32) {
        self.lock().fail_next_channels = count;
    }

    /// The next `count` confirmed publishes are nacked by the broker.
    pub fn nack_next_publishes(&self, count: u32) {
        self.lock().nack_next_publishes = count;
    }

    /// Drops every live connection as a network failure would.
    pub fn kill_connections(&self) {
        let mut state = self.lock();
        let live: Vec<u64> = state
            .connections
            .keys()
            .copied()
            .filter(|id| state.connection_open(*id))
            .collect();
        for connection in live {
            state.close_connection(connection, Some(TransportError::ConnectionError("connection reset by peer".into())));
        }
    }

    /// Closes the channels consuming `queue` with a channel error; the connection stays up.
    pub fn break_consumer_channels(&self, queue: &str) {
        let mut state = self.lock();
        let channels: Vec<u64> = state
            .queues
            .get(queue)
            .map(|q| q.consumers.iter().map(|slot| slot.channel).collect())
            .unwrap_or_default();
        for channel in channels {
            state.close_channel(channel, Some(TransportError::ChannelError("channel closed by broker".into())));
        }
    }

    /// Puts a message on `queue`, creating the queue if needed.
    pub fn enqueue(&self, queue: &str, body: impl Into<Vec<u8>>) {
        let mut state = self.lock();
        state.queues.entry(queue.to_string()).or_default().ready.push_back(StoredMessage {
            body: body.into(),
            properties: MessageProperties::default(),
            redelivered: false,
        });
        state.dispatch(queue);
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    /// Ready messages, unacked excluded.
    pub fn message_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock()
            .channels
            .values()
            .flat_map(|channel| channel.unacked.values())
            .filter(|(name, _)| name == queue)
            .count()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    pub fn open_attempts(&self) -> usize {
        self.lock().open_attempts
    }

    pub fn opens(&self) -> usize {
        self.lock().opens
    }

    pub fn closes(&self) -> usize {
        self.lock().closes
    }

    pub fn channels_opened(&self) -> usize {
        self.lock().channels_opened
    }

    pub fn published(&self) -> usize {
        self.lock().published
    }

    pub fn live_connections(&self) -> usize {
        let state = self.lock();
        state
            .connections
            .keys()
            .filter(|id| state.connection_open(**id))
            .count()
    }

    pub fn live_channels(&self) -> usize {
        let state = self.lock();
        state
            .channels
            .keys()
            .filter(|id| state.channel_open(**id))
            .count()
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn open(&self, _config: &ConnectionConfig) -> Result<Arc<dyn TransportConnection>, TransportError> {
        let mut state = self.lock();
        state.open_attempts += 1;
        if state.refuse {
            return Err(TransportError::ConnectionError("connection refused".into()));
        }
        if state.fail_next_opens > 0 {
            state.fail_next_opens -= 1;
            return Err(TransportError::ConnectionError("connection refused".into()));
        }
        state.opens += 1;
        let id = state.next_id();
        let closed = Arc::new(watch::channel(false).0);
        state.connections.insert(
            id,
            ConnectionEntry {
                closed: Arc::clone(&closed),
            },
        );
        Ok(Arc::new(MemoryConnection {
            id,
            broker: self.clone(),
            closed,
        }))
    }
}

struct MemoryConnection {
    id: u64,
    broker: MemoryBroker,
    closed: Arc<watch::Sender<bool>>,
}

#[async_trait]
impl TransportConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>, TransportError> {
        let mut state = self.broker.lock();
        if !state.connection_open(self.id) {
            return Err(TransportError::Closed);
        }
        if state.fail_next_channels > 0 {
            state.fail_next_channels -= 1;
            return Err(TransportError::ChannelError("channel open refused".into()));
        }
        let key = state.next_id();
        let number = state
            .channels
            .values()
            .filter(|channel| channel.connection == self.id)
            .count() as u16
            + 1;
        state.channels.insert(
            key,
            ChannelState {
                connection: self.id,
                open: true,
                prefetch: 0,
                next_tag: 0,
                unacked: HashMap::new(),
            },
        );
        state.channels_opened += 1;
        Ok(Arc::new(MemoryChannel {
            key,
            number,
            broker: self.broker.clone(),
        }))
    }

    fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }

    async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        state.closes += 1;
        state.close_connection(self.id, None);
        Ok(())
    }
}

struct MemoryChannel {
    key: u64,
    number: u16,
    broker: MemoryBroker,
}

impl MemoryChannel {
    fn not_found(&self, state: &mut BrokerState, queue: &str) -> TransportError {
        // NOT_FOUND is a channel-level error: the broker closes the channel.
        state.close_channel(self.key, None);
        TransportError::NotFound(format!("no queue '{}' in vhost", queue))
    }
}

#[async_trait]
impl TransportChannel for MemoryChannel {
    fn id(&self) -> u16 {
        self.number
    }

    fn is_open(&self) -> bool {
        self.broker.lock().channel_open(self.key)
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        state.check_channel(self.key)?;
        if let Some(channel) = state.channels.get_mut(&self.key) {
            channel.prefetch = prefetch_count;
        }
        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), TransportError> {
        self.broker.lock().check_channel(self.key)
    }

    async fn queue_declare(&self, queue: &str, options: QueueOptions) -> Result<QueueInfo, TransportError> {
        let mut state = self.broker.lock();
        state.check_channel(self.key)?;
        if options.passive && !state.queues.contains_key(queue) {
            return Err(self.not_found(&mut state, queue));
        }
        let entry = state.queues.entry(queue.to_string()).or_default();
        Ok(QueueInfo {
            name: queue.to_string(),
            message_count: entry.ready.len() as u32,
            consumer_count: entry.consumers.len() as u32,
        })
    }

    async fn queue_purge(&self, queue: &str) -> Result<u32, TransportError> {
        let mut state = self.broker.lock();
        state.check_channel(self.key)?;
        if !state.queues.contains_key(queue) {
            return Err(self.not_found(&mut state, queue));
        }
        let entry = state.queues.entry(queue.to_string()).or_default();
        let purged = entry.ready.len() as u32;
        entry.ready.clear();
        Ok(purged)
    }

    async fn basic_publish(
        &self,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        state.check_channel(self.key)?;
        if state.nack_next_publishes > 0 {
            state.nack_next_publishes -= 1;
            return Err(TransportError::Nacked);
        }
        state.published += 1;
        // Unroutable messages on the default exchange are dropped.
        if let Some(entry) = state.queues.get_mut(routing_key) {
            entry.ready.push_back(StoredMessage {
                body: body.to_vec(),
                properties: properties.clone(),
                redelivered: false,
            });
            state.dispatch(routing_key);
        }
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, TransportError> {
        let mut state = self.broker.lock();
        state.check_channel(self.key)?;
        if !state.queues.contains_key(queue) {
            return Err(self.not_found(&mut state, queue));
        }
        let entry = state.queues.entry(queue.to_string()).or_default();
        if options.exclusive && !entry.consumers.is_empty() {
            return Err(TransportError::Protocol(format!(
                "ACCESS_REFUSED - queue '{}' in exclusive use",
                queue
            )));
        }
        let (sender, receiver) = unbounded();
        entry.consumers.push(ConsumerSlot {
            tag: consumer_tag.to_string(),
            channel: self.key,
            no_ack: options.no_ack,
            sender,
        });
        state.dispatch(queue);
        Ok(receiver.boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        state.check_channel(self.key)?;
        for entry in state.queues.values_mut() {
            entry
                .consumers
                .retain(|slot| !(slot.channel == self.key && slot.tag == consumer_tag));
        }
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        state.check_channel(self.key)?;
        let settled = state
            .channels
            .get_mut(&self.key)
            .and_then(|channel| channel.unacked.remove(&delivery_tag));
        match settled {
            Some((queue, _)) => {
                state.dispatch(&queue);
                Ok(())
            }
            None => {
                state.close_channel(self.key, None);
                Err(TransportError::Protocol(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {}",
                    delivery_tag
                )))
            }
        }
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        state.check_channel(self.key)?;
        let settled = state
            .channels
            .get_mut(&self.key)
            .and_then(|channel| channel.unacked.remove(&delivery_tag));
        match settled {
            Some((queue, message)) => {
                if requeue {
                    state.requeue(&queue, message);
                }
                state.dispatch(&queue);
                Ok(())
            }
            None => {
                state.close_channel(self.key, None);
                Err(TransportError::Protocol(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {}",
                    delivery_tag
                )))
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        if !state.channel_open(self.key) {
            return Err(TransportError::Closed);
        }
        state.close_channel(self.key, None);
        Ok(())
    }
}
