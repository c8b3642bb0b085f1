// src/rabbitmq/channel_manager.rs
use std::collections::HashSet;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::connection::ConnectionSupervisor;
use super::consumer::ListenerOptions;
use super::errors::{RabbitMQError, Result};
use super::transport::{QueueInfo, QueueOptions, TransportChannel, TransportError};
use crate::message::MessageProperties;

/// The shared publish channel and the queues declared through it
struct PublishSlot {
    channel: Arc<dyn TransportChannel>,
    generation: u64,
    declared: HashSet<String>,
}

/// Exclusive access to the publish channel; other publishers wait until it is dropped.
pub struct PublishChannel<'a> {
    slot: MutexGuard<'a, Option<PublishSlot>>,
    channel: Arc<dyn TransportChannel>,
    generation: u64,
}

impl Deref for PublishChannel<'_> {
    type Target = dyn TransportChannel;

    fn deref(&self) -> &Self::Target {
        self.channel.as_ref()
    }
}

impl PublishChannel<'_> {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn is_declared(&self, queue: &str) -> bool {
        self.slot
            .as_ref()
            .is_some_and(|slot| slot.declared.contains(queue))
    }

    fn mark_declared(&mut self, queue: &str) {
        if let Some(slot) = self.slot.as_mut() {
            slot.declared.insert(queue.to_string());
        }
    }

    fn replace_channel(&mut self, channel: Arc<dyn TransportChannel>) {
        if let Some(slot) = self.slot.as_mut() {
            slot.channel = Arc::clone(&channel);
        }
        self.channel = channel;
    }

    /// Drops the slot so the next caller starts on a fresh channel.
    async fn discard(mut self) {
        *self.slot = None;
        close_quietly(self.channel.as_ref()).await;
    }
}

/// Best-effort channel close; errors are logged at debug level.
pub(crate) async fn close_quietly(channel: &dyn TransportChannel) {
    if !channel.is_open() {
        return;
    }
    if let Err(err) = channel.close().await {
        debug!(channel_id = channel.id(), error = %err, "Ignoring error while closing channel");
    }
}

/// Channels handed out by the pool are tagged with the connection generation
/// they were opened on and are worthless once it is retired. The pool never retries.
pub struct ChannelPool {
    supervisor: Arc<ConnectionSupervisor>,
    publish: Mutex<Option<PublishSlot>>,
}

impl ChannelPool {
    pub fn new(supervisor: Arc<ConnectionSupervisor>) -> Self {
        Self {
            supervisor,
            publish: Mutex::new(None),
        }
    }

    fn confirms(&self) -> bool {
        self.supervisor.config().confirm_delivery
    }

    /// Returns the shared publish channel, opening it lazily.
    pub async fn acquire_publish_channel(&self) -> Result<PublishChannel<'_>> {
        self.supervisor.ensure_connected()?;
        let mut slot = self.publish.lock().await;

        let generation = self.supervisor.generation();
        let reusable = slot
            .as_ref()
            .is_some_and(|s| generation.is_current(s.generation) && s.channel.is_open());

        if !reusable {
            if let Some(stale) = slot.take() {
                debug!(generation = stale.generation, "Replacing stale publish channel");
                close_quietly(stale.channel.as_ref()).await;
            }
            let (channel, generation) = self.supervisor.open_channel().await?;
            if let Err(err) = self.prepare_publish(channel.as_ref()).await {
                close_quietly(channel.as_ref()).await;
                return Err(err);
            }
            debug!(
                channel_id = channel.id(),
                generation,
                confirm = self.confirms(),
                "Created publish channel"
            );
            *slot = Some(PublishSlot {
                channel,
                generation,
                declared: HashSet::new(),
            });
        }

        let Some((channel, generation)) = slot.as_ref().map(|s| (Arc::clone(&s.channel), s.generation)) else {
            return Err(RabbitMQError::NotConnected {
                state: self.supervisor.state(),
            });
        };
        Ok(PublishChannel {
            slot,
            channel,
            generation,
        })
    }

    async fn prepare_publish(&self, channel: &dyn TransportChannel) -> Result<()> {
        if self.confirms() {
            channel.confirm_select().await?;
        }
        Ok(())
    }

    /// Fresh channel for one consumer: queue declared when auto-declare is on, QoS applied.
    pub async fn acquire_consumer_channel(
        &self,
        queue: &str,
        options: &ListenerOptions,
    ) -> Result<(Arc<dyn TransportChannel>, u64)> {
        let (channel, generation) = self.supervisor.open_channel().await?;
        let channel = if options.auto_declare {
            self.probe_or_declare(channel, generation, queue, options.durable)
                .await?
                .0
        } else {
            channel
        };

        if !options.no_ack {
            if let Err(err) = channel.basic_qos(options.prefetch).await {
                close_quietly(channel.as_ref()).await;
                return Err(err.into());
            }
        }
        debug!(queue = %queue, channel_id = channel.id(), generation, prefetch = options.prefetch, "Created consumer channel");
        Ok((channel, generation))
    }

    /// Passive probe first; declares only when the broker reports the queue missing.
    /// A failed probe closes the channel broker-side, so the declare then runs on a
    /// fresh channel of the same generation, which is returned in its place.
    async fn probe_or_declare(
        &self,
        channel: Arc<dyn TransportChannel>,
        generation: u64,
        queue: &str,
        durable: bool,
    ) -> Result<(Arc<dyn TransportChannel>, QueueInfo)> {
        match channel.queue_declare(queue, QueueOptions::passive()).await {
            Ok(info) => return Ok((channel, info)),
            Err(TransportError::NotFound(_)) => {}
            Err(err) => {
                close_quietly(channel.as_ref()).await;
                return Err(err.into());
            }
        }

        debug!(queue = %queue, durable, "Queue not found, declaring it");
        let channel = if channel.is_open() {
            channel
        } else {
            let (fresh, fresh_generation) = self.supervisor.open_channel().await?;
            if fresh_generation != generation {
                close_quietly(fresh.as_ref()).await;
                return Err(RabbitMQError::NotConnected {
                    state: self.supervisor.state(),
                });
            }
            fresh
        };

        match channel.queue_declare(queue, QueueOptions::durable(durable)).await {
            Ok(info) => Ok((channel, info)),
            Err(err) => {
                close_quietly(channel.as_ref()).await;
                Err(err.into())
            }
        }
    }

    async fn declare_on_publish(
        &self,
        publish: &mut PublishChannel<'_>,
        queue: &str,
        durable: bool,
    ) -> Result<QueueInfo> {
        let original = Arc::clone(&publish.channel);
        let (channel, info) = self
            .probe_or_declare(Arc::clone(&original), publish.generation, queue, durable)
            .await?;
        if !Arc::ptr_eq(&original, &channel) {
            self.prepare_publish(channel.as_ref()).await?;
            publish.replace_channel(channel);
        }
        publish.mark_declared(queue);
        Ok(info)
    }

    /// Publishes through the default exchange with routing key = `queue`,
    /// declaring the queue (durable) the first time this channel sees it.
    pub async fn publish(&self, queue: &str, body: &[u8], properties: &MessageProperties) -> Result<()> {
        let mut channel = self.acquire_publish_channel().await?;
        let mut result = Ok(());
        if !channel.is_declared(queue) {
            result = self.declare_on_publish(&mut channel, queue, true).await.map(|_| ());
        }
        if result.is_ok() {
            result = channel
                .basic_publish(queue, body, properties)
                .await
                .map_err(RabbitMQError::from);
        }
        if matches!(result, Err(RabbitMQError::Transport(_))) {
            channel.discard().await;
        }
        result
    }

    pub async fn declare_queue(&self, queue: &str, durable: bool) -> Result<QueueInfo> {
        let mut channel = self.acquire_publish_channel().await?;
        let result = self.declare_on_publish(&mut channel, queue, durable).await;
        if matches!(result, Err(RabbitMQError::Transport(_))) {
            channel.discard().await;
        }
        result
    }

    /// Ready messages in `queue`; a missing queue is a `NotFound` transport error.
    pub async fn message_count(&self, queue: &str) -> Result<u32> {
        let channel = self.acquire_publish_channel().await?;
        match channel.queue_declare(queue, QueueOptions::passive()).await {
            Ok(info) => Ok(info.message_count),
            Err(err) => {
                channel.discard().await;
                Err(err.into())
            }
        }
    }

    pub async fn purge(&self, queue: &str) -> Result<u32> {
        let channel = self.acquire_publish_channel().await?;
        match channel.queue_purge(queue).await {
            Ok(purged) => Ok(purged),
            Err(err) => {
                channel.discard().await;
                Err(err.into())
            }
        }
    }

    /// Drops the publish channel after a connection loss. A publisher holding it
    /// will find it stale on its next acquire.
    pub async fn invalidate(&self) {
        let stale = match self.publish.try_lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(stale) = stale {
            debug!(generation = stale.generation, "Invalidated publish channel");
            close_quietly(stale.channel.as_ref()).await;
        }
    }

    /// Final release during shutdown.
    pub async fn release(&self) {
        let slot = self.publish.lock().await.take();
        if let Some(slot) = slot {
            debug!(channel_id = slot.channel.id(), "Closing publish channel");
            close_quietly(slot.channel.as_ref()).await;
        }
    }
}
