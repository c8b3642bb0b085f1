// src/rabbitmq/consumer.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::channel_manager::{close_quietly, ChannelPool};
use super::connection::{interruptible_sleep, ConnectionSupervisor, ConsumerFailure, Generation};
use super::errors::{RabbitMQError, Result};
use super::transport::{ConsumeOptions, Delivery, DeliveryStream, TransportChannel};
use crate::message::{Message, MessageProperties, Settlement};

/// Processes one delivery at a time for a queue
///
/// Returning `Err` (or panicking) applies the listener's `HandlerErrorPolicy`
/// unless the handler already settled the message itself.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: Message) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: Message) -> anyhow::Result<()> {
        (self)(message).await
    }
}

/// What to do with a delivery whose handler failed without settling it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerErrorPolicy {
    /// Requeue on a delivery's first handler failure; drop it on the second
    #[default]
    RequeueOnce,
    Requeue,
    Discard,
}

/// What to do with a delivery whose handler returned Ok without settling it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsettledPolicy {
    #[default]
    Ack,
    NackRequeue,
    Leave,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerOptions {
    pub prefetch: u16,
    pub no_ack: bool,
    pub durable: bool,
    pub auto_declare: bool,
    pub exclusive: bool,
    pub on_error: HandlerErrorPolicy,
    pub on_unsettled: UnsettledPolicy,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            prefetch: 1,
            no_ack: false,
            durable: true,
            auto_declare: true,
            exclusive: false,
            on_error: HandlerErrorPolicy::default(),
            on_unsettled: UnsettledPolicy::default(),
        }
    }
}

pub struct ListenerRegistration {
    pub queue: String,
    pub handler: Arc<dyn MessageHandler>,
    pub options: ListenerOptions,
}

impl ListenerRegistration {
    pub fn new(queue: impl Into<String>, handler: Arc<dyn MessageHandler>, options: ListenerOptions) -> Self {
        Self {
            queue: queue.into(),
            handler,
            options,
        }
    }
}

impl fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("queue", &self.queue)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Snapshot of one registered listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerStatus {
    pub queue: String,
    pub generation: Option<u64>,
    pub consumer_tag: Option<String>,
    pub running: bool,
    pub deliveries: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

struct Activity {
    deliveries: AtomicU64,
    last: StdMutex<DateTime<Utc>>,
}

impl Activity {
    fn new() -> Self {
        Self {
            deliveries: AtomicU64::new(0),
            last: StdMutex::new(Utc::now()),
        }
    }

    fn record(&self) {
        self.deliveries.fetch_add(1, Ordering::Relaxed);
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Utc::now();
    }

    fn last(&self) -> DateTime<Utc> {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Identity of a delivery across redeliveries: its message id, or a hash of
/// body and properties when the publisher set none.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DeliveryKey {
    MessageId(String),
    Fingerprint(u64),
}

impl DeliveryKey {
    fn of(body: &[u8], properties: &MessageProperties) -> Self {
        if let Some(id) = &properties.message_id {
            return DeliveryKey::MessageId(id.clone());
        }
        let mut hasher = DefaultHasher::new();
        body.hash(&mut hasher);
        // Header values are JSON and not `Hash`.
        serde_json::to_vec(properties).unwrap_or_default().hash(&mut hasher);
        DeliveryKey::Fingerprint(hasher.finish())
    }
}

const FAILED_DELIVERY_CAPACITY: usize = 1024;

/// Deliveries of one listener whose handler has failed once, oldest evicted first.
#[derive(Default)]
struct FailedDeliveries {
    inner: StdMutex<FailedInner>,
}

#[derive(Default)]
struct FailedInner {
    keys: HashSet<DeliveryKey>,
    order: VecDeque<DeliveryKey>,
}

impl FailedDeliveries {
    /// Records a handler failure. True for the first failure of `key`; a second
    /// failure forgets the key and returns false.
    fn first_failure(&self, key: &DeliveryKey) -> bool {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let inner = &mut *guard;
        if inner.keys.remove(key) {
            inner.order.retain(|known| known != key);
            return false;
        }
        if inner.order.len() >= FAILED_DELIVERY_CAPACITY {
            if let Some(oldest) = inner.order.pop_front() {
                inner.keys.remove(&oldest);
            }
        }
        inner.keys.insert(key.clone());
        inner.order.push_back(key.clone());
        true
    }

    fn forget(&self, key: &DeliveryKey) {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let inner = &mut *guard;
        if inner.keys.remove(key) {
            inner.order.retain(|known| known != key);
        }
    }
}

/// A running consumer: its channel, task and cancellation signal. Never reused
/// across connection generations.
pub struct ConsumerHandle {
    queue: String,
    generation: u64,
    consumer_tag: String,
    channel: Arc<dyn TransportChannel>,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
    activity: Arc<Activity>,
}

impl ConsumerHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    fn status(&self) -> ConsumerStatus {
        ConsumerStatus {
            queue: self.queue.clone(),
            generation: Some(self.generation),
            consumer_tag: Some(self.consumer_tag.clone()),
            running: self.is_running(),
            deliveries: self.activity.deliveries.load(Ordering::Relaxed),
            last_activity: Some(self.activity.last()),
        }
    }

    /// Signals the loop, waits for the in-flight handler (aborting after
    /// `timeout`), then cancels the consumer and closes its channel.
    pub async fn stop(mut self, timeout: Duration) {
        self.cancel.send_replace(true);
        match tokio::time::timeout(timeout, &mut self.task).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(queue = %self.queue, consumer_tag = %self.consumer_tag, error = %err, "Consumer task ended abnormally");
            }
            Err(_) => {
                warn!(
                    queue = %self.queue,
                    timeout_ms = timeout.as_millis() as u64,
                    "Consumer did not stop in time, aborting it"
                );
                self.task.abort();
            }
        }

        if self.channel.is_open() {
            if let Err(err) = self.channel.basic_cancel(&self.consumer_tag).await {
                debug!(queue = %self.queue, error = %err, "Ignoring error while cancelling consumer");
            }
        }
        close_quietly(self.channel.as_ref()).await;
        debug!(queue = %self.queue, consumer_tag = %self.consumer_tag, generation = self.generation, "Consumer stopped");
    }
}

/// The task body of one consumer
pub struct ConsumerLoop {
    registration: Arc<ListenerRegistration>,
    channel: Arc<dyn TransportChannel>,
    generation: u64,
    current: Arc<Generation>,
    consumer_tag: String,
    cancel: watch::Receiver<bool>,
    failures: mpsc::UnboundedSender<ConsumerFailure>,
    activity: Arc<Activity>,
    failed: Arc<FailedDeliveries>,
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    // A dropped sender also ends the loop.
    let _ = cancel.wait_for(|stop| *stop).await;
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", text)
    } else if let Some(text) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", text)
    } else {
        "handler panicked".to_string()
    }
}

impl ConsumerLoop {
    pub async fn run(mut self, mut stream: DeliveryStream) {
        let queue = self.registration.queue.clone();
        info!(queue = %queue, generation = self.generation, consumer_tag = %self.consumer_tag, "Consumer started");

        loop {
            let next = tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel) => None,
                next = stream.next() => Some(next),
            };

            match next {
                None => break,
                Some(Some(Ok(delivery))) => {
                    if !self.current.is_current(self.generation) {
                        debug!(queue = %queue, delivery_tag = delivery.delivery_tag, "Dropping delivery from a retired connection");
                        break;
                    }
                    self.dispatch(delivery).await;
                }
                Some(Some(Err(err))) => {
                    warn!(queue = %queue, error = %err, "Consumer stream failed");
                    self.report_failure();
                    break;
                }
                Some(None) => {
                    warn!(queue = %queue, "Consumer stream ended unexpectedly");
                    self.report_failure();
                    break;
                }
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn report_failure(&self) {
        if self.is_cancelled() || !self.current.is_current(self.generation) {
            return;
        }
        let failure = ConsumerFailure {
            queue: self.registration.queue.clone(),
            consumer_tag: self.consumer_tag.clone(),
            generation: self.generation,
        };
        if self.failures.send(failure).is_err() {
            debug!(queue = %self.registration.queue, "Connection monitor is gone, failure not reported");
        }
    }

    async fn dispatch(&self, delivery: Delivery) {
        let queue = &self.registration.queue;
        let options = &self.registration.options;
        let delivery_tag = delivery.delivery_tag;
        let redelivered = delivery.redelivered;
        let key = (options.on_error == HandlerErrorPolicy::RequeueOnce)
            .then(|| DeliveryKey::of(&delivery.body, &delivery.properties));

        let settlement = Arc::new(Settlement::new(
            Arc::clone(&self.channel),
            self.generation,
            Arc::clone(&self.current),
            options.no_ack,
        ));
        let message = Message::new(
            queue.clone(),
            delivery.body,
            delivery.properties,
            delivery_tag,
            redelivered,
            Arc::clone(&settlement),
        );
        self.activity.record();

        let outcome = AssertUnwindSafe(self.registration.handler.handle(message))
            .catch_unwind()
            .await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(format!("{:#}", err)),
            Err(panic) => Some(panic_message(panic.as_ref())),
        };
        if let (None, Some(key)) = (&failure, &key) {
            self.failed.forget(key);
        }

        if settlement.is_settled() {
            if let Some(message) = failure {
                let err = RabbitMQError::Handler {
                    queue: queue.clone(),
                    message,
                };
                error!(queue = %queue, delivery_tag, error = %err, "Message handler failed after settling");
            }
            return;
        }

        let result = match failure {
            None => match options.on_unsettled {
                UnsettledPolicy::Ack => settlement.settle(queue, delivery_tag, true, false).await,
                UnsettledPolicy::NackRequeue => settlement.settle(queue, delivery_tag, false, true).await,
                UnsettledPolicy::Leave => {
                    debug!(queue = %queue, delivery_tag, "Leaving delivery unsettled");
                    Ok(())
                }
            },
            Some(message) => {
                let err = RabbitMQError::Handler {
                    queue: queue.clone(),
                    message,
                };
                let requeue = match options.on_error {
                    HandlerErrorPolicy::RequeueOnce => match &key {
                        Some(key) => self.failed.first_failure(key),
                        None => true,
                    },
                    HandlerErrorPolicy::Requeue => true,
                    HandlerErrorPolicy::Discard => false,
                };
                error!(queue = %queue, delivery_tag, redelivered, requeue, error = %err, "Message handler failed");
                settlement.settle(queue, delivery_tag, false, requeue).await
            }
        };

        if let Err(err) = result {
            warn!(queue = %queue, delivery_tag, error = %err, "Failed to settle delivery");
        }
    }
}

struct ConsumerEntry {
    registration: Arc<ListenerRegistration>,
    handle: Option<ConsumerHandle>,
    restarts: u32,
    failed: Arc<FailedDeliveries>,
}

/// Queue name → registration. The lock is held across every start and stop, so
/// at most one consumer per queue exists at any time.
pub struct ConsumerRegistry {
    supervisor: Arc<ConnectionSupervisor>,
    pool: Arc<ChannelPool>,
    entries: Mutex<HashMap<String, ConsumerEntry>>,
}

impl ConsumerRegistry {
    pub fn new(supervisor: Arc<ConnectionSupervisor>, pool: Arc<ChannelPool>) -> Self {
        Self {
            supervisor,
            pool,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn join_timeout(&self) -> Duration {
        self.supervisor.config().join_timeout()
    }

    /// Hands a queue whose consumer could not start to the restart path, which
    /// retries it with backoff while the connection stays up.
    fn schedule_restart(&self, queue: &str) {
        let failure = ConsumerFailure {
            queue: queue.to_string(),
            consumer_tag: String::new(),
            generation: self.supervisor.generation().current(),
        };
        if self.supervisor.failure_sender().send(failure).is_err() {
            debug!(queue = %queue, "Connection monitor is gone, consumer start not retried");
        }
    }

    async fn start(&self, entry: &ConsumerEntry) -> Result<ConsumerHandle> {
        let registration = &entry.registration;
        let queue = &registration.queue;
        let options = &registration.options;
        let (channel, generation) = self.pool.acquire_consumer_channel(queue, options).await?;

        let consumer_tag = format!("consumer-{}", Uuid::new_v4());
        let consume = ConsumeOptions {
            no_ack: options.no_ack,
            exclusive: options.exclusive,
        };
        let stream = match channel.basic_consume(queue, &consumer_tag, consume).await {
            Ok(stream) => stream,
            Err(err) => {
                close_quietly(channel.as_ref()).await;
                return Err(err.into());
            }
        };

        let (cancel, cancel_rx) = watch::channel(false);
        let activity = Arc::new(Activity::new());
        let consumer = ConsumerLoop {
            registration: Arc::clone(registration),
            channel: Arc::clone(&channel),
            generation,
            current: self.supervisor.generation(),
            consumer_tag: consumer_tag.clone(),
            cancel: cancel_rx,
            failures: self.supervisor.failure_sender(),
            activity: Arc::clone(&activity),
            failed: Arc::clone(&entry.failed),
        };
        let task = tokio::spawn(consumer.run(stream));

        Ok(ConsumerHandle {
            queue: queue.clone(),
            generation,
            consumer_tag,
            channel,
            cancel,
            task,
            activity,
        })
    }

    /// Inserts or replaces the registration for its queue. The consumer starts
    /// now when connected, otherwise after the next successful connect.
    pub async fn register(&self, registration: ListenerRegistration) -> Result<()> {
        if self.supervisor.is_closed() {
            return Err(RabbitMQError::Closed);
        }
        let registration = Arc::new(registration);
        let queue = registration.queue.clone();
        let mut entries = self.entries.lock().await;

        if let Some(previous) = entries.remove(&queue) {
            info!(queue = %queue, "Replacing existing listener");
            if let Some(handle) = previous.handle {
                handle.stop(self.join_timeout()).await;
            }
        }

        let mut entry = ConsumerEntry {
            registration,
            handle: None,
            restarts: 0,
            failed: Arc::new(FailedDeliveries::default()),
        };
        if self.supervisor.is_connected() {
            match self.start(&entry).await {
                Ok(handle) => entry.handle = Some(handle),
                Err(err) if err.is_retryable() => {
                    warn!(queue = %queue, error = %err, "Listener registered, consumer start will be retried");
                    self.schedule_restart(&queue);
                }
                Err(err) => {
                    error!(queue = %queue, error = %err, "Failed to start consumer");
                    return Err(err);
                }
            }
        } else {
            info!(queue = %queue, state = %self.supervisor.state(), "Listener registered, consumer starts once connected");
        }
        entries.insert(queue, entry);
        Ok(())
    }

    /// Removes the registration and stops its consumer. Returns false when the
    /// queue had no listener.
    pub async fn unregister(&self, queue: &str) -> bool {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.remove(queue) else {
            return false;
        };
        if let Some(handle) = entry.handle {
            handle.stop(self.join_timeout()).await;
        }
        info!(queue = %queue, "Listener stopped");
        true
    }

    /// Stops every consumer after a connection loss; registrations stay.
    pub async fn teardown_all(&self) {
        let mut entries = self.entries.lock().await;
        let handles: Vec<ConsumerHandle> = entries
            .values_mut()
            .filter_map(|entry| entry.handle.take())
            .collect();
        if handles.is_empty() {
            return;
        }
        let timeout = self.join_timeout();
        debug!(consumers = handles.len(), "Tearing down consumers");
        join_all(handles.into_iter().map(|handle| handle.stop(timeout))).await;
    }

    /// Starts a consumer for every registration on the connection of `generation`.
    pub async fn replay(&self, generation: u64) {
        let mut entries = self.entries.lock().await;
        let timeout = self.join_timeout();
        let mut started = 0usize;

        for (queue, entry) in entries.iter_mut() {
            if let Some(handle) = entry.handle.take() {
                if handle.generation() == generation && handle.is_running() {
                    entry.handle = Some(handle);
                    continue;
                }
                handle.stop(timeout).await;
            }
            if !self.supervisor.generation().is_current(generation) {
                debug!(generation, "Connection lost again during replay");
                return;
            }
            entry.restarts = 0;
            match self.start(entry).await {
                Ok(handle) => {
                    entry.handle = Some(handle);
                    started += 1;
                }
                Err(err) => {
                    error!(queue = %queue, generation, error = %err, "Failed to restart consumer after reconnect");
                    self.schedule_restart(queue);
                }
            }
        }

        if started > 0 {
            info!(generation, consumers = started, "Consumers re-registered");
        }
    }

    /// Restarts one consumer whose channel failed while the connection stayed up.
    pub async fn restart(&self, failure: ConsumerFailure) {
        let ConsumerFailure {
            queue,
            consumer_tag,
            generation,
        } = failure;

        let delay = {
            let mut entries = self.entries.lock().await;
            let Some(entry) = entries.get_mut(&queue) else {
                return;
            };
            match entry.handle.take() {
                Some(handle) if handle.consumer_tag() == consumer_tag => {
                    handle.stop(self.join_timeout()).await;
                }
                Some(other) => {
                    // Re-registered since the failure was reported.
                    entry.handle = Some(other);
                    return;
                }
                None => {}
            }
            entry.restarts += 1;
            self.supervisor.config().retry.delay_for(entry.restarts)
        };

        warn!(queue = %queue, delay_ms = delay.as_millis() as u64, "Restarting consumer after channel failure");
        if !interruptible_sleep(self.supervisor.subscribe_shutdown(), delay).await {
            return;
        }

        let mut entries = self.entries.lock().await;
        if !self.supervisor.generation().is_current(generation) {
            return;
        }
        let Some(entry) = entries.get_mut(&queue) else {
            return;
        };
        if entry.handle.is_some() {
            return;
        }
        match self.start(entry).await {
            Ok(handle) => entry.handle = Some(handle),
            Err(err) => {
                error!(queue = %queue, restarts = entry.restarts, error = %err, "Failed to restart consumer");
                self.schedule_restart(&queue);
            }
        }
    }

    /// Stops every consumer and forgets all registrations.
    pub async fn shutdown(&self) {
        let mut entries = self.entries.lock().await;
        let handles: Vec<ConsumerHandle> = entries
            .drain()
            .filter_map(|(_, entry)| entry.handle)
            .collect();
        let timeout = self.join_timeout();
        join_all(handles.into_iter().map(|handle| handle.stop(timeout))).await;
    }

    pub async fn status(&self) -> Vec<ConsumerStatus> {
        let entries = self.entries.lock().await;
        let mut statuses: Vec<ConsumerStatus> = entries
            .iter()
            .map(|(queue, entry)| match &entry.handle {
                Some(handle) => handle.status(),
                None => ConsumerStatus {
                    queue: queue.clone(),
                    generation: None,
                    consumer_tag: None,
                    running: false,
                    deliveries: 0,
                    last_activity: None,
                },
            })
            .collect();
        statuses.sort_by(|a, b| a.queue.cmp(&b.queue));
        statuses
    }

    pub async fn queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self.entries.lock().await.keys().cloned().collect();
        queues.sort();
        queues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Backoff, ConnectionConfig, RetryPolicy};
    use crate::testing::MemoryBroker;
    use std::sync::atomic::AtomicUsize;

    struct Fixture {
        broker: MemoryBroker,
        supervisor: Arc<ConnectionSupervisor>,
        pool: Arc<ChannelPool>,
        registry: ConsumerRegistry,
    }

    async fn fixture() -> Fixture {
        let broker = MemoryBroker::new();
        let config = ConnectionConfig::default()
            .with_retry(RetryPolicy::bounded(1, Backoff::Fixed { delay_ms: 1 }))
            .with_join_timeout(Duration::from_millis(500));
        let supervisor = Arc::new(ConnectionSupervisor::new(
            Arc::new(broker.clone()),
            Arc::new(config),
        ));
        supervisor.connect().await.unwrap();
        let pool = Arc::new(ChannelPool::new(Arc::clone(&supervisor)));
        let registry = ConsumerRegistry::new(Arc::clone(&supervisor), Arc::clone(&pool));
        Fixture {
            broker,
            supervisor,
            pool,
            registry,
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn counting_handler(counter: Arc<AtomicUsize>) -> Arc<dyn MessageHandler> {
        Arc::new(move |_message: Message| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        })
    }

    #[test]
    fn listener_defaults() {
        let options = ListenerOptions::default();
        assert_eq!(options.prefetch, 1);
        assert!(options.durable);
        assert!(options.auto_declare);
        assert_eq!(options.on_error, HandlerErrorPolicy::RequeueOnce);
        assert_eq!(options.on_unsettled, UnsettledPolicy::Ack);
    }

    #[test]
    fn panic_payloads_are_described() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "handler panicked: boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "handler panicked: bang");
    }

    #[test]
    fn failed_deliveries_requeue_once_per_key() {
        let failed = FailedDeliveries::default();
        let key = DeliveryKey::of(b"body", &MessageProperties::default());
        assert!(failed.first_failure(&key));
        assert!(!failed.first_failure(&key));
        assert!(failed.first_failure(&key));
        failed.forget(&key);
        assert!(failed.first_failure(&key));
    }

    #[test]
    fn delivery_key_prefers_message_id() {
        let with_id = MessageProperties::new().with_message_id("m-1");
        assert_eq!(DeliveryKey::of(b"a", &with_id), DeliveryKey::of(b"b", &with_id));
        let plain = MessageProperties::default();
        assert_ne!(DeliveryKey::of(b"a", &plain), DeliveryKey::of(b"b", &plain));
    }

    #[test]
    fn failed_deliveries_evict_oldest() {
        let failed = FailedDeliveries::default();
        for i in 0..=FAILED_DELIVERY_CAPACITY {
            failed.first_failure(&DeliveryKey::MessageId(i.to_string()));
        }
        assert!(failed.first_failure(&DeliveryKey::MessageId("0".into())));
        assert!(!failed.first_failure(&DeliveryKey::MessageId(FAILED_DELIVERY_CAPACITY.to_string())));
    }

    #[tokio::test]
    async fn unsettled_messages_are_acked_by_default() {
        let f = fixture().await;
        let seen = Arc::new(AtomicUsize::new(0));
        f.registry
            .register(ListenerRegistration::new("q1", counting_handler(seen.clone()), ListenerOptions::default()))
            .await
            .unwrap();

        f.pool.publish("q1", b"hello", &Default::default()).await.unwrap();
        eventually(|| seen.load(Ordering::SeqCst) == 1).await;
        eventually(|| f.broker.unacked_count("q1") == 0).await;
        assert_eq!(f.broker.message_count("q1"), 0);
    }

    #[tokio::test]
    async fn failing_handler_requeues_once_then_drops() {
        let f = fixture().await;
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let handler: Arc<dyn MessageHandler> = Arc::new(move |_message: Message| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("cannot process"))
            }
        });
        f.registry
            .register(ListenerRegistration::new("q1", handler, ListenerOptions::default()))
            .await
            .unwrap();

        f.pool.publish("q1", b"poison", &Default::default()).await.unwrap();
        eventually(|| attempts.load(Ordering::SeqCst) == 2).await;
        eventually(|| f.broker.unacked_count("q1") == 0).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(f.broker.message_count("q1"), 0);
    }

    #[tokio::test]
    async fn panicking_handler_is_isolated() {
        let f = fixture().await;
        let handler: Arc<dyn MessageHandler> = Arc::new(|message: Message| async move {
            if message.text() == "explode" {
                panic!("handler exploded");
            }
            message.ack().await?;
            anyhow::Ok(())
        });
        let options = ListenerOptions {
            on_error: HandlerErrorPolicy::Discard,
            ..ListenerOptions::default()
        };
        f.registry
            .register(ListenerRegistration::new("q1", handler, options))
            .await
            .unwrap();

        f.pool.publish("q1", b"explode", &Default::default()).await.unwrap();
        f.pool.publish("q1", b"fine", &Default::default()).await.unwrap();
        eventually(|| f.broker.message_count("q1") == 0 && f.broker.unacked_count("q1") == 0).await;

        let status = f.registry.status().await;
        assert_eq!(status.len(), 1);
        assert!(status[0].running);
        assert_eq!(status[0].deliveries, 2);
    }

    #[tokio::test]
    async fn replacing_a_listener_keeps_one_consumer() {
        let f = fixture().await;
        let seen = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            f.registry
                .register(ListenerRegistration::new("q1", counting_handler(seen.clone()), ListenerOptions::default()))
                .await
                .unwrap();
        }
        assert_eq!(f.broker.consumer_count("q1"), 1);
        assert_eq!(f.registry.queues().await, vec!["q1".to_string()]);
    }

    #[tokio::test]
    async fn unregister_cancels_and_closes_channel() {
        let f = fixture().await;
        let seen = Arc::new(AtomicUsize::new(0));
        f.registry
            .register(ListenerRegistration::new("q1", counting_handler(seen), ListenerOptions::default()))
            .await
            .unwrap();
        let channels_before = f.broker.live_channels();

        assert!(f.registry.unregister("q1").await);
        assert!(!f.registry.unregister("q1").await);
        assert_eq!(f.broker.consumer_count("q1"), 0);
        assert_eq!(f.broker.live_channels(), channels_before - 1);
    }

    #[tokio::test]
    async fn register_after_close_is_refused() {
        let f = fixture().await;
        f.supervisor.close().await;
        let seen = Arc::new(AtomicUsize::new(0));
        let result = f
            .registry
            .register(ListenerRegistration::new("q1", counting_handler(seen), ListenerOptions::default()))
            .await;
        assert!(matches!(result, Err(RabbitMQError::Closed)));
    }

    #[tokio::test]
    async fn missing_queue_without_auto_declare_is_an_error() {
        let f = fixture().await;
        let seen = Arc::new(AtomicUsize::new(0));
        let options = ListenerOptions {
            auto_declare: false,
            ..ListenerOptions::default()
        };
        let result = f
            .registry
            .register(ListenerRegistration::new("missing", counting_handler(seen), options))
            .await;
        assert!(result.is_err());
        assert!(f.registry.status().await.is_empty());
    }

    #[tokio::test]
    async fn teardown_then_replay_restarts_consumers() {
        let f = fixture().await;
        let seen = Arc::new(AtomicUsize::new(0));
        for queue in ["a", "b"] {
            f.registry
                .register(ListenerRegistration::new(queue, counting_handler(seen.clone()), ListenerOptions::default()))
                .await
                .unwrap();
        }
        let generation = f.supervisor.generation().current();

        f.registry.teardown_all().await;
        assert_eq!(f.broker.consumer_count("a"), 0);
        assert!(f.registry.status().await.iter().all(|s| !s.running));

        f.registry.replay(generation).await;
        assert_eq!(f.broker.consumer_count("a"), 1);
        assert_eq!(f.broker.consumer_count("b"), 1);
        let tags: Vec<_> = f.registry.status().await.into_iter().map(|s| s.consumer_tag).collect();
        assert!(tags.iter().all(Option::is_some));
    }

    #[tokio::test]
    async fn broken_consumer_channel_is_reported() {
        let f = fixture().await;
        let (mut failures, _cancel) = {
            // Loop driven by hand with its own report channel.
            let (tx, rx) = mpsc::unbounded_channel();
            let seen = Arc::new(AtomicUsize::new(0));
            let registration = Arc::new(ListenerRegistration::new(
                "q1",
                counting_handler(seen),
                ListenerOptions::default(),
            ));
            let (channel, generation) = f
                .pool
                .acquire_consumer_channel("q1", &registration.options)
                .await
                .unwrap();
            let stream = channel
                .basic_consume("q1", "consumer-test", ConsumeOptions::default())
                .await
                .unwrap();
            let (cancel, cancel_rx) = watch::channel(false);
            let consumer = ConsumerLoop {
                registration,
                channel,
                generation,
                current: f.supervisor.generation(),
                consumer_tag: "consumer-test".into(),
                cancel: cancel_rx,
                failures: tx,
                activity: Arc::new(Activity::new()),
                failed: Arc::new(FailedDeliveries::default()),
            };
            tokio::spawn(consumer.run(stream));
            (rx, cancel)
        };

        f.broker.break_consumer_channels("q1");
        let failure = tokio::time::timeout(Duration::from_secs(1), failures.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure.queue, "q1");
        assert_eq!(failure.consumer_tag, "consumer-test");
    }
}
