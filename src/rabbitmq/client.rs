// src/rabbitmq/client.rs
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{watch, OnceCell};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::channel_manager::ChannelPool;
use super::connection::{
    interruptible_sleep, ConnectionObserver, ConnectionState, ConnectionSupervisor, ConsumerFailure,
};
use super::consumer::{
    ConsumerRegistry, ConsumerStatus, HandlerErrorPolicy, ListenerOptions, ListenerRegistration, MessageHandler,
    UnsettledPolicy,
};
use super::errors::{RabbitMQError, Result};
use super::lapin_transport::LapinTransport;
use super::transport::{QueueInfo, Transport};
use crate::config::ConnectionConfig;
use crate::message::MessageProperties;

/// Wires the supervisor's lifecycle events into the pool and the registry.
struct Recovery {
    pool: Arc<ChannelPool>,
    registry: Arc<ConsumerRegistry>,
}

#[async_trait]
impl ConnectionObserver for Recovery {
    async fn on_connection_lost(&self, generation: u64) {
        debug!(generation, "Invalidating channels of lost connection");
        self.pool.invalidate().await;
        self.registry.teardown_all().await;
    }

    async fn on_connection_restored(&self, generation: u64) {
        self.registry.replay(generation).await;
    }

    async fn on_consumer_failed(&self, failure: ConsumerFailure) {
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            registry.restart(failure).await;
        });
    }
}

struct ClientInner {
    supervisor: Arc<ConnectionSupervisor>,
    pool: Arc<ChannelPool>,
    registry: Arc<ConsumerRegistry>,
    shutdown: OnceCell<()>,
}

impl ClientInner {
    async fn shutdown(&self) {
        self.shutdown
            .get_or_init(|| async {
                info!("Shutting down RabbitMQ client");
                self.supervisor.signal_shutdown();
                self.supervisor
                    .join_monitor(self.supervisor.config().join_timeout())
                    .await;
                self.registry.shutdown().await;
                self.pool.release().await;
                self.supervisor.close().await;
                info!("RabbitMQ client shut down");
            })
            .await;
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if self.shutdown.initialized() {
            return;
        }
        self.supervisor.signal_shutdown();
        let supervisor = Arc::clone(&self.supervisor);
        let pool = Arc::clone(&self.pool);
        let registry = Arc::clone(&self.registry);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("RabbitMQ client dropped without shutdown, cleaning up in background");
                handle.spawn(async move {
                    registry.shutdown().await;
                    pool.release().await;
                    supervisor.close().await;
                });
            }
            Err(_) => warn!("RabbitMQ client dropped outside a Tokio runtime without shutdown"),
        }
    }
}

/// Resilient RabbitMQ client
///
/// Cloning is cheap; all clones share one supervised connection, one
/// publish channel and one listener registry. Call [`RabbitClient::shutdown`]
/// for an orderly stop; dropping the last clone only starts a best-effort
/// background cleanup.
#[derive(Clone)]
pub struct RabbitClient {
    inner: Arc<ClientInner>,
}

impl RabbitClient {
    /// Connects to a real broker through lapin.
    pub async fn connect(config: ConnectionConfig) -> Result<Self> {
        Self::connect_with(Arc::new(LapinTransport::new()), config).await
    }

    /// Connects using `RABBITMQ_*` environment variables (and `.env`).
    pub async fn from_env() -> Result<Self> {
        Self::connect(ConnectionConfig::from_env()?).await
    }

    pub async fn connect_with(transport: Arc<dyn Transport>, config: ConnectionConfig) -> Result<Self> {
        config.validate()?;
        info!(uri = %config.display_uri(), name = %config.connection_name(), "Starting RabbitMQ client");

        let supervisor = Arc::new(ConnectionSupervisor::new(transport, Arc::new(config)));
        let pool = Arc::new(ChannelPool::new(Arc::clone(&supervisor)));
        let registry = Arc::new(ConsumerRegistry::new(Arc::clone(&supervisor), Arc::clone(&pool)));
        supervisor.spawn_monitor(Arc::new(Recovery {
            pool: Arc::clone(&pool),
            registry: Arc::clone(&registry),
        }));

        let client = Self {
            inner: Arc::new(ClientInner {
                supervisor,
                pool,
                registry,
                shutdown: OnceCell::new(),
            }),
        };

        if let Err(err) = client.inner.supervisor.connect().await {
            error!(error = %err, "Initial RabbitMQ connection failed");
            client.shutdown().await;
            return Err(err);
        }
        Ok(client)
    }

    /// Connects, runs `f` with the client and shuts down afterwards, also
    /// when `f` fails or panics.
    pub async fn scoped<F, Fut, T, E>(config: ConnectionConfig, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(RabbitClient) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<RabbitMQError>,
    {
        Self::scoped_with(Arc::new(LapinTransport::new()), config, f).await
    }

    pub async fn scoped_with<F, Fut, T, E>(
        transport: Arc<dyn Transport>,
        config: ConnectionConfig,
        f: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce(RabbitClient) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<RabbitMQError>,
    {
        let client = Self::connect_with(transport, config).await?;
        let outcome = AssertUnwindSafe(f(client.clone())).catch_unwind().await;
        client.shutdown().await;
        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        self.inner.supervisor.config()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.supervisor.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.supervisor.subscribe_state()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.supervisor.is_connected()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.supervisor.is_closed()
    }

    /// Publishes `body` to `queue` through the default exchange.
    ///
    /// Transient failures (including a connection that is being
    /// re-established) are retried per `publish_retry`; once that policy is
    /// exhausted the last error is wrapped in `PublishFailed`.
    pub async fn send(
        &self,
        queue: &str,
        body: impl AsRef<[u8]>,
        properties: MessageProperties,
    ) -> Result<()> {
        let body = body.as_ref();
        let policy = &self.config().publish_retry;
        let mut attempt: u32 = 0;
        loop {
            if self.is_closed() {
                return Err(RabbitMQError::Closed);
            }
            attempt += 1;
            match self.inner.pool.publish(queue, body, &properties).await {
                Ok(()) => {
                    debug!(queue = %queue, attempt, bytes = body.len(), "Message published");
                    return Ok(());
                }
                Err(RabbitMQError::Closed) => return Err(RabbitMQError::Closed),
                Err(err) if err.is_retryable() && !policy.is_exhausted(attempt) => {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        queue = %queue,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Publish failed, retrying"
                    );
                    if !interruptible_sleep(self.inner.supervisor.subscribe_shutdown(), delay).await {
                        return Err(RabbitMQError::Closed);
                    }
                }
                Err(err) if err.is_retryable() => {
                    error!(queue = %queue, attempts = attempt, error = %err, "Giving up on publish");
                    return Err(RabbitMQError::PublishFailed {
                        queue: queue.to_string(),
                        attempts: attempt,
                        source: Box::new(err),
                    });
                }
                Err(err) => {
                    error!(queue = %queue, error = %err, "Publish failed");
                    return Err(err);
                }
            }
        }
    }

    /// Serializes `value` as JSON and sends it with a fresh message id.
    pub async fn send_json<T: Serialize>(&self, queue: &str, value: &T) -> Result<()> {
        let body = serde_json::to_vec(value)?;
        let properties = MessageProperties::new()
            .with_content_type("application/json")
            .with_message_id(Uuid::new_v4().to_string())
            .with_timestamp(Utc::now().timestamp().max(0) as u64);
        self.send(queue, body, properties).await
    }

    pub async fn declare_queue(&self, queue: &str, durable: bool) -> Result<QueueInfo> {
        self.inner.pool.declare_queue(queue, durable).await
    }

    /// Number of ready messages in `queue`; fails if it does not exist.
    pub async fn get_message_counts(&self, queue: &str) -> Result<u32> {
        self.inner.pool.message_count(queue).await
    }

    /// Purges `queue`, returning how many messages were removed.
    pub async fn flush_queue(&self, queue: &str) -> Result<u32> {
        self.inner.pool.purge(queue).await
    }

    /// Registers (or replaces) the listener for `registration.queue`.
    pub async fn register(&self, registration: ListenerRegistration) -> Result<()> {
        self.inner.registry.register(registration).await
    }

    /// Starts building a listener for `queue`.
    pub fn listener(&self, queue: impl Into<String>) -> ListenerBuilder<'_> {
        ListenerBuilder {
            client: self,
            queue: queue.into(),
            options: ListenerOptions::default(),
        }
    }

    /// Stops and forgets the listener for `queue`. Returns false if none was registered.
    pub async fn stop_listener(&self, queue: &str) -> bool {
        self.inner.registry.unregister(queue).await
    }

    pub async fn listeners(&self) -> Vec<ConsumerStatus> {
        self.inner.registry.status().await
    }

    /// Idempotent and safe to call concurrently; every caller returns once
    /// the first shutdown has completed.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await
    }
}

/// Fluent listener registration, see [`RabbitClient::listener`]
#[must_use = "a listener is only registered once `handle` is awaited"]
pub struct ListenerBuilder<'a> {
    client: &'a RabbitClient,
    queue: String,
    options: ListenerOptions,
}

impl ListenerBuilder<'_> {
    pub fn options(mut self, options: ListenerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.options.prefetch = prefetch;
        self
    }

    pub fn no_ack(mut self, no_ack: bool) -> Self {
        self.options.no_ack = no_ack;
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.options.durable = durable;
        self
    }

    pub fn auto_declare(mut self, auto_declare: bool) -> Self {
        self.options.auto_declare = auto_declare;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.options.exclusive = exclusive;
        self
    }

    pub fn on_error(mut self, policy: HandlerErrorPolicy) -> Self {
        self.options.on_error = policy;
        self
    }

    pub fn on_unsettled(mut self, policy: UnsettledPolicy) -> Self {
        self.options.on_unsettled = policy;
        self
    }

    /// Registers `handler` and hands it back so callers can keep inspecting it.
    pub async fn handle<H: MessageHandler>(self, handler: H) -> Result<Arc<H>> {
        let handler = Arc::new(handler);
        let registration = ListenerRegistration::new(
            self.queue,
            Arc::clone(&handler) as Arc<dyn MessageHandler>,
            self.options,
        );
        self.client.register(registration).await?;
        Ok(handler)
    }
}
