// src/rabbitmq/connection.rs
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::errors::{RabbitMQError, Result};
use super::transport::{Transport, TransportChannel, TransportConnection, TransportError};
use crate::config::ConnectionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Connection generation counter. A connection is installed under the current
/// value; losing or closing it retires that value.
#[derive(Debug)]
pub struct Generation(AtomicU64);

impl Default for Generation {
    fn default() -> Self {
        Self(AtomicU64::new(1))
    }
}

impl Generation {
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.current() == generation
    }

    /// Returns the new current value.
    pub(crate) fn retire(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Reported by a consumer loop whose delivery stream broke while it was not cancelled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerFailure {
    pub queue: String,
    pub consumer_tag: String,
    pub generation: u64,
}

/// Dependents of the connection (pool, registry) hook into recovery here.
#[async_trait]
pub trait ConnectionObserver: Send + Sync {
    /// Runs after the generation is retired and before the old connection is closed.
    async fn on_connection_lost(&self, generation: u64);

    async fn on_connection_restored(&self, generation: u64);

    /// The connection is still open; only this consumer needs a restart.
    async fn on_consumer_failed(&self, failure: ConsumerFailure);
}

struct LiveConnection {
    connection: Arc<dyn TransportConnection>,
    generation: u64,
}

pub struct ConnectionSupervisor {
    transport: Arc<dyn Transport>,
    config: Arc<ConnectionConfig>,
    state: watch::Sender<ConnectionState>,
    current: Mutex<Option<LiveConnection>>,
    generation: Arc<Generation>,
    shutdown: watch::Sender<bool>,
    failures_tx: mpsc::UnboundedSender<ConsumerFailure>,
    failures_rx: Mutex<Option<mpsc::UnboundedReceiver<ConsumerFailure>>>,
    closed: AtomicBool,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // An error means the sender is gone, which only happens on teardown.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Sleeps for `delay` unless shutdown is signalled first. Returns false on shutdown.
pub(crate) async fn interruptible_sleep(mut shutdown: watch::Receiver<bool>, delay: Duration) -> bool {
    if *shutdown.borrow_and_update() {
        return false;
    }
    tokio::select! {
        _ = wait_for_shutdown(&mut shutdown) => {
            debug!("Shutdown signal received during backoff delay");
            false
        }
        _ = tokio::time::sleep(delay) => true,
    }
}

impl ConnectionSupervisor {
    pub fn new(transport: Arc<dyn Transport>, config: Arc<ConnectionConfig>) -> Self {
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            config,
            state: watch::channel(ConnectionState::Disconnected).0,
            current: Mutex::new(None),
            generation: Arc::new(Generation::default()),
            shutdown: watch::channel(false).0,
            failures_tx,
            failures_rx: Mutex::new(Some(failures_rx)),
            closed: AtomicBool::new(false),
            monitor: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub(crate) fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    pub fn generation(&self) -> Arc<Generation> {
        Arc::clone(&self.generation)
    }

    pub(crate) fn failure_sender(&self) -> mpsc::UnboundedSender<ConsumerFailure> {
        self.failures_tx.clone()
    }

    /// Moves to `next` unless the state is already `Closed` or already `next`.
    fn transition(&self, next: ConnectionState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed || *state == next {
                return false;
            }
            debug!(from = %state, to = %next, "Connection state change");
            *state = next;
            true
        })
    }

    pub fn ensure_connected(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Closed => Err(RabbitMQError::Closed),
            state => Err(RabbitMQError::NotConnected { state }),
        }
    }

    /// Initial connect. Retries per the connection policy and returns the final
    /// error when the policy is exhausted.
    pub async fn connect(&self) -> Result<u64> {
        if self.is_closed() {
            return Err(RabbitMQError::Closed);
        }
        if let Some(generation) = self.live_generation() {
            return Ok(generation);
        }
        self.establish(ConnectionState::Connecting).await
    }

    fn live_generation(&self) -> Option<u64> {
        if !self.is_connected() {
            return None;
        }
        lock(&self.current).as_ref().map(|live| live.generation)
    }

    async fn establish(&self, phase: ConnectionState) -> Result<u64> {
        let policy = &self.config.retry;
        let mut attempt = 0u32;
        loop {
            if self.is_closed() {
                return Err(RabbitMQError::Closed);
            }
            self.transition(phase);
            attempt += 1;
            info!(uri = %self.config.display_uri(), attempt, "Attempting to connect to RabbitMQ");

            match self.open_with_timeout().await {
                Ok(connection) => return self.install(connection).await,
                Err(err) => {
                    if policy.is_exhausted(attempt) {
                        error!(attempt, error = %err, "Max connection attempts reached. Giving up.");
                        self.transition(ConnectionState::Disconnected);
                        return Err(RabbitMQError::ConnectFailed {
                            attempts: attempt,
                            source: err,
                        });
                    }
                    let delay = policy.delay_for(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Failed to connect to RabbitMQ, retrying"
                    );
                    if !interruptible_sleep(self.subscribe_shutdown(), delay).await {
                        return Err(RabbitMQError::Closed);
                    }
                }
            }
        }
    }

    async fn open_with_timeout(&self) -> std::result::Result<Arc<dyn TransportConnection>, TransportError> {
        let timeout = Duration::from_millis(self.config.connection_timeout_ms);
        match tokio::time::timeout(timeout, self.transport.open(&self.config)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::ConnectionError(format!(
                "connection attempt timed out after {}ms",
                self.config.connection_timeout_ms
            ))),
        }
    }

    async fn install(&self, connection: Arc<dyn TransportConnection>) -> Result<u64> {
        let installed = {
            let mut current = lock(&self.current);
            if self.is_closed() {
                None
            } else {
                let generation = self.generation.current();
                *current = Some(LiveConnection {
                    connection: Arc::clone(&connection),
                    generation,
                });
                Some(generation)
            }
        };

        match installed {
            Some(generation) => {
                self.transition(ConnectionState::Connected);
                info!(generation, "Successfully connected to RabbitMQ");
                Ok(generation)
            }
            None => {
                if let Err(err) = connection.close().await {
                    debug!(error = %err, "Error closing connection opened during shutdown");
                }
                Err(RabbitMQError::Closed)
            }
        }
    }

    fn live(&self) -> Result<(Arc<dyn TransportConnection>, u64)> {
        self.ensure_connected()?;
        let current = lock(&self.current);
        match current.as_ref() {
            Some(live) if self.generation.is_current(live.generation) => {
                Ok((Arc::clone(&live.connection), live.generation))
            }
            _ => Err(RabbitMQError::NotConnected { state: self.state() }),
        }
    }

    /// Opens a channel on the live connection, tagged with its generation.
    pub async fn open_channel(&self) -> Result<(Arc<dyn TransportChannel>, u64)> {
        let (connection, generation) = self.live()?;
        let channel = connection.create_channel().await?;
        if !self.generation.is_current(generation) {
            if let Err(err) = channel.close().await {
                debug!(error = %err, "Error closing channel opened on a retired connection");
            }
            return Err(RabbitMQError::NotConnected { state: self.state() });
        }
        debug!(channel_id = channel.id(), generation, "Opened channel");
        Ok((channel, generation))
    }

    /// Starts the background monitor. Only the first call has an effect.
    pub fn spawn_monitor(self: &Arc<Self>, observer: Arc<dyn ConnectionObserver>) {
        let Some(failures) = lock(&self.failures_rx).take() else {
            return;
        };
        let supervisor = Arc::clone(self);
        let handle = tokio::spawn(async move { supervisor.monitor(observer, failures).await });
        *lock(&self.monitor) = Some(handle);
    }

    async fn monitor(
        self: Arc<Self>,
        observer: Arc<dyn ConnectionObserver>,
        mut failures: mpsc::UnboundedReceiver<ConsumerFailure>,
    ) {
        let mut shutdown = self.subscribe_shutdown();
        let mut state = self.subscribe_state();
        debug!("Connection monitor started");

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            state.borrow_and_update();
            let live = lock(&self.current)
                .as_ref()
                .map(|live| (Arc::clone(&live.connection), live.generation));

            match live {
                Some((connection, generation)) => {
                    tokio::select! {
                        biased;
                        _ = wait_for_shutdown(&mut shutdown) => break,
                        _ = connection.closed() => {
                            warn!(generation, "RabbitMQ connection lost");
                            self.recover(observer.as_ref(), generation).await;
                        }
                        Some(failure) = failures.recv() => {
                            self.consumer_failed(observer.as_ref(), connection.as_ref(), generation, failure).await;
                        }
                    }
                }
                None => {
                    tokio::select! {
                        biased;
                        _ = wait_for_shutdown(&mut shutdown) => break,
                        _ = state.changed() => {}
                        Some(failure) = failures.recv() => {
                            debug!(queue = %failure.queue, generation = failure.generation, "Ignoring consumer failure while disconnected");
                        }
                    }
                }
            }
        }
        debug!("Connection monitor stopped");
    }

    async fn consumer_failed(
        &self,
        observer: &dyn ConnectionObserver,
        connection: &dyn TransportConnection,
        generation: u64,
        failure: ConsumerFailure,
    ) {
        if failure.generation != generation || !self.generation.is_current(generation) {
            debug!(queue = %failure.queue, generation = failure.generation, "Ignoring failure report from a retired generation");
            return;
        }
        if connection.is_open() {
            warn!(queue = %failure.queue, generation, "Consumer channel failed, restarting consumer");
            observer.on_consumer_failed(failure).await;
        } else {
            warn!(queue = %failure.queue, generation, "Consumer channel failed with the connection down");
            self.recover(observer, generation).await;
        }
    }

    /// Teardown, then reconnect rounds until success or shutdown.
    async fn recover(&self, observer: &dyn ConnectionObserver, lost: u64) {
        if !self.generation.is_current(lost) || self.is_closed() {
            return;
        }
        self.transition(ConnectionState::Reconnecting);
        let retired = self.generation.retire();
        debug!(lost, next = retired, "Retired connection generation");

        let old = lock(&self.current).take();
        observer.on_connection_lost(lost).await;
        if let Some(old) = old {
            if let Err(err) = old.connection.close().await {
                debug!(error = %err, "Ignoring error while closing lost connection");
            }
        }

        loop {
            match self.establish(ConnectionState::Reconnecting).await {
                Ok(generation) => {
                    info!(generation, "Reconnected to RabbitMQ");
                    observer.on_connection_restored(generation).await;
                    return;
                }
                Err(RabbitMQError::Closed) => return,
                Err(err) => {
                    error!(error = %err, "Reconnection attempts exhausted, starting a new round");
                    let delay = self.config.retry.delay_for(1);
                    if !interruptible_sleep(self.subscribe_shutdown(), delay).await {
                        return;
                    }
                }
            }
        }
    }

    /// Marks the supervisor `Closed` and wakes every backoff sleep and the monitor.
    pub fn signal_shutdown(&self) {
        if self.transition(ConnectionState::Closed) {
            info!("Connection supervisor closing");
        }
        self.shutdown.send_replace(true);
    }

    /// Waits for the monitor to stop, aborting it after `timeout`.
    pub async fn join_monitor(&self, timeout: Duration) {
        let handle = lock(&self.monitor).take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(timeout, &mut handle).await.is_err() {
                warn!(timeout_ms = timeout.as_millis() as u64, "Connection monitor did not stop in time, aborting it");
                handle.abort();
            }
        }
    }

    /// Idempotent; the transport connection is closed exactly once.
    pub async fn close(&self) {
        self.signal_shutdown();
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.generation.retire();
        let live = lock(&self.current).take();
        if let Some(live) = live {
            info!(generation = live.generation, "Closing RabbitMQ connection");
            if let Err(err) = live.connection.close().await {
                let err = RabbitMQError::shutdown("closing connection", err);
                warn!(error = %err, "Ignoring error during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Backoff, RetryPolicy};
    use crate::testing::MemoryBroker;
    use std::sync::atomic::AtomicUsize;

    fn fast_config(max_attempts: Option<u32>) -> Arc<ConnectionConfig> {
        let backoff = Backoff::Fixed { delay_ms: 5 };
        let retry = match max_attempts {
            Some(max) => RetryPolicy::bounded(max, backoff),
            None => RetryPolicy::infinite(backoff),
        };
        Arc::new(ConnectionConfig::default().with_retry(retry))
    }

    #[derive(Default)]
    struct RecordingObserver {
        lost: AtomicUsize,
        restored: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionObserver for RecordingObserver {
        async fn on_connection_lost(&self, _generation: u64) {
            self.lost.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_connection_restored(&self, _generation: u64) {
            self.restored.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_consumer_failed(&self, _failure: ConsumerFailure) {}
    }

    #[test]
    fn state_display_is_lowercase() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(ConnectionState::Closed.to_string(), "closed");
    }

    #[test]
    fn generation_retire_invalidates_previous() {
        let generation = Generation::default();
        let first = generation.current();
        assert!(generation.is_current(first));
        let next = generation.retire();
        assert_eq!(next, first + 1);
        assert!(!generation.is_current(first));
    }

    #[tokio::test]
    async fn connect_installs_generation() {
        let broker = MemoryBroker::new();
        let supervisor = ConnectionSupervisor::new(Arc::new(broker.clone()), fast_config(Some(1)));
        let generation = supervisor.connect().await.unwrap();
        assert_eq!(supervisor.state(), ConnectionState::Connected);
        assert!(supervisor.generation().is_current(generation));
        assert_eq!(broker.opens(), 1);

        // Already connected: no second socket.
        assert_eq!(supervisor.connect().await.unwrap(), generation);
        assert_eq!(broker.opens(), 1);
    }

    #[tokio::test]
    async fn connect_reports_attempts_when_exhausted() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(true);
        let supervisor = ConnectionSupervisor::new(Arc::new(broker.clone()), fast_config(Some(3)));

        match supervisor.connect().await {
            Err(RabbitMQError::ConnectFailed { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
        assert!(matches!(
            supervisor.open_channel().await,
            Err(RabbitMQError::NotConnected { state: ConnectionState::Disconnected })
        ));
    }

    #[tokio::test]
    async fn connect_retries_until_broker_accepts() {
        let broker = MemoryBroker::new();
        broker.fail_next_opens(2);
        let supervisor = ConnectionSupervisor::new(Arc::new(broker.clone()), fast_config(None));
        supervisor.connect().await.unwrap();
        assert_eq!(broker.open_attempts(), 3);
        assert_eq!(broker.opens(), 1);
    }

    #[tokio::test]
    async fn closed_is_terminal() {
        let broker = MemoryBroker::new();
        let supervisor = ConnectionSupervisor::new(Arc::new(broker.clone()), fast_config(Some(1)));
        supervisor.connect().await.unwrap();
        supervisor.close().await;
        supervisor.close().await;

        assert_eq!(supervisor.state(), ConnectionState::Closed);
        assert_eq!(broker.closes(), 1);
        assert!(!supervisor.transition(ConnectionState::Connecting));
        assert!(matches!(supervisor.connect().await, Err(RabbitMQError::Closed)));
    }

    #[tokio::test]
    async fn shutdown_interrupts_backoff() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(true);
        let config = ConnectionConfig::default().with_retry(RetryPolicy::infinite(Backoff::Fixed {
            delay_ms: 60_000,
        }));
        let supervisor = Arc::new(ConnectionSupervisor::new(Arc::new(broker), Arc::new(config)));

        let connecting = {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move { supervisor.connect().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        supervisor.signal_shutdown();

        let result = tokio::time::timeout(Duration::from_secs(2), connecting)
            .await
            .expect("connect should stop on shutdown")
            .unwrap();
        assert!(matches!(result, Err(RabbitMQError::Closed)));
    }

    #[tokio::test]
    async fn monitor_reconnects_after_loss() {
        let broker = MemoryBroker::new();
        let supervisor = Arc::new(ConnectionSupervisor::new(Arc::new(broker.clone()), fast_config(None)));
        let observer = Arc::new(RecordingObserver::default());
        supervisor.spawn_monitor(observer.clone());
        let first = supervisor.connect().await.unwrap();

        broker.kill_connections();
        tokio::time::timeout(Duration::from_secs(2), async {
            while observer.restored.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("monitor should reconnect");

        assert_eq!(supervisor.state(), ConnectionState::Connected);
        assert_eq!(observer.lost.load(Ordering::SeqCst), 1);
        assert_eq!(observer.restored.load(Ordering::SeqCst), 1);
        assert!(!supervisor.generation().is_current(first));
        assert_eq!(broker.live_connections(), 1);

        supervisor.close().await;
        supervisor.join_monitor(Duration::from_secs(1)).await;
        assert_eq!(broker.live_connections(), 0);
    }
}
