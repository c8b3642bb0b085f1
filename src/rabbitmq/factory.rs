// src/rabbitmq/factory.rs
use futures::future::join_all;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::client::RabbitClient;
use super::errors::{RabbitMQError, Result};
use super::lapin_transport::LapinTransport;
use super::transport::Transport;
use crate::config::ConnectionConfig;

/// Hands out one named `RabbitClient` per logical connection.
///
/// Each client reports itself to the broker as `<client_name>#<name>`.
/// Connecting happens outside the client map lock, so a broker outage never
/// blocks `names`, `remove` or `shutdown_all`; `shutdown_all` also cancels
/// connects that are still in flight.
pub struct ConnectionFactory {
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    client_name: String,
    clients: Mutex<HashMap<String, RabbitClient>>,
    // Bumped by every `shutdown_all`; connects started under an older epoch are abandoned.
    epoch: watch::Sender<u64>,
}

impl ConnectionFactory {
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_transport(Arc::new(LapinTransport::new()), config)
    }

    pub fn with_transport(transport: Arc<dyn Transport>, config: ConnectionConfig) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            transport,
            config,
            client_name: format!("{}-factory#{}", env!("CARGO_PKG_NAME"), &suffix[..8]),
            clients: Mutex::new(HashMap::new()),
            epoch: watch::channel(0).0,
        }
    }

    pub fn with_client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    /// Runs `f` with the factory and shuts every client down afterwards, also
    /// when `f` panics.
    pub async fn scoped<F, Fut, T>(self, f: F) -> T
    where
        F: FnOnce(Arc<ConnectionFactory>) -> Fut,
        Fut: Future<Output = T>,
    {
        let factory = Arc::new(self);
        let outcome = AssertUnwindSafe(f(Arc::clone(&factory))).catch_unwind().await;
        factory.shutdown_all().await;
        match outcome {
            Ok(value) => value,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    fn live_client(clients: &HashMap<String, RabbitClient>, name: &str) -> Option<RabbitClient> {
        clients.get(name).filter(|client| !client.is_closed()).cloned()
    }

    /// Returns the client registered under `name`, connecting it on first
    /// use. A client that has been shut down is replaced.
    pub async fn client(&self, name: &str) -> Result<RabbitClient> {
        if let Some(client) = Self::live_client(&*self.clients.lock().await, name) {
            return Ok(client);
        }

        let mut epoch = self.epoch.subscribe();
        let started = *epoch.borrow_and_update();
        let config = self
            .config
            .clone()
            .with_connection_name(format!("{}#{}", self.client_name, name));

        let client = tokio::select! {
            connected = RabbitClient::connect_with(Arc::clone(&self.transport), config) => connected?,
            _ = epoch.changed() => {
                debug!(name = %name, "Factory shut down while connecting, abandoning client");
                return Err(RabbitMQError::Closed);
            }
        };

        let mut clients = self.clients.lock().await;
        if *self.epoch.borrow() != started {
            drop(clients);
            client.shutdown().await;
            return Err(RabbitMQError::Closed);
        }
        if let Some(existing) = Self::live_client(&clients, name) {
            // Another caller connected the same name first.
            drop(clients);
            client.shutdown().await;
            return Ok(existing);
        }
        info!(name = %name, "Created factory client");
        clients.insert(name.to_string(), client.clone());
        Ok(client)
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Shuts down and forgets the client named `name`.
    pub async fn remove(&self, name: &str) -> bool {
        let client = self.clients.lock().await.remove(name);
        match client {
            Some(client) => {
                client.shutdown().await;
                true
            }
            None => false,
        }
    }

    pub async fn shutdown_all(&self) {
        self.epoch.send_modify(|epoch| *epoch += 1);
        let clients: Vec<RabbitClient> = self.clients.lock().await.drain().map(|(_, client)| client).collect();
        info!(count = clients.len(), "Shutting down factory clients");
        join_all(clients.iter().map(|client| client.shutdown())).await;
    }
}

impl Drop for ConnectionFactory {
    fn drop(&mut self) {
        self.epoch.send_modify(|epoch| *epoch += 1);
        let clients: Vec<RabbitClient> = self.clients.get_mut().drain().map(|(_, client)| client).collect();
        if clients.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(count = clients.len(), "Connection factory dropped, shutting clients down in background");
                handle.spawn(async move {
                    join_all(clients.iter().map(|client| client.shutdown())).await;
                });
            }
            Err(_) => warn!(count = clients.len(), "Connection factory dropped outside a Tokio runtime"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Backoff, RetryPolicy};
    use crate::testing::MemoryBroker;
    use std::time::Duration;

    #[tokio::test]
    async fn clients_are_reused_per_name() {
        let broker = MemoryBroker::new();
        let factory = ConnectionFactory::with_transport(Arc::new(broker.clone()), ConnectionConfig::default())
            .with_client_name("billing");

        let first = factory.client("default").await.unwrap();
        let again = factory.client("default").await.unwrap();
        let other = factory.client("audit").await.unwrap();

        assert_eq!(broker.opens(), 2);
        assert_eq!(first.config().connection_name(), "billing#default");
        assert_eq!(again.config().connection_name(), "billing#default");
        assert_eq!(other.config().connection_name(), "billing#audit");
        assert_eq!(factory.names().await, vec!["audit".to_string(), "default".to_string()]);

        factory.shutdown_all().await;
        assert!(first.is_closed());
        assert!(other.is_closed());
        assert_eq!(broker.live_connections(), 0);
        assert!(factory.names().await.is_empty());
    }

    #[tokio::test]
    async fn remove_shuts_down_one_client() {
        let broker = MemoryBroker::new();
        let factory = ConnectionFactory::with_transport(Arc::new(broker.clone()), ConnectionConfig::default());

        let client = factory.client("worker").await.unwrap();
        assert!(factory.client_name().contains("#"));
        assert!(factory.remove("worker").await);
        assert!(!factory.remove("worker").await);
        assert!(client.is_closed());

        let replacement = factory.client("worker").await.unwrap();
        assert!(!replacement.is_closed());
        assert_eq!(broker.opens(), 2);
        factory.shutdown_all().await;
    }

    #[tokio::test]
    async fn pending_connect_does_not_block_shutdown_all() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(true);
        let config = ConnectionConfig::default()
            .with_retry(RetryPolicy::infinite(Backoff::Fixed { delay_ms: 5 }))
            .with_join_timeout(Duration::from_millis(200));
        let factory = Arc::new(ConnectionFactory::with_transport(Arc::new(broker.clone()), config));

        let connecting = Arc::clone(&factory);
        let pending = tokio::spawn(async move { connecting.client("worker").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        tokio::time::timeout(Duration::from_secs(1), factory.names())
            .await
            .expect("names should not wait for a pending connect");
        tokio::time::timeout(Duration::from_secs(2), factory.shutdown_all())
            .await
            .expect("shutdown_all should not wait for a pending connect");

        let result = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .expect("pending connect should be cancelled")
            .unwrap();
        assert!(matches!(result, Err(RabbitMQError::Closed)));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let attempts = broker.open_attempts();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.open_attempts(), attempts);
        assert!(factory.names().await.is_empty());
    }

    #[tokio::test]
    async fn scoped_shuts_clients_down() {
        let broker = MemoryBroker::new();
        let factory = ConnectionFactory::with_transport(Arc::new(broker.clone()), ConnectionConfig::default());

        let client = factory
            .scoped(|factory| async move { factory.client("default").await.unwrap() })
            .await;

        assert!(client.is_closed());
        assert_eq!(broker.live_connections(), 0);
    }

    #[tokio::test]
    async fn dropping_the_factory_shuts_clients_down() {
        let broker = MemoryBroker::new();
        let factory = ConnectionFactory::with_transport(Arc::new(broker.clone()), ConnectionConfig::default());
        let client = factory.client("default").await.unwrap();

        drop(factory);

        tokio::time::timeout(Duration::from_secs(2), async {
            while !client.is_closed() || broker.live_connections() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("clients not shut down after drop");
    }
}
