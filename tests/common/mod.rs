// Shared helpers for the integration tests
#![allow(dead_code)]

use resilient_rabbit::testing::MemoryBroker;
use resilient_rabbit::{Backoff, ConnectionConfig, Message, RabbitClient, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub fn fast_config() -> ConnectionConfig {
    ConnectionConfig::default()
        .with_retry(RetryPolicy::infinite(Backoff::Fixed { delay_ms: 5 }))
        .with_publish_retry(RetryPolicy::bounded(200, Backoff::Fixed { delay_ms: 10 }))
        .with_join_timeout(Duration::from_millis(500))
}

pub async fn connect(broker: &MemoryBroker, config: ConnectionConfig) -> RabbitClient {
    RabbitClient::connect_with(Arc::new(broker.clone()), config)
        .await
        .expect("client should connect to the in-memory broker")
}

/// Polls `condition` every few milliseconds, failing the test after five seconds.
pub async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}

/// Kills every connection and waits for the client to come back on a new one.
pub async fn force_reconnect(broker: &MemoryBroker, client: &RabbitClient) {
    let opens = broker.opens();
    broker.kill_connections();
    wait_until("reconnect", || broker.opens() > opens && client.is_connected()).await;
}

/// Handler that forwards message bodies to a channel.
pub fn collector() -> (
    impl Fn(Message) -> futures::future::Ready<anyhow::Result<()>> + Send + Sync + 'static,
    mpsc::UnboundedReceiver<String>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |message: Message| {
        tx.send(message.text()).ok();
        futures::future::ready(anyhow::Ok(()))
    };
    (handler, rx)
}

pub async fn next_body(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a delivery")
        .expect("collector channel closed")
}
