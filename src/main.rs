use anyhow::Context;
use resilient_rabbit::{ConnectionArgs, Message, RabbitClient};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // First CLI argument overrides RABBITMQ_HOST
    let mut args = ConnectionArgs::new();
    if let Some(host) = std::env::args().nth(1) {
        args = args.host(host);
    }
    let config = args.resolve().context("Failed to load RabbitMQ configuration")?;
    let queue = std::env::var("RABBITMQ_DEMO_QUEUE").unwrap_or_else(|_| "demo".to_string());

    RabbitClient::scoped(config, |client| async move {
        client
            .listener(queue.as_str())
            .prefetch(10)
            .handle(|message: Message| async move {
                info!(queue = %message.queue(), body = %message.text(), "Received message");
                anyhow::Ok(())
            })
            .await?;

        for sequence in 1..=3 {
            client
                .send_json(&queue, &json!({ "sequence": sequence, "text": "Hello from resilient-rabbit" }))
                .await?;
        }
        info!(queue = %queue, "Published demo messages, press Ctrl+C to stop");

        tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
        info!("Ctrl+C received, shutting down");
        anyhow::Ok(())
    })
    .await
}
