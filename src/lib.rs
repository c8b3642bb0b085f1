//! Resilient RabbitMQ client
//!
//! A `RabbitClient` keeps one supervised AMQP connection alive, reconnecting
//! with backoff when it drops, and re-attaches every registered listener on
//! the new connection.
//!
//! ```no_run
//! use resilient_rabbit::{ConnectionConfig, Message, MessageProperties, RabbitClient};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let client = RabbitClient::connect(ConnectionConfig::default()).await?;
//! client
//!     .listener("hello")
//!     .prefetch(10)
//!     .handle(|message: Message| async move {
//!         println!("{}", message.text());
//!         anyhow::Ok(())
//!     })
//!     .await?;
//! client.send("hello", "world", MessageProperties::default()).await?;
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod env;
pub mod message;
pub mod rabbitmq;
pub mod testing;

pub use config::{Backoff, ConnectionConfig, RetryPolicy};
pub use env::ConnectionArgs;
pub use message::{Message, MessageProperties};
pub use rabbitmq::{
    ConnectionFactory, ConnectionState, HandlerErrorPolicy, ListenerOptions, RabbitClient, RabbitMQError, Result,
    UnsettledPolicy,
};
