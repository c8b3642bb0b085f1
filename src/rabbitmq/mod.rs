// src/rabbitmq/mod.rs
// Supervised RabbitMQ connection, channels and consumers

pub mod errors;
pub mod transport;
pub mod connection;
pub mod channel_manager;
pub mod consumer;
pub mod client;
pub mod factory;
pub mod lapin_transport;

pub use client::{ListenerBuilder, RabbitClient};
pub use connection::{ConnectionObserver, ConnectionState, ConnectionSupervisor, ConsumerFailure, Generation};
pub use consumer::{
    ConsumerStatus, HandlerErrorPolicy, ListenerOptions, ListenerRegistration, MessageHandler, UnsettledPolicy,
};
pub use errors::{RabbitMQError, Result};
pub use factory::ConnectionFactory;
pub use lapin_transport::LapinTransport;
pub use transport::{QueueInfo, Transport, TransportError};
