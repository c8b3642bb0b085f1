// src/rabbitmq/errors.rs

use serde_json::Error as SerdeError;
use thiserror::Error;

use super::connection::ConnectionState;
use super::transport::TransportError;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("Not connected to RabbitMQ (state: {state})")]
    NotConnected { state: ConnectionState },

    #[error("RabbitMQ transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("RabbitMQ connection failed after {attempts} attempt(s): {source}")]
    ConnectFailed {
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("Publish to queue '{queue}' failed after {attempts} attempt(s): {source}")]
    PublishFailed {
        queue: String,
        attempts: u32,
        #[source]
        source: Box<RabbitMQError>,
    },

    #[error("Handler for queue '{queue}' failed: {message}")]
    Handler { queue: String, message: String },

    #[error("Delivery {delivery_tag} from queue '{queue}' belongs to a channel that is no longer open")]
    StaleDelivery { queue: String, delivery_tag: u64 },

    #[error("Delivery {0} was already acknowledged or rejected")]
    AlreadySettled(u64),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Client has been shut down")]
    Closed,

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    /// Whether a caller-side retry can reasonably succeed once the connection recovers.
    pub fn is_retryable(&self) -> bool {
        match self {
            RabbitMQError::NotConnected { .. } => true,
            RabbitMQError::Transport(err) => err.is_transient(),
            _ => false,
        }
    }

    /// A teardown failure; shutdown logs these and never returns them.
    pub(crate) fn shutdown(context: &str, err: impl std::fmt::Display) -> Self {
        RabbitMQError::ShutdownError(format!("{}: {}", context, err))
    }
}

impl From<std::num::ParseIntError> for RabbitMQError {
    fn from(err: std::num::ParseIntError) -> Self {
        RabbitMQError::Config(format!("Parse error: {}", err))
    }
}
