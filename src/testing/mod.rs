//! Testing utilities
//!
//! An in-process AMQP broker implementing the `Transport` seam, so the connection
//! supervisor, channel pool and consumers can be exercised without RabbitMQ.

pub mod memory;

pub use memory::MemoryBroker;
