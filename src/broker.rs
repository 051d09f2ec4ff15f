//! Broker traits and implementations for queue-based message transport.
//!
//! This module defines the seam between the orchestrator and the message
//! broker. The distributor only ever talks to the [`Broker`] trait, which
//! keeps the dispatch engine testable and lets deployments choose their
//! transport:
//!
//! | Implementation | Module | Description |
//! |----------------|--------|-------------|
//! | AMQP | [`amqp`] | RabbitMQ via lapin, for real worker fleets |
//! | Memory | [`memory`] | In-process queues, for embedded runs and tests |
//!
//! # Contract
//!
//! - [`publish`](Broker::publish) marks every message for durable delivery
//!   (it survives a broker restart). Durability is a transport concern; the
//!   payload never carries it.
//! - [`queue_exists`](Broker::queue_exists) is a side-effect-free probe. A
//!   queue deleted between the probe and a publish surfaces as a
//!   [`BrokerError::NotFound`] from the publish, not a crash.
//! - [`consume`](Broker::consume) yields raw payload bytes; decoding is the
//!   caller's business (see [`crate::codec`]).

pub mod amqp;
pub mod memory;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// A stream of raw message payloads from one queue.
pub type MessageStream = Pin<Box<dyn Stream<Item = BrokerResult<Vec<u8>>> + Send>>;

/// Errors that can occur during broker operations.
///
/// Errors are categorized by failure type: `Connection` failures may succeed
/// on retry, `NotFound` means no queue (and therefore no worker pool) is
/// registered under the probed name.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Failed to reach or stay connected to the broker.
    #[error("broker connection failed: {0}")]
    Connection(String),

    /// The named queue does not exist.
    #[error("queue '{0}' does not exist")]
    NotFound(String),

    /// Failed to declare or delete a queue.
    #[error("queue operation failed: {0}")]
    Queue(String),

    /// Failed to publish a message or obtain the broker's ack.
    #[error("publish failed: {0}")]
    Publish(String),

    /// Failed to set up or drive a consumer.
    #[error("consume failed: {0}")]
    Consume(String),
}

/// Queue-based message transport.
///
/// Implementations must be safe to share across tasks; the distributor
/// publishes and consumes concurrently on one instance.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declares a durable queue, creating it if absent.
    async fn declare_queue(&self, queue: &str) -> BrokerResult<()>;

    /// Probes whether a queue exists without creating it.
    async fn queue_exists(&self, queue: &str) -> BrokerResult<bool>;

    /// Publishes a message to a queue, marked for durable delivery, and
    /// waits for the broker's ack.
    async fn publish(&self, queue: &str, payload: &[u8]) -> BrokerResult<()>;

    /// Starts consuming from a queue, acknowledging each delivery.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> BrokerResult<MessageStream>;

    /// Deletes a queue and everything still in it.
    async fn delete_queue(&self, queue: &str) -> BrokerResult<()>;
}
