//! Transport abstraction consumed by the engine
//!
//! The transport represents an already opened broker channel. The engine only
//! declares, binds and consumes the queues it was given handlers for, and closes
//! the channel once after draining.

use crate::broker::delivery::DeliveryStream;
use crate::broker::error::TransportResult;
use async_trait::async_trait;

/// Result of a queue declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueHandle {
    pub name: String,
    pub message_count: usize,
    pub consumer_count: usize,
}

/// Broker channel operations used by the consumer engine
#[async_trait]
pub trait Transport: Send + Sync {
    async fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        exclusive: bool,
    ) -> TransportResult<QueueHandle>;

    async fn bind_queue(&self, queue: &str, routing_key: &str, exchange: &str)
        -> TransportResult<()>;

    /// Start consuming a queue; with `auto_ack` the broker settles on delivery
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> TransportResult<DeliveryStream>;

    async fn close(&self) -> TransportResult<()>;
}
