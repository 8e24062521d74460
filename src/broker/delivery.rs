//! Delivery envelopes and acknowledgment handles
//!
//! A [`DeliveryEnvelope`] is produced by a transport's delivery stream for each
//! inbound message. The engine splits it into the message content, which is
//! handed to the handler, and an [`AckHandle`] that stays with the processor.
//! Acknowledging or rejecting consumes the handle, so a delivery can be settled
//! at most once.

use crate::broker::error::TransportResult;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Live feed of inbound messages for one queue
pub type DeliveryStream = BoxStream<'static, DeliveryEnvelope>;

/// Transport-side settlement of deliveries
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Remove the delivery from the broker's unacked set
    async fn ack(&self, delivery_tag: u64) -> TransportResult<()>;

    /// Reject the delivery, optionally returning it to the queue
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> TransportResult<()>;
}

/// Message body and routing metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub body: Vec<u8>,
    pub routing_key: String,
    pub exchange: String,
    pub headers: HashMap<String, String>,
    pub redelivered: bool,
}

impl Delivery {
    pub fn new(body: impl Into<Vec<u8>>, routing_key: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            routing_key: routing_key.into(),
            exchange: String::new(),
            headers: HashMap::new(),
            redelivered: false,
        }
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Opaque handle used to settle one delivery
pub struct AckHandle {
    delivery_tag: u64,
    acker: Arc<dyn Acknowledger>,
}

impl AckHandle {
    pub fn new(delivery_tag: u64, acker: Arc<dyn Acknowledger>) -> Self {
        Self {
            delivery_tag,
            acker,
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub async fn ack(self) -> TransportResult<()> {
        self.acker.ack(self.delivery_tag).await
    }

    pub async fn nack(self, requeue: bool) -> TransportResult<()> {
        self.acker.nack(self.delivery_tag, requeue).await
    }
}

impl fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckHandle")
            .field("delivery_tag", &self.delivery_tag)
            .finish_non_exhaustive()
    }
}

/// One message plus its routing metadata and acknowledgment handle
#[derive(Debug)]
pub struct DeliveryEnvelope {
    pub delivery: Delivery,
    pub handle: AckHandle,
}

impl DeliveryEnvelope {
    pub fn new(delivery: Delivery, handle: AckHandle) -> Self {
        Self { delivery, handle }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.handle.delivery_tag()
    }

    pub fn into_parts(self) -> (Delivery, AckHandle) {
        (self.delivery, self.handle)
    }
}
