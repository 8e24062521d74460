//! In-memory transport
//!
//! A process-local broker channel with direct-exchange routing. Every ack and
//! nack is recorded so callers can inspect how deliveries were settled, and
//! settling an unknown or already settled delivery tag is rejected the same way
//! a real broker rejects it.

use crate::broker::delivery::{AckHandle, Acknowledger, Delivery, DeliveryEnvelope, DeliveryStream};
use crate::broker::error::{TransportError, TransportResult};
use crate::broker::transport::{QueueHandle, Transport};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// How a delivery was settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Acked {
        delivery_tag: u64,
        queue: String,
        body: Vec<u8>,
    },
    Nacked {
        delivery_tag: u64,
        queue: String,
        body: Vec<u8>,
        requeue: bool,
    },
}

impl Settlement {
    pub fn delivery_tag(&self) -> u64 {
        match self {
            Settlement::Acked { delivery_tag, .. } | Settlement::Nacked { delivery_tag, .. } => {
                *delivery_tag
            }
        }
    }

    pub fn queue(&self) -> &str {
        match self {
            Settlement::Acked { queue, .. } | Settlement::Nacked { queue, .. } => queue,
        }
    }

    pub fn body(&self) -> &[u8] {
        match self {
            Settlement::Acked { body, .. } | Settlement::Nacked { body, .. } => body,
        }
    }

    pub fn is_ack(&self) -> bool {
        matches!(self, Settlement::Acked { .. })
    }
}

struct MemoryQueue {
    durable: bool,
    exclusive: bool,
    sender: UnboundedSender<Delivery>,
    receiver: Option<UnboundedReceiver<Delivery>>,
}

struct Unacked {
    queue: String,
    delivery: Delivery,
}

#[derive(Default)]
struct MemoryState {
    exchanges: HashSet<String>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<(String, String, String)>,
    unacked: HashMap<u64, Unacked>,
    settlements: Vec<Settlement>,
    closed: bool,
    close_count: usize,
}

struct MemoryInner {
    state: Mutex<MemoryState>,
    next_tag: AtomicU64,
    requeue_on_nack: bool,
}

impl MemoryInner {
    fn lock(&self) -> TransportResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|poison_err| TransportError::OperationFailed {
                message: format!(
                    "Internal synchronisation error (mutex poisoned). PoisonError: {:?}",
                    poison_err
                ),
            })
    }

    fn track(self: &Arc<Self>, queue: &str, delivery: Delivery, auto_ack: bool) -> DeliveryEnvelope {
        let delivery_tag = self.next_tag.fetch_add(1, Ordering::Relaxed) + 1;
        if !auto_ack {
            if let Ok(mut state) = self.lock() {
                state.unacked.insert(
                    delivery_tag,
                    Unacked {
                        queue: queue.to_string(),
                        delivery: delivery.clone(),
                    },
                );
            }
        }
        let acker: Arc<dyn Acknowledger> = self.clone();
        DeliveryEnvelope::new(delivery, AckHandle::new(delivery_tag, acker))
    }
}

#[async_trait]
impl Acknowledger for MemoryInner {
    async fn ack(&self, delivery_tag: u64) -> TransportResult<()> {
        let mut state = self.lock()?;
        if state.closed {
            return Err(TransportError::ChannelClosed);
        }
        let unacked = state
            .unacked
            .remove(&delivery_tag)
            .ok_or(TransportError::UnknownDeliveryTag { delivery_tag })?;
        state.settlements.push(Settlement::Acked {
            delivery_tag,
            queue: unacked.queue,
            body: unacked.delivery.body,
        });
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> TransportResult<()> {
        let mut state = self.lock()?;
        if state.closed {
            return Err(TransportError::ChannelClosed);
        }
        let unacked = state
            .unacked
            .remove(&delivery_tag)
            .ok_or(TransportError::UnknownDeliveryTag { delivery_tag })?;
        state.settlements.push(Settlement::Nacked {
            delivery_tag,
            queue: unacked.queue.clone(),
            body: unacked.delivery.body.clone(),
            requeue,
        });

        if requeue && self.requeue_on_nack {
            if let Some(queue) = state.queues.get(&unacked.queue) {
                let mut delivery = unacked.delivery;
                delivery.redelivered = true;
                let _ = queue.sender.send(delivery);
            }
        }
        Ok(())
    }
}

/// In-memory broker channel
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Create a transport that redelivers messages nacked with requeue
    pub fn new() -> Self {
        Self::with_redelivery(true)
    }

    /// Create a transport, choosing whether requeued nacks are redelivered
    pub fn with_redelivery(requeue_on_nack: bool) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                state: Mutex::new(MemoryState::default()),
                next_tag: AtomicU64::new(0),
                requeue_on_nack,
            }),
        }
    }

    pub fn declare_exchange(&self, name: &str) -> TransportResult<()> {
        let mut state = self.inner.lock()?;
        if state.closed {
            return Err(TransportError::ChannelClosed);
        }
        state.exchanges.insert(name.to_string());
        Ok(())
    }

    /// Route a message through an exchange; the empty exchange routes by queue name
    ///
    /// Returns the number of queues the message was delivered to.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        delivery: Delivery,
    ) -> TransportResult<usize> {
        let state = self.inner.lock()?;
        if state.closed {
            return Err(TransportError::ChannelClosed);
        }

        let mut delivery = delivery;
        delivery.exchange = exchange.to_string();
        delivery.routing_key = routing_key.to_string();

        let targets: Vec<&str> = if exchange.is_empty() {
            vec![routing_key]
        } else {
            if !state.exchanges.contains(exchange) {
                return Err(TransportError::OperationFailed {
                    message: format!("no exchange '{}'", exchange),
                });
            }
            state
                .bindings
                .iter()
                .filter(|(ex, key, _)| ex == exchange && key == routing_key)
                .map(|(_, _, queue)| queue.as_str())
                .collect()
        };

        let mut routed = 0;
        for target in targets {
            if let Some(queue) = state.queues.get(target) {
                if queue.sender.send(delivery.clone()).is_ok() {
                    routed += 1;
                }
            }
        }
        Ok(routed)
    }

    /// Publish a plain body straight to a queue through the default exchange
    pub fn publish_to_queue(&self, queue: &str, body: impl Into<Vec<u8>>) -> TransportResult<usize> {
        self.publish("", queue, Delivery::new(body, queue))
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.inner
            .lock()
            .map(|state| state.settlements.clone())
            .unwrap_or_default()
    }

    pub fn unacked_count(&self) -> usize {
        self.inner
            .lock()
            .map(|state| state.unacked.len())
            .unwrap_or_default()
    }

    pub fn close_count(&self) -> usize {
        self.inner
            .lock()
            .map(|state| state.close_count)
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().map(|state| state.closed).unwrap_or(true)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        exclusive: bool,
    ) -> TransportResult<QueueHandle> {
        let mut state = self.inner.lock()?;
        if state.closed {
            return Err(TransportError::ChannelClosed);
        }
        if name.is_empty() {
            return Err(TransportError::QueueDeclare {
                queue: name.to_string(),
                message: "queue name must not be empty".to_string(),
            });
        }

        if let Some(existing) = state.queues.get(name) {
            if existing.durable != durable || existing.exclusive != exclusive {
                return Err(TransportError::QueueDeclare {
                    queue: name.to_string(),
                    message: "inequivalent arguments for existing queue".to_string(),
                });
            }
            return Ok(QueueHandle {
                name: name.to_string(),
                message_count: 0,
                consumer_count: usize::from(existing.receiver.is_none()),
            });
        }

        let (sender, receiver) = unbounded_channel();
        state.queues.insert(
            name.to_string(),
            MemoryQueue {
                durable,
                exclusive,
                sender,
                receiver: Some(receiver),
            },
        );
        Ok(QueueHandle {
            name: name.to_string(),
            message_count: 0,
            consumer_count: 0,
        })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
    ) -> TransportResult<()> {
        let mut state = self.inner.lock()?;
        let bind_error = |message: &str| TransportError::QueueBind {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            message: message.to_string(),
        };
        if state.closed {
            return Err(TransportError::ChannelClosed);
        }
        if !state.exchanges.contains(exchange) {
            return Err(bind_error("exchange not found"));
        }
        if !state.queues.contains_key(queue) {
            return Err(bind_error("queue not found"));
        }

        let binding = (exchange.to_string(), routing_key.to_string(), queue.to_string());
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> TransportResult<DeliveryStream> {
        let receiver = {
            let mut state = self.inner.lock()?;
            if state.closed {
                return Err(TransportError::ChannelClosed);
            }
            let entry = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| TransportError::Consume {
                    queue: queue.to_string(),
                    message: "queue not found".to_string(),
                })?;
            entry.receiver.take().ok_or_else(|| TransportError::Consume {
                queue: queue.to_string(),
                message: "queue already has a consumer".to_string(),
            })?
        };
        log::trace!("memory transport: consumer '{}' attached to '{}'", consumer_tag, queue);

        let inner = self.inner.clone();
        let queue = queue.to_string();
        let stream = stream::unfold(receiver, move |mut receiver| {
            let inner = inner.clone();
            let queue = queue.clone();
            async move {
                let delivery = receiver.recv().await?;
                Some((inner.track(&queue, delivery, auto_ack), receiver))
            }
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> TransportResult<()> {
        let mut state = self.inner.lock()?;
        state.close_count += 1;
        if state.closed {
            return Err(TransportError::ChannelClosed);
        }
        state.closed = true;
        // Dropping the senders ends every delivery stream
        state.queues.clear();
        state.unacked.clear();
        Ok(())
    }
}
