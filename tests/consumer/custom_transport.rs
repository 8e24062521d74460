//! Tests with a transport implemented outside the crate

use crate::common::{shutdown_and_join, wait_until};
use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use mqworker::broker::api::{
    AckHandle, Acknowledger, ConsumerEngine, Delivery, DeliveryEnvelope, DeliveryStream,
    EngineError, EventContext, HandlerGroup, HandlerOptions, HandlerResult, QueueHandle,
    Transport, TransportError, TransportResult,
};
use mqworker::core::config::EngineConfig;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Broker calls in the order they were made
#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Declare(String, bool, bool),
    Bind(String, String, String),
    Consume(String, String, bool),
    Ack(u64),
    Nack(u64, bool),
    Close,
}

#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<Call>>,
}

impl Recorder {
    fn push(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Acknowledger for Recorder {
    async fn ack(&self, delivery_tag: u64) -> TransportResult<()> {
        self.push(Call::Ack(delivery_tag));
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> TransportResult<()> {
        self.push(Call::Nack(delivery_tag, requeue));
        Ok(())
    }
}

/// Transport whose queues are fed directly by the test
struct ScriptedTransport {
    recorder: Arc<Recorder>,
    senders: Mutex<HashMap<String, UnboundedSender<DeliveryEnvelope>>>,
    next_tag: AtomicU64,
    fail_consume: Option<String>,
    fail_close: bool,
}

impl ScriptedTransport {
    fn new() -> Self {
        Self {
            recorder: Arc::new(Recorder::default()),
            senders: Mutex::new(HashMap::new()),
            next_tag: AtomicU64::new(100),
            fail_consume: None,
            fail_close: false,
        }
    }

    fn deliver(&self, queue: &str, body: &str) -> u64 {
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        let acker: Arc<dyn Acknowledger> = self.recorder.clone();
        let envelope = DeliveryEnvelope::new(Delivery::new(body, queue), AckHandle::new(tag, acker));
        self.senders.lock().unwrap()[queue].send(envelope).unwrap();
        tag
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        exclusive: bool,
    ) -> TransportResult<QueueHandle> {
        self.recorder
            .push(Call::Declare(name.to_string(), durable, exclusive));
        Ok(QueueHandle {
            name: name.to_string(),
            message_count: 0,
            consumer_count: 0,
        })
    }

    async fn bind_queue(&self, queue: &str, routing_key: &str, exchange: &str) -> TransportResult<()> {
        self.recorder.push(Call::Bind(
            queue.to_string(),
            routing_key.to_string(),
            exchange.to_string(),
        ));
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> TransportResult<DeliveryStream> {
        self.recorder
            .push(Call::Consume(queue.to_string(), consumer_tag.to_string(), auto_ack));
        if self.fail_consume.as_deref() == Some(queue) {
            return Err(TransportError::Consume {
                queue: queue.to_string(),
                message: "access refused".to_string(),
            });
        }
        let (sender, receiver) = unbounded_channel();
        self.senders.lock().unwrap().insert(queue.to_string(), sender);
        Ok(receiver_stream(receiver).boxed())
    }

    async fn close(&self) -> TransportResult<()> {
        self.recorder.push(Call::Close);
        self.senders.lock().unwrap().clear();
        if self.fail_close {
            return Err(TransportError::OperationFailed {
                message: "connection reset".to_string(),
            });
        }
        Ok(())
    }
}

fn receiver_stream<T: Send + 'static>(
    receiver: UnboundedReceiver<T>,
) -> impl Stream<Item = T> + Send + 'static {
    stream::unfold(receiver, |mut receiver| async move {
        let item = receiver.recv().await?;
        Some((item, receiver))
    })
}

async fn accept_all(_ctx: EventContext) -> HandlerResult {
    Ok(())
}

#[tokio::test]
async fn test_setup_calls_follow_registration() {
    let transport = Arc::new(ScriptedTransport::new());
    let mut handlers = HandlerGroup::new();
    handlers
        .add_handler(accept_all, HandlerOptions::new("orders"))
        .add_handler(
            accept_all,
            HandlerOptions::new("audit")
                .exchange("events")
                .routing_key("audit.*")
                .durable(false)
                .exclusive(true)
                .auto_ack(true),
        );

    let engine = ConsumerEngine::new("svc", transport.clone(), EngineConfig::default(), handlers)
        .await
        .unwrap();
    let shutdown = engine.shutdown_handle();
    let running = tokio::spawn(engine.start());
    shutdown_and_join(&shutdown, running).await;

    assert_eq!(
        transport.recorder.calls(),
        vec![
            Call::Declare("orders".to_string(), true, false),
            Call::Consume("orders".to_string(), "orders".to_string(), false),
            Call::Declare("audit".to_string(), false, true),
            Call::Bind(
                "audit".to_string(),
                "audit.*".to_string(),
                "events".to_string()
            ),
            Call::Consume("audit".to_string(), "audit".to_string(), true),
            Call::Close,
        ]
    );
}

#[tokio::test]
async fn test_settlements_use_delivery_tags() {
    let transport = Arc::new(ScriptedTransport::new());
    let mut handlers = HandlerGroup::new();
    handlers.add_handler(
        |ctx: EventContext| async move {
            if ctx.message() == b"reject" {
                return Err("rejected".into());
            }
            HandlerResult::Ok(())
        },
        HandlerOptions::new("orders"),
    );

    let engine = ConsumerEngine::new("svc", transport.clone(), EngineConfig::default(), handlers)
        .await
        .unwrap();
    let shutdown = engine.shutdown_handle();
    let running = tokio::spawn(engine.start());

    let ok_tag = transport.deliver("orders", "accept");
    let bad_tag = transport.deliver("orders", "reject");
    wait_until(|| {
        let calls = transport.recorder.calls();
        calls.contains(&Call::Ack(ok_tag)) && calls.contains(&Call::Nack(bad_tag, true))
    })
    .await;
    let stats = shutdown_and_join(&shutdown, running).await;

    assert_eq!(stats.acked, 1);
    assert_eq!(stats.nacked, 1);
}

#[tokio::test]
async fn test_consume_failure_aborts_setup() {
    let mut transport = ScriptedTransport::new();
    transport.fail_consume = Some("payments".to_string());
    let transport = Arc::new(transport);

    let mut handlers = HandlerGroup::new();
    handlers
        .add_handler(accept_all, HandlerOptions::new("orders"))
        .add_handler(accept_all, HandlerOptions::new("payments"))
        .add_handler(accept_all, HandlerOptions::new("refunds"));

    let result = ConsumerEngine::new("svc", transport.clone(), EngineConfig::default(), handlers).await;

    assert!(matches!(
        result,
        Err(EngineError::Setup { ref queue, source: TransportError::Consume { .. } }) if queue == "payments"
    ));
    let calls = transport.recorder.calls();
    assert!(!calls.contains(&Call::Declare("refunds".to_string(), true, false)));
    assert!(!calls.contains(&Call::Close));
}

#[tokio::test]
async fn test_close_error_is_returned_after_stop() {
    let mut transport = ScriptedTransport::new();
    transport.fail_close = true;
    let transport = Arc::new(transport);

    let engine = ConsumerEngine::new(
        "svc",
        transport.clone(),
        EngineConfig::default(),
        HandlerGroup::new(),
    )
    .await
    .unwrap();
    let shutdown = engine.shutdown_handle();
    let running = tokio::spawn(engine.start());
    shutdown.request_shutdown();

    let result = running.await.unwrap();
    assert!(matches!(result, Err(EngineError::Transport(_))));
    assert_eq!(
        shutdown.state(),
        mqworker::broker::api::EngineState::Stopped
    );
    assert_eq!(
        transport
            .recorder
            .calls()
            .iter()
            .filter(|c| **c == Call::Close)
            .count(),
        1
    );
}
