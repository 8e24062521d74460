//! End-to-end consumer scenarios on the in-memory transport

use crate::common::{shutdown_and_join, wait_until};
use mqworker::broker::api::{
    ConsumerEngine, Delivery, EventContext, HandlerGroup, HandlerOptions, HandlerResult,
    MemoryTransport, Settlement,
};
use mqworker::core::config::EngineConfig;
use serde::Deserialize;
use std::sync::{Arc, Mutex};

#[derive(Debug, Deserialize)]
struct OrderCreated {
    id: u32,
    amount: u64,
}

#[tokio::test]
async fn test_order_service_processes_json_events() {
    let transport = MemoryTransport::with_redelivery(false);
    transport.declare_exchange("shop").unwrap();
    let totals = Arc::new(Mutex::new(Vec::new()));

    let mut handlers = HandlerGroup::new();
    let sink = totals.clone();
    handlers.add_handler(
        move |ctx: EventContext| {
            let sink = sink.clone();
            async move {
                let order: OrderCreated = ctx.deserialize()?;
                sink.lock().unwrap().push((order.id, order.amount, ctx.request_id().to_string()));
                HandlerResult::Ok(())
            }
        },
        HandlerOptions::new("order-created")
            .exchange("shop")
            .routing_key("order.created")
            .max_concurrent(2),
    );

    let engine = ConsumerEngine::new(
        "order-service",
        Arc::new(transport.clone()),
        EngineConfig::default(),
        handlers,
    )
    .await
    .unwrap();
    let shutdown = engine.shutdown_handle();

    let publish = |body: &str, request_id: Option<&str>| {
        let mut delivery = Delivery::new(body, "");
        if let Some(id) = request_id {
            delivery = delivery.with_header("x-request-id", id);
        }
        transport.publish("shop", "order.created", delivery).unwrap()
    };
    assert_eq!(publish(r#"{"id": 1, "amount": 250}"#, Some("req-1")), 1);
    assert_eq!(publish(r#"{"id": 2, "amount": 99}"#, None), 1);
    assert_eq!(publish("not json", Some("req-3")), 1);

    let running = tokio::spawn(engine.start());
    wait_until(|| transport.settlements().len() == 3).await;
    let stats = shutdown_and_join(&shutdown, running).await;

    let mut totals = totals.lock().unwrap().clone();
    totals.sort();
    assert_eq!(totals.len(), 2);
    assert_eq!((totals[0].0, totals[0].1, totals[0].2.as_str()), (1, 250, "req-1"));
    assert_eq!(totals[1].0, 2);
    assert!(!totals[1].2.is_empty(), "generated correlation id expected");

    let rejected: Vec<_> = transport
        .settlements()
        .into_iter()
        .filter(|s| matches!(s, Settlement::Nacked { .. }))
        .collect();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].body(), b"not json");
    assert_eq!(stats.succeeded, 2);
    assert_eq!(stats.failed, 1);
    assert!(transport.is_closed());
}

#[tokio::test]
async fn test_idle_queue_does_not_delay_busy_queue() {
    let transport = MemoryTransport::new();
    let mut handlers = HandlerGroup::new();
    handlers
        .add_handler(
            |_ctx: EventContext| async { HandlerResult::Ok(()) },
            HandlerOptions::new("idle"),
        )
        .add_handler(
            |_ctx: EventContext| async { HandlerResult::Ok(()) },
            HandlerOptions::new("busy").max_concurrent(3),
        );

    let engine = ConsumerEngine::new(
        "svc",
        Arc::new(transport.clone()),
        EngineConfig::default(),
        handlers,
    )
    .await
    .unwrap();
    let shutdown = engine.shutdown_handle();
    let running = tokio::spawn(engine.start());

    for i in 0..50 {
        transport.publish_to_queue("busy", format!("job-{}", i)).unwrap();
    }
    wait_until(|| transport.settlements().len() == 50).await;
    let stats = shutdown_and_join(&shutdown, running).await;

    assert!(transport.settlements().iter().all(|s| s.queue() == "busy" && s.is_ack()));
    assert_eq!(stats.dispatched, 50);
}

#[tokio::test]
async fn test_messages_published_after_shutdown_are_not_consumed() {
    let transport = MemoryTransport::new();
    let mut handlers = HandlerGroup::new();
    handlers.add_handler(
        |_ctx: EventContext| async { HandlerResult::Ok(()) },
        HandlerOptions::new("orders"),
    );

    let engine = ConsumerEngine::new(
        "svc",
        Arc::new(transport.clone()),
        EngineConfig::default(),
        handlers,
    )
    .await
    .unwrap();
    let shutdown = engine.shutdown_handle();
    let running = tokio::spawn(engine.start());

    transport.publish_to_queue("orders", "before").unwrap();
    wait_until(|| transport.settlements().len() == 1).await;
    let stats = shutdown_and_join(&shutdown, running).await;

    assert!(transport.publish_to_queue("orders", "after").is_err());
    assert_eq!(stats.dispatched, 1);
    assert_eq!(transport.close_count(), 1);
}
