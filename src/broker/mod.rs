//! Multi-Queue Broker Consumer
//!
//! Consumes a runtime-registered set of broker queues through one dispatch
//! loop, bounds concurrent processing per queue, and drains in-flight work on
//! shutdown.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────┐  ┌──────────┐  ┌──────────┐
//!  │ stream 0 │  │ stream 1 │  │ stream N │   delivery streams (transport)
//!  └────┬─────┘  └────┬─────┘  └────┬─────┘
//!    gate 0        gate 1        gate N        admission gates (per queue)
//!       └─────────────┼─────────────┘
//!                     ▼
//!          ┌─────────────────────┐
//!          │     Multiplexer     │◀── shutdown signal
//!          └──────────┬──────────┘
//!                     │ spawn (queue slot travels with the task,
//!                     │        which then draws the shared ceiling)
//!          ┌──────────┼──────────┐
//!          ▼          ▼          ▼
//!      processor  processor  processor   handler + ack/nack + log record
//! ```
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use mqworker::broker::api::{
//!     ConsumerEngine, EventContext, HandlerGroup, HandlerOptions, HandlerResult, MemoryTransport,
//! };
//! use mqworker::core::config::EngineConfig;
//! use std::sync::Arc;
//!
//! async fn on_order(ctx: EventContext) -> HandlerResult {
//!     println!("order: {}", ctx.message_str()?);
//!     Ok(())
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(MemoryTransport::new());
//! let mut handlers = HandlerGroup::new();
//! handlers.add_handler(on_order, HandlerOptions::new("orders").max_concurrent(2));
//!
//! let engine = ConsumerEngine::new("order-service", transport, EngineConfig::default(), handlers).await?;
//! let shutdown = engine.shutdown_handle();
//! let running = tokio::spawn(engine.start());
//!
//! shutdown.request_shutdown();
//! let stats = running.await??;
//! println!("processed {} message(s)", stats.succeeded + stats.failed);
//! # Ok(())
//! # }
//! ```

mod delivery;
mod engine;
mod error;
mod gate;
mod handler;
mod memory;
mod multiplexer;
mod processor;
mod stats;
mod transport;

// Public API module - the supported import path for the consumer
pub mod api;

#[cfg(test)]
mod tests;
