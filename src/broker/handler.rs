//! Handler registration
//!
//! Handlers are registered into a [`HandlerGroup`] before the engine is built.
//! Each registration names the queue it consumes and how deliveries from that
//! queue are acknowledged. The group is turned into the engine's read-only
//! registry during setup.

use crate::broker::error::{EngineError, EngineResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Error type returned by message handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result type returned by message handlers
pub type HandlerResult = Result<(), HandlerError>;

/// Processing function for one queue
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: EventContext) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(EventContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, ctx: EventContext) -> HandlerResult {
        (self)(ctx).await
    }
}

/// How deliveries are settled with the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// The broker considers the message handled on delivery
    Auto,
    /// The engine acks on success and nacks with requeue on failure
    Manual,
}

impl AckMode {
    pub fn is_auto(self) -> bool {
        self == AckMode::Auto
    }
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckMode::Auto => write!(f, "auto"),
            AckMode::Manual => write!(f, "manual"),
        }
    }
}

/// Registration options for one handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerOptions {
    pub exchange: String,
    pub queue: String,
    pub routing_key: Option<String>,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_ack: bool,
    pub max_concurrent: Option<usize>,
}

impl HandlerOptions {
    /// Options for a durable, non-exclusive, manually acknowledged queue
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            exchange: String::new(),
            queue: queue.into(),
            routing_key: None,
            durable: true,
            exclusive: false,
            auto_ack: false,
            max_concurrent: None,
        }
    }

    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    /// Routing key used for the binding; defaults to the queue name
    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    /// Per-queue concurrency limit, overriding the engine default
    pub fn max_concurrent(mut self, limit: usize) -> Self {
        self.max_concurrent = Some(limit);
        self
    }
}

/// Immutable binding of one queue, resolved at engine construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub ack_mode: AckMode,
    pub concurrency_limit: usize,
    pub durable: bool,
    pub exclusive: bool,
}

impl QueueBinding {
    pub(crate) fn resolve(options: &HandlerOptions, default_limit: usize) -> Self {
        Self {
            exchange: options.exchange.clone(),
            queue: options.queue.clone(),
            routing_key: options
                .routing_key
                .clone()
                .unwrap_or_else(|| options.queue.clone()),
            ack_mode: if options.auto_ack {
                AckMode::Auto
            } else {
                AckMode::Manual
            },
            concurrency_limit: options.max_concurrent.unwrap_or(default_limit),
            durable: options.durable,
            exclusive: options.exclusive,
        }
    }
}

/// Registry entry: the processing function for one queue
#[derive(Clone)]
pub struct HandlerEntry {
    pub routing_key: String,
    pub handler: Arc<dyn MessageHandler>,
    pub ack_mode: AckMode,
}

impl fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("routing_key", &self.routing_key)
            .field("ack_mode", &self.ack_mode)
            .finish_non_exhaustive()
    }
}

pub(crate) struct Registration {
    pub options: HandlerOptions,
    pub handler: Arc<dyn MessageHandler>,
}

/// Group of handlers collected before the engine starts
#[derive(Default)]
pub struct HandlerGroup {
    registrations: Vec<Registration>,
}

impl HandlerGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for the queue named in `options`
    pub fn add_handler<H>(&mut self, handler: H, options: HandlerOptions) -> &mut Self
    where
        H: MessageHandler + 'static,
    {
        self.registrations.push(Registration {
            options,
            handler: Arc::new(handler),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn queues(&self) -> impl Iterator<Item = &str> {
        self.registrations.iter().map(|r| r.options.queue.as_str())
    }

    /// Check registrations before any broker call is made
    pub(crate) fn into_validated(self) -> EngineResult<Vec<Registration>> {
        let mut seen = HashSet::new();
        for registration in &self.registrations {
            let queue = &registration.options.queue;
            if queue.is_empty() {
                return Err(EngineError::InvalidRegistration {
                    message: "handler registered without a queue name".to_string(),
                });
            }
            if registration.options.max_concurrent == Some(0) {
                return Err(EngineError::InvalidRegistration {
                    message: format!("queue '{}' has a concurrency limit of 0", queue),
                });
            }
            if !seen.insert(queue.clone()) {
                return Err(EngineError::DuplicateQueue {
                    queue: queue.clone(),
                });
            }
        }
        Ok(self.registrations)
    }
}

/// Context handed to a handler for one delivery
#[derive(Debug, Clone)]
pub struct EventContext {
    worker_type: String,
    queue: String,
    handler_route: String,
    key: String,
    request_id: String,
    header: HashMap<String, String>,
    redelivered: bool,
    body: Vec<u8>,
}

impl EventContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        worker_type: &str,
        queue: &str,
        handler_route: String,
        key: String,
        request_id: String,
        header: HashMap<String, String>,
        redelivered: bool,
        body: Vec<u8>,
    ) -> Self {
        Self {
            worker_type: worker_type.to_string(),
            queue: queue.to_string(),
            handler_route,
            key,
            request_id,
            header,
            redelivered,
            body,
        }
    }

    pub fn worker_type(&self) -> &str {
        &self.worker_type
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Routing key the message arrived with
    pub fn handler_route(&self) -> &str {
        &self.handler_route
    }

    /// Exchange the message was published to
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Correlation id shared with the log record and tracing span
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn header(&self) -> &HashMap<String, String> {
        &self.header
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn message(&self) -> &[u8] {
        &self.body
    }

    pub fn message_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.body)
    }

    /// Decode a JSON payload
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}
