//! Message processor
//!
//! Runs one handler invocation for one delivery and settles it. Each invocation
//! gets a correlation id, a tracing span and a structured [`ConsumeRecord`] that
//! is written to the log when processing finishes. Handler errors and panics
//! are contained here and only influence the acknowledgment decision and the
//! observability output.

use crate::broker::delivery::DeliveryEnvelope;
use crate::broker::error::HandlerFailure;
use crate::broker::handler::{AckMode, EventContext, HandlerEntry, QueueBinding};
use crate::broker::stats::ConsumerStatistics;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

/// Headers checked, in order, for an inbound correlation id
pub const REQUEST_ID_HEADERS: [&str; 2] = ["x-request-id", "request_id"];

/// Log target of the per-message record
pub const RECORD_TARGET: &str = "mqworker::consume";

const REQUEST_METHOD: &str = "CONSUME";
const STATUS_OK: u16 = 200;
const STATUS_FAILED: u16 = 500;

/// How the delivery was settled with the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckOutcome {
    /// Settled by the broker on delivery
    Auto,
    Acked,
    /// Negatively acknowledged with requeue
    Requeued,
    /// The ack or nack call itself failed
    SettleFailed,
}

/// Structured log record for one consumed message
#[derive(Debug, Clone, Serialize)]
pub struct ConsumeRecord {
    pub request_id: String,
    #[serde(rename = "type")]
    pub worker_type: String,
    pub time_start: DateTime<Utc>,
    pub service: String,
    pub endpoint: String,
    pub request_method: String,
    pub request_header: String,
    pub request_body: String,
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub ack: Option<AckOutcome>,
    pub exec_time: f64,
}

impl ConsumeRecord {
    /// Level the record is logged at, derived from its status code
    pub fn level(&self) -> log::Level {
        match self.status_code {
            200..=399 => log::Level::Info,
            400..=499 => log::Level::Warn,
            _ => log::Level::Error,
        }
    }

    fn write(&self) {
        match serde_json::to_string(self) {
            Ok(json) => log::log!(target: RECORD_TARGET, self.level(), "{}", json),
            Err(e) => log::log!(target: RECORD_TARGET, self.level(), "{:?} (serialization failed: {})", self, e),
        }
    }
}

/// Result of processing one delivery
#[derive(Debug)]
pub struct ProcessOutcome {
    pub result: Result<(), HandlerFailure>,
    pub ack: AckOutcome,
    pub record: ConsumeRecord,
}

impl ProcessOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Executes handlers and applies the acknowledgment policy
#[derive(Debug, Clone)]
pub struct MessageProcessor {
    service_name: String,
    worker_type: String,
    debug_mode: bool,
    stats: Arc<ConsumerStatistics>,
}

impl MessageProcessor {
    pub fn new(
        service_name: impl Into<String>,
        worker_type: impl Into<String>,
        debug_mode: bool,
        stats: Arc<ConsumerStatistics>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            worker_type: worker_type.into(),
            debug_mode,
            stats,
        }
    }

    pub async fn process(
        &self,
        binding: &QueueBinding,
        entry: &HandlerEntry,
        envelope: DeliveryEnvelope,
    ) -> ProcessOutcome {
        let started = Instant::now();
        let (delivery, handle) = envelope.into_parts();

        let request_id = correlation_id(&delivery.headers);
        let headers: BTreeMap<&str, &str> = delivery
            .headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let span = tracing::info_span!(
            "broker_consume",
            queue = %binding.queue,
            exchange = %delivery.exchange,
            routing_key = %delivery.routing_key,
            request_id = %request_id,
            headers = ?headers,
            status = tracing::field::Empty,
            error = tracing::field::Empty,
        );

        let mut record = ConsumeRecord {
            request_id: request_id.clone(),
            worker_type: self.worker_type.clone(),
            time_start: Utc::now(),
            service: self.service_name.clone(),
            endpoint: format!("queue: {}", binding.queue),
            request_method: REQUEST_METHOD.to_string(),
            request_header: format!(
                "Exchange: {} | Routing Key: {} | Header: {:?}",
                delivery.exchange, delivery.routing_key, headers
            ),
            request_body: String::from_utf8_lossy(&delivery.body).into_owned(),
            status_code: STATUS_OK,
            response: None,
            error_message: None,
            ack: None,
            exec_time: 0.0,
        };

        if self.debug_mode {
            log::info!(
                "broker consumer: message consumed from '{}', routing key = {}",
                binding.queue,
                delivery.routing_key
            );
        } else {
            log::debug!(
                "broker consumer: message consumed from '{}', routing key = {}",
                binding.queue,
                delivery.routing_key
            );
        }

        let ctx = EventContext::new(
            &self.worker_type,
            &binding.queue,
            delivery.routing_key.clone(),
            delivery.exchange.clone(),
            request_id.clone(),
            delivery.headers.clone(),
            delivery.redelivered,
            delivery.body,
        );

        let invocation = AssertUnwindSafe(entry.handler.handle(ctx))
            .catch_unwind()
            .instrument(span.clone());
        let result = match invocation.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(HandlerFailure::Failed(e)),
            Err(payload) => Err(HandlerFailure::Panicked {
                message: panic_message(payload.as_ref()),
            }),
        };

        match &result {
            Ok(()) => self.stats.record_succeeded(),
            Err(failure) => {
                self.stats.record_failed(failure.is_panic());
                log::error!(
                    "broker consumer: handler for queue '{}' failed (request_id={}, routing_key={}): {}",
                    binding.queue,
                    request_id,
                    delivery.routing_key,
                    failure
                );
            }
        }

        let ack = match entry.ack_mode {
            AckMode::Auto => AckOutcome::Auto,
            AckMode::Manual => {
                let delivery_tag = handle.delivery_tag();
                let settled = if result.is_ok() {
                    handle.ack().await.map(|_| AckOutcome::Acked)
                } else {
                    handle.nack(true).await.map(|_| AckOutcome::Requeued)
                };
                match settled {
                    Ok(outcome) => {
                        if outcome == AckOutcome::Acked {
                            self.stats.record_acked();
                        } else {
                            self.stats.record_nacked();
                        }
                        outcome
                    }
                    Err(e) => {
                        self.stats.record_settle_error();
                        log::warn!(
                            "broker consumer: failed to settle delivery {} on queue '{}' (request_id={}): {}",
                            delivery_tag,
                            binding.queue,
                            request_id,
                            e
                        );
                        AckOutcome::SettleFailed
                    }
                }
            }
        };

        let elapsed = started.elapsed();
        let status = match &result {
            Ok(()) => {
                record.response = Some("success".to_string());
                "success"
            }
            Err(failure) => {
                record.status_code = STATUS_FAILED;
                record.error_message = Some(failure.to_string());
                span.record("error", tracing::field::display(failure));
                "error"
            }
        };
        record.ack = Some(ack);
        record.exec_time = elapsed.as_secs_f64();
        span.record("status", record.status_code);
        drop(span);

        metrics::counter!(
            "mqworker_messages_total",
            "status" => status,
            "queue" => binding.queue.clone(),
            "service" => self.service_name.clone()
        )
        .increment(1);
        metrics::histogram!(
            "mqworker_processing_seconds",
            "status" => status,
            "queue" => binding.queue.clone(),
            "service" => self.service_name.clone()
        )
        .record(elapsed.as_secs_f64());

        record.write();

        ProcessOutcome {
            result,
            ack,
            record,
        }
    }
}

/// Correlation id from the inbound headers, or a fresh UUID
pub fn correlation_id(headers: &HashMap<String, String>) -> String {
    REQUEST_ID_HEADERS
        .iter()
        .filter_map(|name| headers.get(*name))
        .find(|value| !value.is_empty())
        .cloned()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
