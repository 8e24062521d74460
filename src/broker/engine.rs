//! Consumer engine
//!
//! Owns the registry, the admission gates and the delivery streams of every
//! registered queue, runs the dispatch loop, and drains in-flight work on
//! shutdown before closing the transport.

use crate::broker::delivery::{DeliveryEnvelope, DeliveryStream};
use crate::broker::error::{EngineError, EngineResult};
use crate::broker::gate::AdmissionGate;
use crate::broker::handler::{AckMode, HandlerEntry, HandlerGroup, QueueBinding};
use crate::broker::multiplexer::{Multiplexer, Ready};
use crate::broker::processor::MessageProcessor;
use crate::broker::stats::{ConsumerStatistics, EngineStats};
use crate::broker::transport::Transport;
use crate::core::config::EngineConfig;
use crate::core::shutdown::{EngineState, ShutdownCoordinator, ShutdownSignal};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

/// Worker type reported in handler contexts and log records
pub const WORKER_TYPE: &str = "broker";

/// Everything the engine knows about one registered queue
#[derive(Debug)]
struct QueueSlot {
    binding: QueueBinding,
    entry: HandlerEntry,
    gate: AdmissionGate,
}

/// Multi-queue consumer
///
/// Built with [`ConsumerEngine::new`], which performs all broker setup, and run
/// with [`ConsumerEngine::start`], which returns once the engine has stopped.
pub struct ConsumerEngine {
    transport: Arc<dyn Transport>,
    service_name: String,
    debug_mode: bool,
    slots: Arc<Vec<QueueSlot>>,
    streams: Vec<DeliveryStream>,
    coordinator: Arc<ShutdownCoordinator>,
    shutdown_rx: broadcast::Receiver<ShutdownSignal>,
    stats: Arc<ConsumerStatistics>,
}

impl ConsumerEngine {
    /// Declare, bind and start consuming every registered queue
    ///
    /// `owner` is the owning service's name, used when the configuration does
    /// not name a service. Any setup failure aborts construction before a single
    /// message is consumed; closing the transport is then left to the caller.
    pub async fn new(
        owner: &str,
        transport: Arc<dyn Transport>,
        config: EngineConfig,
        handlers: HandlerGroup,
    ) -> EngineResult<Self> {
        config.validate()?;
        let registrations = handlers.into_validated()?;
        let global = config
            .max_in_flight
            .map(|limit| Arc::new(Semaphore::new(limit)));

        let mut slots = Vec::with_capacity(registrations.len());
        let mut streams = Vec::with_capacity(registrations.len());
        for registration in registrations {
            let binding =
                QueueBinding::resolve(&registration.options, config.max_concurrent_per_queue);
            let stream = setup_queue(transport.as_ref(), &binding).await?;

            log::info!(
                "[BROKER-CONSUMER] (exchange): {:<15} (queue): {:<15} (limit): {}",
                format!("\"{}\"", binding.exchange),
                format!("\"{}\"", binding.queue),
                binding.concurrency_limit
            );

            let mut gate = AdmissionGate::new(binding.queue.clone(), binding.concurrency_limit);
            if let Some(global) = &global {
                gate = gate.with_global_limit(global.clone());
            }
            let entry = HandlerEntry {
                routing_key: binding.routing_key.clone(),
                handler: registration.handler,
                ack_mode: binding.ack_mode,
            };
            slots.push(QueueSlot {
                binding,
                entry,
                gate,
            });
            streams.push(stream);
        }
        log::info!("Broker consumer running with {} queue(s)", slots.len());

        let (coordinator, shutdown_rx) = ShutdownCoordinator::new();
        Ok(Self {
            transport,
            service_name: config.resolve_service_name(owner),
            debug_mode: config.debug_mode,
            slots: Arc::new(slots),
            streams,
            coordinator: Arc::new(coordinator),
            shutdown_rx,
            stats: Arc::new(ConsumerStatistics::new()),
        })
    }

    /// Handle for requesting shutdown from other tasks
    pub fn shutdown_handle(&self) -> Arc<ShutdownCoordinator> {
        self.coordinator.clone()
    }

    /// Live counters, shared with the running engine
    pub fn statistics(&self) -> Arc<ConsumerStatistics> {
        self.stats.clone()
    }

    pub fn state(&self) -> EngineState {
        self.coordinator.state()
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn bindings(&self) -> impl Iterator<Item = &QueueBinding> {
        self.slots.iter().map(|slot| &slot.binding)
    }

    /// Queue slots currently held for `queue`
    ///
    /// While running this includes the slot reserved by the waiting delivery
    /// source.
    pub fn in_flight(&self, queue: &str) -> Option<usize> {
        self.slots
            .iter()
            .find(|slot| slot.binding.queue == queue)
            .map(|slot| slot.gate.held())
    }

    /// Serve until shutdown, drain in-flight work, close the transport
    pub async fn start(self) -> EngineResult<EngineStats> {
        let ConsumerEngine {
            transport,
            service_name,
            debug_mode,
            slots,
            streams,
            coordinator,
            mut shutdown_rx,
            stats,
        } = self;

        if coordinator.mark_running() {
            log::debug!("Broker consumer '{}' serving {} queue(s)", service_name, slots.len());
        }

        let processor = Arc::new(MessageProcessor::new(
            service_name,
            WORKER_TYPE,
            debug_mode,
            stats.clone(),
        ));
        let mut mux = Multiplexer::new(
            slots
                .iter()
                .map(|slot| slot.gate.clone())
                .zip(streams)
                .collect(),
        );
        let mut inflight: JoinSet<()> = JoinSet::new();

        while !coordinator.is_shutdown_requested() {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => break,

                Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                    report_join(joined);
                }

                ready = mux.next_ready(), if !mux.is_exhausted() => match ready {
                    Some(Ready::Message { index, reservation, envelope }) => {
                        if coordinator.is_shutdown_requested() {
                            drop(reservation);
                            reject_undispatched(&slots[index], envelope, &stats).await;
                        } else {
                            let slots = slots.clone();
                            let processor = processor.clone();
                            let stats = stats.clone();
                            inflight.spawn(async move {
                                let slot = &slots[index];
                                // Shared in-flight ceiling
                                match reservation.admit().await {
                                    Ok(_permit) => {
                                        stats.record_dispatched();
                                        processor.process(&slot.binding, &slot.entry, envelope).await;
                                    }
                                    Err(_) => reject_undispatched(slot, envelope, &stats).await,
                                }
                            });
                        }
                    }
                    Some(Ready::Closed { index }) => {
                        log::warn!(
                            "Broker consumer: delivery stream for queue '{}' closed",
                            slots[index].binding.queue
                        );
                        if mux.is_exhausted() {
                            log::warn!("Broker consumer: all delivery streams closed; waiting for shutdown");
                        }
                    }
                    None => {}
                },
            }
        }

        // Nothing is pulled from here on
        drop(mux);

        let mut forced = coordinator.is_forced();
        let running_jobs = stats.in_progress();
        if running_jobs != 0 && !forced {
            log::info!("Broker consumer: waiting {} job(s) until done...", running_jobs);
        }

        let mut signals_open = true;
        while !forced {
            tokio::select! {
                biased;

                signal = shutdown_rx.recv(), if signals_open => match signal {
                    Ok(_) | Err(RecvError::Lagged(_)) => forced = coordinator.is_forced(),
                    Err(RecvError::Closed) => signals_open = false,
                },

                joined = inflight.join_next() => match joined {
                    Some(joined) => report_join(joined),
                    None => break,
                },
            }
        }

        if forced && !inflight.is_empty() {
            log::warn!(
                "Broker consumer: forced shutdown, abandoning {} in-flight job(s)",
                inflight.len()
            );
            inflight.detach_all();
        }

        log::info!("Stopping broker consumer");
        let closed = transport.close().await;
        coordinator.mark_stopped();
        closed?;

        Ok(stats.snapshot())
    }
}

async fn setup_queue(transport: &dyn Transport, binding: &QueueBinding) -> EngineResult<DeliveryStream> {
    let setup = |source| EngineError::Setup {
        queue: binding.queue.clone(),
        source,
    };

    let declared = transport
        .declare_queue(&binding.queue, binding.durable, binding.exclusive)
        .await
        .map_err(setup)?;
    if !binding.exchange.is_empty() {
        transport
            .bind_queue(&declared.name, &binding.routing_key, &binding.exchange)
            .await
            .map_err(setup)?;
    }
    transport
        .consume(&declared.name, &declared.name, binding.ack_mode.is_auto())
        .await
        .map_err(setup)
}

/// Settle a message that was pulled in the same cycle shutdown was observed
async fn reject_undispatched(slot: &QueueSlot, envelope: DeliveryEnvelope, stats: &ConsumerStatistics) {
    stats.record_rejected_on_shutdown();
    match slot.binding.ack_mode {
        AckMode::Manual => {
            if let Err(e) = envelope.handle.nack(true).await {
                log::warn!(
                    "Broker consumer: could not requeue undispatched message on '{}': {}",
                    slot.binding.queue,
                    e
                );
            }
        }
        AckMode::Auto => {
            log::warn!(
                "Broker consumer: message from auto-ack queue '{}' dropped during shutdown",
                slot.binding.queue
            );
        }
    }
}

fn report_join(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            log::error!("Broker consumer: processing task panicked: {:?}", e);
        } else if !e.is_cancelled() {
            log::error!("Broker consumer: processing task failed: {}", e);
        }
    }
}
