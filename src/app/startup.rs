//! Process startup
//!
//! Wires configuration, logging, an in-memory broker and the consumer engine
//! together. Every `--queue` gets an echo handler; lines read from stdin are
//! published to the first queue, and end of input starts a graceful drain.

use super::args::{Args, QueueSpec};
use clap::Parser;
use mqworker::broker::api::{
    ConsumerEngine, ConsumerStatistics, Delivery, EngineError, EngineStats, EventContext,
    HandlerGroup, HandlerOptions, HandlerResult, MemoryTransport, ShutdownCoordinator,
};
use mqworker::core::config::{ConfigError, EngineConfig};
use mqworker::core::error_handling::log_error_with_context;
use mqworker::core::logging::init_logging;
use std::io::IsTerminal;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Service name used when none is configured
pub const DEFAULT_SERVICE_NAME: &str = "mqworker";

/// Run the application; returns the process exit code
pub async fn startup() -> i32 {
    let args = Args::parse();

    // Configuration problems are reported once logging is up
    let config = resolve_config(&args).await;
    let debug_mode = config.as_ref().map_or(args.debug, |c| c.debug_mode);

    if let Err(e) = init_logging(&args.log_settings(std::io::stderr().is_terminal()), debug_mode) {
        eprintln!("Failed to initialize logging: {}", e);
        return 1;
    }

    log::info!(
        "mqworker {} ({}) built {} starting",
        env!("CARGO_PKG_VERSION"),
        mqworker::GIT_HASH,
        mqworker::BUILD_TIME
    );

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            log_error_with_context(&e, "Loading consumer configuration");
            return 1;
        }
    };
    log::debug!("Consumer configuration: {:?}", config);

    match run(&args, config).await {
        Ok(stats) => {
            log::info!(
                "Consumer stopped: {} dispatched, {} succeeded, {} failed ({} panicked), {} acked, {} requeued",
                stats.dispatched,
                stats.succeeded,
                stats.failed,
                stats.panicked,
                stats.acked,
                stats.nacked
            );
            0
        }
        Err(e) => {
            log_error_with_context(&e, "Running broker consumer");
            1
        }
    }
}

/// Defaults, then environment, then configuration file, then flags
pub async fn resolve_config(args: &Args) -> Result<EngineConfig, ConfigError> {
    let mut config = EngineConfig::from_env()?;

    let config_file = args
        .config_file
        .clone()
        .or_else(EngineConfig::default_config_path);
    if let Some(path) = config_file {
        log::debug!("Loading configuration from {}", path.display());
        config.load_file(&path).await?;
    }

    if let Some(limit) = args.max_concurrent {
        config.max_concurrent_per_queue = limit as usize;
    }
    if let Some(limit) = args.max_in_flight {
        config.max_in_flight = Some(limit as usize);
    }
    if let Some(name) = &args.service_name {
        config.service_name = Some(name.clone());
    }
    if args.debug {
        config.debug_mode = true;
    }

    config.validate()?;
    Ok(config)
}

async fn run(
    args: &Args,
    config: EngineConfig,
) -> Result<EngineStats, EngineError> {
    let transport = MemoryTransport::new();
    for spec in &args.queues {
        if !spec.exchange.is_empty() {
            transport.declare_exchange(&spec.exchange)?;
        }
    }

    let engine = ConsumerEngine::new(
        DEFAULT_SERVICE_NAME,
        Arc::new(transport.clone()),
        config,
        build_handlers(&args.queues, args.auto_ack),
    )
    .await?;

    let shutdown = engine.shutdown_handle();
    shutdown.install_signal_handlers();
    tokio::spawn(feed_stdin(
        transport,
        args.queues.first().cloned(),
        engine.statistics(),
        shutdown,
    ));

    engine.start().await
}

fn build_handlers(queues: &[QueueSpec], auto_ack: bool) -> HandlerGroup {
    let mut handlers = HandlerGroup::new();
    for spec in queues {
        let mut options = HandlerOptions::new(&spec.queue)
            .exchange(&spec.exchange)
            .auto_ack(auto_ack);
        if let Some(limit) = spec.limit {
            options = options.max_concurrent(limit);
        }
        handlers.add_handler(echo, options);
    }
    handlers
}

async fn echo(ctx: EventContext) -> HandlerResult {
    log::info!(
        "[{}] {} (request_id={}{})",
        ctx.queue(),
        String::from_utf8_lossy(ctx.message()),
        ctx.request_id(),
        if ctx.redelivered() { ", redelivered" } else { "" }
    );
    Ok(())
}

/// Publish stdin lines to `target` until end of input, then request shutdown
///
/// Shutdown is requested once every published line has been handled, so
/// piped input is consumed completely.
async fn feed_stdin(
    transport: MemoryTransport,
    target: Option<QueueSpec>,
    stats: Arc<ConsumerStatistics>,
    shutdown: Arc<ShutdownCoordinator>,
) {
    let mut published = 0;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }
                let Some(spec) = &target else {
                    log::warn!("No queue registered; ignoring input");
                    continue;
                };
                let routed = transport.publish(
                    &spec.exchange,
                    &spec.queue,
                    Delivery::new(line.as_bytes().to_vec(), spec.queue.clone()),
                );
                match routed {
                    Ok(0) => log::warn!("Message for '{}' was not routed", spec.queue),
                    Ok(_) => published += 1,
                    Err(e) => {
                        log::debug!("Stopping input: {}", e);
                        break;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                log::warn!("Error reading stdin: {}", e);
                break;
            }
        }
    }

    log::debug!("End of input after {} message(s)", published);
    let mut shutdown_rx = shutdown.subscribe();
    if !shutdown.is_shutdown_requested() {
        tokio::select! {
            _ = stats.wait_finished(published) => {}
            _ = shutdown_rx.recv() => {}
        }
    }
    if shutdown.request_shutdown() {
        log::info!("End of input; draining consumer");
    }
}
