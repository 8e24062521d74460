//! Command line arguments

use clap::Parser;
use mqworker::core::logging::{LogFormat, LogSettings};
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Parser, Debug, Clone)]
#[command(name = "mqworker")]
#[command(about = "Multi-queue broker consumer")]
#[command(version)]
#[command(
    after_help = " * can be specified multiple times\n\nLines read from stdin are published to the first queue; end of input drains and stops the consumer."
)]
pub struct Args {
    /// Queue to consume*: NAME, EXCHANGE:NAME or EXCHANGE:NAME:LIMIT
    #[arg(short = 'q', long = "queue", value_name = "QUEUE", action = clap::ArgAction::Append)]
    pub queues: Vec<QueueSpec>,

    /// Configuration file path
    #[arg(short = 'c', long = "config-file", value_name = "FILE")]
    pub config_file: Option<PathBuf>,

    /// Default concurrency limit per queue
    #[arg(short = 'm', long = "max-concurrent", value_name = "N", value_parser = clap::value_parser!(u32).range(1..))]
    pub max_concurrent: Option<u32>,

    /// Ceiling on in-flight handlers across all queues
    #[arg(long = "max-in-flight", value_name = "N", value_parser = clap::value_parser!(u32).range(1..))]
    pub max_in_flight: Option<u32>,

    /// Service name reported in consume records
    #[arg(short = 's', long = "service-name", value_name = "NAME")]
    pub service_name: Option<String>,

    /// Log every consumed message at info level
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,

    /// Let the broker settle messages on delivery
    #[arg(long = "auto-ack")]
    pub auto_ack: bool,

    /// Color output control: unspecified = auto (TTY)
    #[arg(short = 'g', long = "color")]
    pub color: Option<bool>,

    /// Log level
    #[arg(short = 'l', long = "log-level", value_name = "LEVEL", value_parser = ["trace", "debug", "info", "warn", "error", "off"])]
    pub log_level: Option<String>,

    /// Log file path
    #[arg(short = 'f', long = "log-file", value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Log output format
    #[arg(short = 'o', long = "log-format", value_name = "FORMAT", value_parser = ["text", "ext", "json"])]
    pub log_format: Option<String>,
}

impl Args {
    /// Logger settings; `is_terminal` decides color when not forced
    pub fn log_settings(&self, is_terminal: bool) -> LogSettings {
        let color = self
            .color
            .unwrap_or_else(|| is_terminal && std::env::var_os("NO_COLOR").is_none());
        LogSettings {
            level: self.log_level.clone(),
            format: self
                .log_format
                .as_deref()
                .and_then(|f| f.parse().ok())
                .unwrap_or(LogFormat::Text),
            file: self
                .log_file
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
            color,
        }
    }
}

/// Queue named on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub exchange: String,
    pub queue: String,
    pub limit: Option<usize>,
}

impl FromStr for QueueSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let (exchange, queue, limit) = match parts.as_slice() {
            [queue] => ("", *queue, None),
            [exchange, queue] => (*exchange, *queue, None),
            [exchange, queue, limit] => (*exchange, *queue, Some(*limit)),
            _ => return Err(format!("expected NAME, EXCHANGE:NAME or EXCHANGE:NAME:LIMIT, got '{}'", s)),
        };

        if queue.trim().is_empty() {
            return Err(format!("queue name missing in '{}'", s));
        }
        let limit = match limit {
            Some(limit) => match limit.parse::<usize>() {
                Ok(0) | Err(_) => {
                    return Err(format!("limit must be a positive integer, got '{}'", limit))
                }
                Ok(limit) => Some(limit),
            },
            None => None,
        };

        Ok(Self {
            exchange: exchange.trim().to_string(),
            queue: queue.trim().to_string(),
            limit,
        })
    }
}
