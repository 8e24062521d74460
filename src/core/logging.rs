//! Logging setup
//!
//! Process-wide logger built on flexi_logger. Three output formats are
//! supported: `text` (timestamp, level, message, source), `ext` (the same
//! with the source dimmed when colored), and `json` (one object per line).
//! Per-message consume records are already JSON; the json format embeds them
//! as a nested object instead of escaping them into the message string.

use crate::broker::api::RECORD_TARGET;
use std::str::FromStr;
use std::sync::{Mutex, OnceLock};

static LOGGER_HANDLE: OnceLock<Mutex<flexi_logger::LoggerHandle>> = OnceLock::new();

/// Output format of the process logger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Ext,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "ext" => Ok(LogFormat::Ext),
            "json" => Ok(LogFormat::Json),
            other => Err(format!(
                "unknown log format '{}' (expected text, ext or json)",
                other
            )),
        }
    }
}

/// Logger settings collected from the command line
#[derive(Debug, Clone, Default)]
pub struct LogSettings {
    /// flexi_logger spec, e.g. `info` or `info,mqworker::consume=warn`
    pub level: Option<String>,
    pub format: LogFormat,
    pub file: Option<String>,
    pub color: bool,
}

impl LogSettings {
    /// Effective level spec; `debug_mode` raises the default to `debug`
    pub fn level_spec(&self, debug_mode: bool) -> String {
        match &self.level {
            Some(level) => level.clone(),
            None if debug_mode => "debug".to_string(),
            None => "info".to_string(),
        }
    }
}

/// Start the process logger
///
/// May be called once per process; later calls fail because the `log` facade
/// only accepts a single logger.
pub fn init_logging(
    settings: &LogSettings,
    debug_mode: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    use flexi_logger::{FileSpec, Logger};

    let mut logger = Logger::try_with_str(settings.level_spec(debug_mode))?;

    logger = match (settings.format, settings.color) {
        (LogFormat::Json, _) => logger.format(json_format),
        (LogFormat::Ext, true) => logger.format(extended_color_format),
        (LogFormat::Ext, false) => logger.format(extended_format),
        (LogFormat::Text, true) => logger.format(text_color_format),
        (LogFormat::Text, false) => logger.format(text_format),
    };

    if let Some(file_path) = &settings.file {
        let file_spec = FileSpec::try_from(std::path::Path::new(file_path))?;
        logger = logger.log_to_file(file_spec);
    }

    let handle = logger.start()?;
    let _ = LOGGER_HANDLE.set(Mutex::new(handle));

    Ok(())
}

/// Replace the active level spec at runtime
///
/// Only the level can change after start; format and destination are fixed
/// by flexi_logger when the logger is built.
pub fn set_log_level(level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let handle_mutex = LOGGER_HANDLE
        .get()
        .ok_or("Logger handle not initialised. Call init_logging first.")?;
    let mut handle = handle_mutex
        .lock()
        .map_err(|_| "Could not acquire logger handle lock")?;
    handle.parse_and_push_temp_spec(level)?;
    Ok(())
}

fn level_abbr(level: log::Level) -> &'static str {
    match level {
        log::Level::Error => "ERR",
        log::Level::Warn => "WRN",
        log::Level::Info => "INF",
        log::Level::Debug => "DBG",
        log::Level::Trace => "TRC",
    }
}

fn text_format(
    w: &mut dyn std::io::Write,
    now: &mut flexi_logger::DeferredNow,
    record: &log::Record,
) -> Result<(), std::io::Error> {
    write!(
        w,
        "{} {} {}",
        now.format("%Y-%m-%d %H:%M:%S%.3f"),
        level_abbr(record.level()),
        record.args()
    )
}

fn text_color_format(
    w: &mut dyn std::io::Write,
    now: &mut flexi_logger::DeferredNow,
    record: &log::Record,
) -> Result<(), std::io::Error> {
    use colored::*;

    let level_colored = match record.level() {
        log::Level::Error => "ERR".red().bold(),
        log::Level::Warn => "WRN".yellow(),
        log::Level::Info => "INF".green(),
        log::Level::Debug => "DBG".blue(),
        log::Level::Trace => "TRC".magenta(),
    };

    write!(
        w,
        "{} {} {}",
        now.format("%Y-%m-%d %H:%M:%S%.3f").to_string().dimmed(),
        level_colored,
        record.args()
    )
}

fn extended_format(
    w: &mut dyn std::io::Write,
    now: &mut flexi_logger::DeferredNow,
    record: &log::Record,
) -> Result<(), std::io::Error> {
    write!(
        w,
        "{} {} {} ({})",
        now.format("%Y-%m-%d %H:%M:%S%.3f"),
        level_abbr(record.level()),
        record.args(),
        format_target_as_path(record.target(), record.line())
    )
}

fn extended_color_format(
    w: &mut dyn std::io::Write,
    now: &mut flexi_logger::DeferredNow,
    record: &log::Record,
) -> Result<(), std::io::Error> {
    use colored::*;

    let level_colored = match record.level() {
        log::Level::Error => "ERR".red().bold(),
        log::Level::Warn => "WRN".yellow(),
        log::Level::Info => "INF".green(),
        log::Level::Debug => "DBG".blue(),
        log::Level::Trace => "TRC".magenta(),
    };

    write!(
        w,
        "{} {} {} ({})",
        now.format("%Y-%m-%d %H:%M:%S%.3f").to_string().dimmed(),
        level_colored,
        record.args(),
        format_target_as_path(record.target(), record.line()).dimmed()
    )
}

fn json_format(
    w: &mut dyn std::io::Write,
    now: &mut flexi_logger::DeferredNow,
    record: &log::Record,
) -> Result<(), std::io::Error> {
    let json_obj = json_line(
        now.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        record.level(),
        record.target(),
        record.line(),
        record.args().to_string(),
    );

    match serde_json::to_string(&json_obj) {
        Ok(json_string) => w.write_all(json_string.as_bytes()),
        Err(_) => w.write_all(b"{\"error\":\"Failed to serialize log message\"}"),
    }
}

fn json_line(
    timestamp: String,
    level: log::Level,
    target: &str,
    line: Option<u32>,
    message: String,
) -> serde_json::Value {
    use serde_json::json;

    // Consume records are emitted pre-serialized
    if target == RECORD_TARGET {
        if let Ok(consume) = serde_json::from_str::<serde_json::Value>(&message) {
            return json!({
                "timestamp": timestamp,
                "level": level_abbr(level),
                "consume": consume,
            });
        }
    }

    json!({
        "timestamp": timestamp,
        "level": level_abbr(level),
        "message": message,
        "target": format_target_as_path(target, line),
    })
}

// mqworker::broker::engine -> broker/engine.rs:42
fn format_target_as_path(target: &str, line: Option<u32>) -> String {
    let path_like = match target.strip_prefix("mqworker::") {
        Some(without_prefix) => without_prefix.replace("::", "/") + ".rs",
        None => target.replace("::", "/"),
    };

    match line {
        Some(line_num) => format!("{}:{}", path_like, line_num),
        None => path_like,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flexi_logger::DeferredNow;

    fn render(
        formatter: fn(
            &mut dyn std::io::Write,
            &mut DeferredNow,
            &log::Record,
        ) -> Result<(), std::io::Error>,
        target: &str,
        message: &str,
    ) -> String {
        let mut buffer = Vec::new();
        let mut now = DeferredNow::new();

        formatter(
            &mut buffer,
            &mut now,
            &log::Record::builder()
                .level(log::Level::Info)
                .target(target)
                .line(Some(42))
                .args(format_args!("{}", message))
                .build(),
        )
        .expect("format should succeed");
        String::from_utf8(buffer).expect("Output should be valid UTF-8")
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert_eq!("EXT".parse::<LogFormat>().unwrap(), LogFormat::Ext);
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("yaml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_level_spec_respects_debug_mode() {
        let mut settings = LogSettings::default();
        assert_eq!(settings.level_spec(false), "info");
        assert_eq!(settings.level_spec(true), "debug");

        settings.level = Some("warn".to_string());
        assert_eq!(settings.level_spec(true), "warn");
    }

    #[test]
    fn test_text_format_has_no_target() {
        let output = render(text_format, "mqworker::broker::engine", "Consumer running");

        assert!(output.contains("INF Consumer running"), "got: {}", output);
        assert!(!output.contains("broker/engine.rs"));
    }

    #[test]
    fn test_extended_format_includes_source_path() {
        let output = render(extended_format, "mqworker::broker::engine", "Consumer running");

        assert!(
            output.ends_with("INF Consumer running (broker/engine.rs:42)"),
            "got: {}",
            output
        );
    }

    #[test]
    fn test_external_target_kept_as_path() {
        assert_eq!(format_target_as_path("tokio::runtime", None), "tokio/runtime");
        assert_eq!(
            format_target_as_path("mqworker::core::shutdown", Some(7)),
            "core/shutdown.rs:7"
        );
    }

    #[test]
    fn test_json_format_plain_message() {
        let output = render(json_format, "mqworker::app::startup", "hello");
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();

        assert_eq!(value["level"], "INF");
        assert_eq!(value["message"], "hello");
        assert_eq!(value["target"], "app/startup.rs:42");
        assert!(!output.contains('\n'));
    }

    #[test]
    fn test_json_format_embeds_consume_record() {
        let output = render(
            json_format,
            RECORD_TARGET,
            r#"{"request_id":"req-1","status_code":200}"#,
        );
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();

        assert_eq!(value["consume"]["request_id"], "req-1");
        assert_eq!(value["consume"]["status_code"], 200);
        assert!(value.get("message").is_none());
    }

    #[test]
    fn test_json_format_falls_back_for_non_json_record() {
        let output = render(json_format, RECORD_TARGET, "not json");
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();

        assert_eq!(value["message"], "not json");
    }

    #[test]
    fn test_set_level_before_init_fails() {
        if LOGGER_HANDLE.get().is_none() {
            assert!(set_log_level("debug").is_err());
        }
    }
}
