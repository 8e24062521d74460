//! Engine configuration
//!
//! Values are layered: built-in defaults, then environment variables, then the
//! `[consumer]` table of a TOML configuration file, then explicit overrides
//! (builder setters or command line flags).

use crate::core::error_handling::ContextualError;
use std::path::{Path, PathBuf};

pub const DEFAULT_MAX_CONCURRENT_PER_QUEUE: usize = 20;

pub const ENV_MAX_CONCURRENT: &str = "BROKER_MAX_CONCURRENT";
/// Older name of [`ENV_MAX_CONCURRENT`], read when the new one is unset
pub const ENV_MAX_CONCURRENT_LEGACY: &str = "BROKER_MAX_GOROUTINES";
pub const ENV_MAX_IN_FLIGHT: &str = "BROKER_MAX_IN_FLIGHT";
pub const ENV_DEBUG_MODE: &str = "DEBUG_MODE";
pub const ENV_SERVICE_NAME: &str = "SERVICE_NAME";

const CONFIG_SECTION: &str = "consumer";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("error reading configuration file {path}: {message}")]
    Read { path: PathBuf, message: String },

    #[error("error parsing configuration file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

impl ConfigError {
    fn invalid(key: &str, value: impl ToString, reason: &str) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl ContextualError for ConfigError {
    fn is_user_actionable(&self) -> bool {
        true
    }

    fn user_message(&self) -> Option<&str> {
        Some(match self {
            ConfigError::InvalidValue { .. } => "Invalid consumer configuration value",
            ConfigError::Read { .. } => "Configuration file could not be read",
            ConfigError::Parse { .. } => "Configuration file is not valid TOML",
        })
    }
}

/// Consumer engine settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Default admission gate capacity for queues without their own limit
    pub max_concurrent_per_queue: usize,
    /// Optional ceiling on in-flight handlers across all queues
    pub max_in_flight: Option<usize>,
    pub debug_mode: bool,
    /// Falls back to the owning service's name when unset
    pub service_name: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_queue: DEFAULT_MAX_CONCURRENT_PER_QUEUE,
            max_in_flight: None,
            debug_mode: false,
            service_name: None,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    pub fn with_max_concurrent_per_queue(mut self, limit: usize) -> Self {
        self.max_concurrent_per_queue = limit;
        self
    }

    pub fn with_max_in_flight(mut self, limit: Option<usize>) -> Self {
        self.max_in_flight = limit;
        self
    }

    pub fn with_debug_mode(mut self, debug_mode: bool) -> Self {
        self.debug_mode = debug_mode;
        self
    }

    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = Some(service_name.into());
        self
    }

    /// Service name to report, using `owner` when none is configured
    pub fn resolve_service_name(&self, owner: &str) -> String {
        match &self.service_name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => owner.to_string(),
        }
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        let concurrency = env_value(ENV_MAX_CONCURRENT)
            .map(|v| (ENV_MAX_CONCURRENT, v))
            .or_else(|| env_value(ENV_MAX_CONCURRENT_LEGACY).map(|v| (ENV_MAX_CONCURRENT_LEGACY, v)));
        if let Some((key, value)) = concurrency {
            self.max_concurrent_per_queue = parse_limit(key, &value)?;
        }
        if let Some(value) = env_value(ENV_MAX_IN_FLIGHT) {
            self.max_in_flight = Some(parse_limit(ENV_MAX_IN_FLIGHT, &value)?);
        }
        if let Some(value) = env_value(ENV_DEBUG_MODE) {
            self.debug_mode = parse_bool(ENV_DEBUG_MODE, &value)?;
        }
        if let Some(value) = env_value(ENV_SERVICE_NAME) {
            self.service_name = Some(value);
        }
        Ok(())
    }

    /// Apply values from the `[consumer]` table of a parsed configuration file
    pub fn apply_toml(&mut self, config: &toml::Table) -> Result<(), ConfigError> {
        let Some(section) = config.get(CONFIG_SECTION).and_then(|v| v.as_table()) else {
            return Ok(());
        };

        if let Some(value) = section.get("max-concurrent-per-queue") {
            self.max_concurrent_per_queue = toml_limit("max-concurrent-per-queue", value)?;
        }
        if let Some(value) = section.get("max-in-flight") {
            self.max_in_flight = Some(toml_limit("max-in-flight", value)?);
        }
        if let Some(value) = section.get("debug-mode") {
            self.debug_mode = value
                .as_bool()
                .ok_or_else(|| ConfigError::invalid("debug-mode", value, "expected a boolean"))?;
        }
        if let Some(value) = section.get("service-name") {
            let name = value
                .as_str()
                .ok_or_else(|| ConfigError::invalid("service-name", value, "expected a string"))?;
            self.service_name = Some(name.to_string());
        }
        Ok(())
    }

    /// Read a TOML file and apply its `[consumer]` section
    pub async fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::Read {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        let table = toml::from_str::<toml::Table>(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        self.apply_toml(&table)
    }

    /// `<config dir>/mqworker/mqworker.toml` if it exists
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir()
            .map(|d| d.join("mqworker").join("mqworker.toml"))
            .filter(|path| path.exists())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_per_queue == 0 {
            return Err(ConfigError::invalid(
                "max-concurrent-per-queue",
                0,
                "must be at least 1",
            ));
        }
        if self.max_in_flight == Some(0) {
            return Err(ConfigError::invalid("max-in-flight", 0, "must be at least 1"));
        }
        Ok(())
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_limit(key: &str, value: &str) -> Result<usize, ConfigError> {
    match value.parse::<usize>() {
        Ok(0) => Err(ConfigError::invalid(key, value, "must be at least 1")),
        Ok(limit) => Ok(limit),
        Err(_) => Err(ConfigError::invalid(key, value, "expected a positive integer")),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "yes" | "on" => Ok(true),
        "0" | "f" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(key, value, "expected a boolean")),
    }
}

fn toml_limit(key: &str, value: &toml::Value) -> Result<usize, ConfigError> {
    match value.as_integer() {
        Some(limit) if limit >= 1 => Ok(limit as usize),
        _ => Err(ConfigError::invalid(key, value, "expected a positive integer")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn clear_env() {
        for key in [
            ENV_MAX_CONCURRENT,
            ENV_MAX_CONCURRENT_LEGACY,
            ENV_MAX_IN_FLIGHT,
            ENV_DEBUG_MODE,
            ENV_SERVICE_NAME,
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_without_environment() {
        clear_env();
        let config = EngineConfig::from_env().unwrap();

        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.max_concurrent_per_queue, 20);
        assert!(!config.debug_mode);
    }

    #[test]
    #[serial]
    fn test_environment_overrides() {
        clear_env();
        std::env::set_var(ENV_MAX_CONCURRENT, "4");
        std::env::set_var(ENV_MAX_IN_FLIGHT, "10");
        std::env::set_var(ENV_DEBUG_MODE, "true");
        std::env::set_var(ENV_SERVICE_NAME, "billing");

        let config = EngineConfig::from_env().unwrap();
        clear_env();

        assert_eq!(config.max_concurrent_per_queue, 4);
        assert_eq!(config.max_in_flight, Some(10));
        assert!(config.debug_mode);
        assert_eq!(config.service_name.as_deref(), Some("billing"));
    }

    #[test]
    #[serial]
    fn test_legacy_concurrency_variable() {
        clear_env();
        std::env::set_var(ENV_MAX_CONCURRENT_LEGACY, "7");
        let config = EngineConfig::from_env().unwrap();
        clear_env();

        assert_eq!(config.max_concurrent_per_queue, 7);
    }

    #[test]
    #[serial]
    fn test_invalid_environment_value() {
        clear_env();
        std::env::set_var(ENV_MAX_CONCURRENT, "many");
        let result = EngineConfig::from_env();
        clear_env();

        assert!(matches!(result, Err(ConfigError::InvalidValue { key, .. }) if key == ENV_MAX_CONCURRENT));
    }

    #[test]
    fn test_apply_toml_section() {
        let table: toml::Table = toml::from_str(
            r#"
            [consumer]
            max-concurrent-per-queue = 3
            max-in-flight = 12
            debug-mode = true
            service-name = "orders-service"
            "#,
        )
        .unwrap();
        let mut config = EngineConfig::default();
        config.apply_toml(&table).unwrap();

        assert_eq!(config.max_concurrent_per_queue, 3);
        assert_eq!(config.max_in_flight, Some(12));
        assert!(config.debug_mode);
        assert_eq!(config.resolve_service_name("fallback"), "orders-service");
    }

    #[test]
    fn test_apply_toml_rejects_zero_limit() {
        let table: toml::Table = toml::from_str("[consumer]\nmax-concurrent-per-queue = 0\n").unwrap();
        let mut config = EngineConfig::default();

        assert!(config.apply_toml(&table).is_err());
    }

    #[test]
    fn test_service_name_falls_back_to_owner() {
        let config = EngineConfig::default();
        assert_eq!(config.resolve_service_name("owner"), "owner");

        let blank = EngineConfig::default().with_service_name("  ");
        assert_eq!(blank.resolve_service_name("owner"), "owner");
    }

    #[test]
    fn test_validate() {
        assert!(EngineConfig::default().validate().is_ok());
        assert!(EngineConfig::default()
            .with_max_concurrent_per_queue(0)
            .validate()
            .is_err());
        assert!(EngineConfig::default()
            .with_max_in_flight(Some(0))
            .validate()
            .is_err());
    }

    #[tokio::test]
    async fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[consumer]\nmax-concurrent-per-queue = 5").unwrap();

        let mut config = EngineConfig::default();
        config.load_file(file.path()).await.unwrap();
        assert_eq!(config.max_concurrent_per_queue, 5);
    }

    #[tokio::test]
    async fn test_load_file_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[consumer\nbroken").unwrap();

        let mut config = EngineConfig::default();
        let result = config.load_file(file.path()).await;
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }
}
