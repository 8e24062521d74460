//! Broker Error Types

use crate::core::config::ConfigError;
use crate::core::error_handling::ContextualError;

/// Errors raised by a transport implementation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("error declaring queue '{queue}': {message}")]
    QueueDeclare { queue: String, message: String },

    #[error("error binding queue '{queue}' to exchange '{exchange}': {message}")]
    QueueBind {
        queue: String,
        exchange: String,
        message: String,
    },

    #[error("error consuming from queue '{queue}': {message}")]
    Consume { queue: String, message: String },

    #[error("unknown delivery tag: {delivery_tag}")]
    UnknownDeliveryTag { delivery_tag: u64 },

    #[error("channel closed")]
    ChannelClosed,

    #[error("transport operation failed: {message}")]
    OperationFailed { message: String },
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors surfaced by the consumer engine itself
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Queue declaration, binding or consumption could not be set up
    #[error("setup failed for queue '{queue}': {source}")]
    Setup {
        queue: String,
        #[source]
        source: TransportError,
    },

    /// Two handlers were registered for the same queue
    #[error("duplicate handler registration for queue '{queue}'")]
    DuplicateQueue { queue: String },

    #[error("invalid handler registration: {message}")]
    InvalidRegistration { message: String },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Failure of a single handler invocation
#[derive(Debug, thiserror::Error)]
pub enum HandlerFailure {
    #[error("{0}")]
    Failed(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("handler panicked: {message}")]
    Panicked { message: String },
}

impl HandlerFailure {
    pub fn is_panic(&self) -> bool {
        matches!(self, HandlerFailure::Panicked { .. })
    }
}

impl ContextualError for EngineError {
    fn is_user_actionable(&self) -> bool {
        matches!(
            self,
            EngineError::Setup { .. }
                | EngineError::DuplicateQueue { .. }
                | EngineError::InvalidRegistration { .. }
                | EngineError::Config(_)
        )
    }

    fn user_message(&self) -> Option<&str> {
        match self {
            EngineError::Setup { .. } => {
                Some("Broker topology setup failed; check queue and exchange declarations")
            }
            EngineError::DuplicateQueue { .. } => {
                Some("A queue may only be registered with one handler")
            }
            EngineError::InvalidRegistration { message } => Some(message.as_str()),
            EngineError::Config(e) => e.user_message(),
            EngineError::Transport(_) => None,
        }
    }
}
