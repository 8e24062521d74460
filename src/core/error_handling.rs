//! Fatal error reporting
//!
//! Errors that end the process are logged once through
//! [`log_error_with_context`]. Errors the operator can fix (bad configuration,
//! conflicting registrations, broker topology problems) are reported with
//! their own message; everything else is reported with the operation that
//! failed, and the full error goes to the debug log.

/// Errors that know whether the operator can act on them
///
/// When `is_user_actionable()` returns `true`, `user_message()` should return
/// `Some(message)`; otherwise it should return `None`.
pub trait ContextualError: std::error::Error {
    /// True for configuration and registration mistakes, false for
    /// transport or runtime failures
    fn is_user_actionable(&self) -> bool;

    fn user_message(&self) -> Option<&str>;
}

/// Message for the primary fatal line
pub fn fatal_message<'a, E: ContextualError>(error: &'a E, operation_context: &'a str) -> &'a str {
    if error.is_user_actionable() {
        error.user_message().unwrap_or(operation_context)
    } else {
        operation_context
    }
}

/// Log a fatal error at a detail level that matches its kind
///
/// # Examples
/// ```rust,no_run
/// # use mqworker::core::config::EngineConfig;
/// # use mqworker::core::error_handling::log_error_with_context;
/// if let Err(e) = EngineConfig::from_env() {
///     // Logs: "FATAL: Invalid consumer configuration value"
///     log_error_with_context(&e, "Loading consumer configuration");
/// }
/// ```
pub fn log_error_with_context<E: ContextualError + std::fmt::Display + std::fmt::Debug>(
    error: &E,
    operation_context: &str,
) {
    log::error!("FATAL: {}", fatal_message(error, operation_context));
    log::debug!("DETAIL: {}", error);
    log::debug!("DEBUG_DETAILS: {:?}", error);
}
