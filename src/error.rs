//! Error types for the agent bus.
//!
//! This module provides error handling with:
//! - Error codes for programmatic handling (E001-E099)
//! - Wire codes for failures that cross the bus boundary as ERROR messages
//! - Structured error types using thiserror
//!
//! # Error Code Ranges
//!
//! | Range | Category |
//! |-------|----------|
//! | E001-E009 | Configuration errors |
//! | E010-E019 | Bus errors |
//! | E020-E029 | Admission errors (rate limit, circuit breaker) |
//! | E030-E039 | Handler errors |
//! | E040-E049 | Workflow errors |
//! | E050-E059 | Command protocol errors |
//! | E070-E079 | I/O errors |
//! | E080-E089 | Serialization errors |
//! | E090-E099 | Internal errors |
//!
//! # Example
//!
//! ```rust,ignore
//! use agent_bus::error::{Error, display_error};
//!
//! let err = Error::unknown_state("rendering");
//! display_error(&err);
//! std::process::exit(err.exit_code());
//! ```
//!
//! ## Macros
//!
//! The [`bail_if!`] macro provides early return on condition:
//!
//! ```ignore
//! use agent_bus::error::{bail_if, Error};
//!
//! fn validate_load(load: f64) -> Result<()> {
//!     bail_if!(!(0.0..=1.0).contains(&load), Error::invalid_message("load out of range"));
//!     Ok(())
//! }
//! ```

use crate::message::codes;
use thiserror::Error;

// =============================================================================
// CLI EXIT CODES
// =============================================================================

/// Exit code for successful execution.
pub const EXIT_SUCCESS: i32 = 0;

/// Exit code for configuration errors.
pub const EXIT_CONFIG_ERROR: i32 = 1;

/// Exit code for bus and admission errors.
pub const EXIT_BUS_ERROR: i32 = 2;

/// Exit code for handler and command protocol errors.
pub const EXIT_COMMAND_ERROR: i32 = 3;

/// Exit code for workflow errors.
pub const EXIT_WORKFLOW_ERROR: i32 = 4;

/// Exit code for I/O errors.
pub const EXIT_IO_ERROR: i32 = 10;

/// Exit code for internal/unexpected errors.
pub const EXIT_INTERNAL_ERROR: i32 = 99;

// =============================================================================
// BAIL_IF MACRO
// =============================================================================

/// Early return if condition is true.
///
/// # Examples
///
/// ```ignore
/// use agent_bus::error::{bail_if, Error, Result};
///
/// fn check(id: &str) -> Result<()> {
///     bail_if!(id.is_empty(), Error::invalid_message("empty id"));
///     Ok(())
/// }
/// ```
#[macro_export]
macro_rules! bail_if {
    ($cond:expr, $err:expr) => {
        if $cond {
            return Err($err);
        }
    };
}

pub use bail_if;

// =============================================================================
// ERROR TYPE
// =============================================================================

/// The main error type for the agent bus.
///
/// Each variant includes an error code prefix for easy identification.
/// Use `wire_code()` for the code carried inside ERROR messages.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // CONFIGURATION ERRORS (E001-E009)
    // =========================================================================
    /// Configuration file not found.
    #[error("[E001] Configuration file not found: {path}")]
    ConfigFileNotFound {
        path: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Configuration file has invalid format.
    #[error("[E002] Invalid configuration format in {path}: {details}")]
    ConfigInvalidFormat { path: String, details: String },

    /// Configuration value is invalid.
    #[error("[E003] Invalid configuration value for '{key}': {details}")]
    ConfigInvalidValue { key: String, details: String },

    /// General configuration error.
    #[error("[E004] Configuration error: {0}")]
    Config(String),

    // =========================================================================
    // BUS ERRORS (E010-E019)
    // =========================================================================
    /// The bus has been stopped or was never started.
    #[error("[E010] Message bus is not running")]
    BusNotRunning,

    /// A response or error references a message the bus has never seen.
    #[error("[E011] Correlation id '{correlation_id}' does not reference a known message")]
    UnknownCorrelation { correlation_id: String },

    /// A response waiter already exists for the message.
    #[error("[E012] A response waiter is already registered for message '{message_id}'")]
    DuplicateWaiter { message_id: String },

    /// The message is malformed.
    #[error("[E013] Invalid message: {details}")]
    InvalidMessage { details: String },

    /// An internal channel was closed.
    #[error("[E014] Channel closed: {0}")]
    ChannelClosed(String),

    // =========================================================================
    // ADMISSION ERRORS (E020-E029)
    // =========================================================================
    /// No tokens became available before the admission deadline.
    #[error("[E020] Rate limited on '{key}' (needed {tokens:.2} tokens)")]
    RateLimited { key: String, tokens: f64 },

    /// The circuit between source and target is open.
    #[error("[E021] Circuit open between '{source_id}' and '{target}'")]
    CircuitOpen { source_id: String, target: String },

    /// The half-open circuit rejected this probe.
    #[error("[E022] Circuit half-open between '{source_id}' and '{target}', request shed")]
    CircuitHalfOpen { source_id: String, target: String },

    // =========================================================================
    // HANDLER ERRORS (E030-E039)
    // =========================================================================
    /// A handler failed while processing a message.
    #[error("[E030] Handler '{handler_id}' failed: {message}")]
    HandlerFailed { handler_id: String, message: String },

    /// The handler does not know the requested action.
    #[error("[E031] Unknown command action: {action}")]
    UnknownAction { action: String },

    /// The handler does not implement this kind of request.
    #[error("[E032] Not implemented: {feature}")]
    NotImplemented { feature: String },

    /// A handler task panicked or was aborted.
    #[error("[E033] Handler '{handler_id}' aborted: {details}")]
    HandlerAborted { handler_id: String, details: String },

    // =========================================================================
    // WORKFLOW ERRORS (E040-E049)
    // =========================================================================
    /// The workflow has not been started or has already stopped.
    #[error("[E040] Workflow '{workflow_id}' is not running")]
    WorkflowNotRunning { workflow_id: String },

    /// The state name is not registered on the workflow.
    #[error("[E041] Unknown workflow state: {state}")]
    UnknownState { state: String },

    /// The current state's guard refused the transition.
    #[error("[E042] Transition from '{from}' to '{to}' rejected by guard")]
    TransitionRejected { from: String, to: String },

    /// Checkpoint id not present on the workflow.
    #[error("[E043] Checkpoint not found: {checkpoint_id}")]
    CheckpointNotFound { checkpoint_id: String },

    /// General workflow error.
    #[error("[E044] Workflow error: {0}")]
    Workflow(String),

    // =========================================================================
    // COMMAND PROTOCOL ERRORS (E050-E059)
    // =========================================================================
    /// No response arrived before the response timeout.
    #[error("[E050] Command '{action}' to '{target}' timed out after {timeout_ms}ms")]
    CommandTimeout {
        target: String,
        action: String,
        timeout_ms: u64,
    },

    /// All retry attempts were spent.
    #[error("[E051] Command '{action}' failed after {attempts} attempts")]
    MaxRetriesExceeded { action: String, attempts: u32 },

    /// The agent must be started before it can send.
    #[error("[E052] Agent '{agent_id}' is not running")]
    AgentNotRunning { agent_id: String },

    // =========================================================================
    // I/O ERRORS (E070-E079)
    // =========================================================================
    /// File read error.
    #[error("[E070] Failed to read file: {path}")]
    FileReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// File write error.
    #[error("[E071] Failed to write file: {path}")]
    FileWriteError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Directory creation error.
    #[error("[E072] Failed to create directory: {path}")]
    DirectoryCreateError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// General I/O error.
    #[error("[E073] I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // SERIALIZATION ERRORS (E080-E089)
    // =========================================================================
    /// JSON serialization/deserialization error.
    #[error("[E080] JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parse error.
    #[error("[E081] TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    // =========================================================================
    // INTERNAL ERRORS (E090-E099)
    // =========================================================================
    /// An unexpected internal error occurred.
    #[error("[E090] Internal error: {message}")]
    Internal { message: String },
}

// =============================================================================
// CONSTRUCTOR METHODS
// =============================================================================

impl Error {
    /// Create a config file not found error.
    pub fn config_file_not_found(path: impl Into<String>) -> Self {
        Self::ConfigFileNotFound {
            path: path.into(),
            source: None,
        }
    }

    /// Create an invalid config value error.
    pub fn config_invalid_value(key: impl Into<String>, details: impl Into<String>) -> Self {
        Self::ConfigInvalidValue {
            key: key.into(),
            details: details.into(),
        }
    }

    /// Create an unknown correlation error.
    pub fn unknown_correlation(correlation_id: impl Into<String>) -> Self {
        Self::UnknownCorrelation {
            correlation_id: correlation_id.into(),
        }
    }

    /// Create a duplicate waiter error.
    pub fn duplicate_waiter(message_id: impl Into<String>) -> Self {
        Self::DuplicateWaiter {
            message_id: message_id.into(),
        }
    }

    /// Create an invalid message error.
    pub fn invalid_message(details: impl Into<String>) -> Self {
        Self::InvalidMessage {
            details: details.into(),
        }
    }

    /// Create a handler failure.
    pub fn handler_failed(handler_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::HandlerFailed {
            handler_id: handler_id.into(),
            message: message.into(),
        }
    }

    /// Create an unknown action error.
    pub fn unknown_action(action: impl Into<String>) -> Self {
        Self::UnknownAction {
            action: action.into(),
        }
    }

    /// Create a not implemented error.
    pub fn not_implemented(feature: impl Into<String>) -> Self {
        Self::NotImplemented {
            feature: feature.into(),
        }
    }

    /// Create an unknown workflow state error.
    pub fn unknown_state(state: impl Into<String>) -> Self {
        Self::UnknownState {
            state: state.into(),
        }
    }

    /// Create a file read error.
    pub fn file_read_error(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::FileReadError {
            path: path.into(),
            source,
        }
    }

    /// Create a file write error.
    pub fn file_write_error(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::FileWriteError {
            path: path.into(),
            source,
        }
    }

    /// Create a directory creation error.
    pub fn directory_create_error(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::DirectoryCreateError {
            path: path.into(),
            source,
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

// =============================================================================
// ERROR METADATA
// =============================================================================

impl Error {
    /// Get the error code (e.g., "E001").
    pub fn code(&self) -> &'static str {
        match self {
            // Configuration
            Self::ConfigFileNotFound { .. } => "E001",
            Self::ConfigInvalidFormat { .. } => "E002",
            Self::ConfigInvalidValue { .. } => "E003",
            Self::Config(_) => "E004",

            // Bus
            Self::BusNotRunning => "E010",
            Self::UnknownCorrelation { .. } => "E011",
            Self::DuplicateWaiter { .. } => "E012",
            Self::InvalidMessage { .. } => "E013",
            Self::ChannelClosed(_) => "E014",

            // Admission
            Self::RateLimited { .. } => "E020",
            Self::CircuitOpen { .. } => "E021",
            Self::CircuitHalfOpen { .. } => "E022",

            // Handler
            Self::HandlerFailed { .. } => "E030",
            Self::UnknownAction { .. } => "E031",
            Self::NotImplemented { .. } => "E032",
            Self::HandlerAborted { .. } => "E033",

            // Workflow
            Self::WorkflowNotRunning { .. } => "E040",
            Self::UnknownState { .. } => "E041",
            Self::TransitionRejected { .. } => "E042",
            Self::CheckpointNotFound { .. } => "E043",
            Self::Workflow(_) => "E044",

            // Command protocol
            Self::CommandTimeout { .. } => "E050",
            Self::MaxRetriesExceeded { .. } => "E051",
            Self::AgentNotRunning { .. } => "E052",

            // I/O
            Self::FileReadError { .. } => "E070",
            Self::FileWriteError { .. } => "E071",
            Self::DirectoryCreateError { .. } => "E072",
            Self::Io(_) => "E073",

            // Serialization
            Self::Json(_) => "E080",
            Self::Toml(_) => "E081",

            // Internal
            Self::Internal { .. } => "E090",
        }
    }

    /// Code used in the body of an ERROR message when this error crosses the bus.
    pub fn wire_code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => codes::RATE_LIMITED,
            Self::CircuitOpen { .. } => codes::CIRCUIT_OPEN,
            Self::CircuitHalfOpen { .. } => codes::CIRCUIT_HALF_OPEN,
            Self::CommandTimeout { .. } => codes::COMMAND_TIMEOUT,
            Self::MaxRetriesExceeded { .. } => codes::MAX_RETRIES_EXCEEDED,
            Self::UnknownAction { .. } => codes::UNKNOWN_COMMAND,
            Self::NotImplemented { .. } => codes::NOT_IMPLEMENTED,
            _ => codes::PROCESSING_ERROR,
        }
    }

    /// Get a suggestion for how to resolve the error.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::ConfigFileNotFound { .. } => Some(
                "Run `agent-bus config init` to write a default configuration file, \
                 or pass the path with --config",
            ),
            Self::ConfigInvalidFormat { .. } | Self::Toml(_) => {
                Some("Check the configuration file syntax. TOML format is required")
            }
            Self::ConfigInvalidValue { .. } | Self::Config(_) => {
                Some("Run `agent-bus config validate` to list the offending keys")
            }
            Self::BusNotRunning => Some("Call `MessageBus::start` before publishing"),
            Self::UnknownCorrelation { .. } => Some(
                "Replies must set correlation_id to the id of a message published on this bus",
            ),
            Self::DuplicateWaiter { .. } => {
                Some("Only one caller may wait for a given message id at a time")
            }
            Self::RateLimited { .. } => {
                Some("Retry after a short delay, or raise the destination's bucket rate")
            }
            Self::CircuitOpen { .. } | Self::CircuitHalfOpen { .. } => {
                Some("The destination is failing; retry after the circuit reset timeout")
            }
            Self::UnknownState { .. } => Some("Register the state with `Workflow::add_state` first"),
            Self::CheckpointNotFound { .. } => {
                Some("Create the checkpoint with `Workflow::create_checkpoint` before restoring")
            }
            Self::AgentNotRunning { .. } => Some("Call `BusAgent::start` before sending"),
            Self::CommandTimeout { .. } => {
                Some("Increase the response timeout or check that the target agent is running")
            }
            Self::FileReadError { .. } | Self::FileWriteError { .. } => {
                Some("Check that the persistence directory exists and is writable")
            }
            Self::DirectoryCreateError { .. } => {
                Some("Check permissions on the parent of the persistence directory")
            }
            _ => None,
        }
    }

    /// Get the CLI exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConfigFileNotFound { .. }
            | Self::ConfigInvalidFormat { .. }
            | Self::ConfigInvalidValue { .. }
            | Self::Config(_)
            | Self::Toml(_) => EXIT_CONFIG_ERROR,

            Self::BusNotRunning
            | Self::UnknownCorrelation { .. }
            | Self::DuplicateWaiter { .. }
            | Self::InvalidMessage { .. }
            | Self::ChannelClosed(_)
            | Self::RateLimited { .. }
            | Self::CircuitOpen { .. }
            | Self::CircuitHalfOpen { .. } => EXIT_BUS_ERROR,

            Self::HandlerFailed { .. }
            | Self::UnknownAction { .. }
            | Self::NotImplemented { .. }
            | Self::HandlerAborted { .. }
            | Self::CommandTimeout { .. }
            | Self::MaxRetriesExceeded { .. }
            | Self::AgentNotRunning { .. } => EXIT_COMMAND_ERROR,

            Self::WorkflowNotRunning { .. }
            | Self::UnknownState { .. }
            | Self::TransitionRejected { .. }
            | Self::CheckpointNotFound { .. }
            | Self::Workflow(_) => EXIT_WORKFLOW_ERROR,

            Self::FileReadError { .. }
            | Self::FileWriteError { .. }
            | Self::DirectoryCreateError { .. }
            | Self::Io(_)
            | Self::Json(_) => EXIT_IO_ERROR,

            Self::Internal { .. } => EXIT_INTERNAL_ERROR,
        }
    }

    /// Check if this error is recoverable (can be retried).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::CircuitOpen { .. }
                | Self::CircuitHalfOpen { .. }
                | Self::CommandTimeout { .. }
                | Self::Io(_)
        )
    }
}

// =============================================================================
// ERROR DISPLAY UTILITIES
// =============================================================================

/// Display an error in a user-friendly format with suggestions.
pub fn display_error(err: &Error) {
    eprintln!("\n\x1b[1;31mError:\x1b[0m {}\n", err);

    if let Some(suggestion) = err.suggestion() {
        eprintln!("\x1b[1;33mSuggestion:\x1b[0m {}\n", suggestion);
    }
}

// =============================================================================
// RESULT TYPE ALIAS
// =============================================================================

/// A Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::config_file_not_found("bus.toml").code(), "E001");
        assert_eq!(Error::BusNotRunning.code(), "E010");
        assert_eq!(Error::unknown_correlation("msg_1").code(), "E011");
        assert_eq!(Error::unknown_state("render").code(), "E041");
        assert_eq!(
            Error::MaxRetriesExceeded {
                action: "render".into(),
                attempts: 4
            }
            .code(),
            "E051"
        );
    }

    #[test]
    fn test_wire_codes() {
        assert_eq!(Error::unknown_action("fly").wire_code(), "UNKNOWN_COMMAND");
        assert_eq!(Error::not_implemented("query").wire_code(), "NOT_IMPLEMENTED");
        assert_eq!(
            Error::handler_failed("h1", "boom").wire_code(),
            "PROCESSING_ERROR"
        );
        assert_eq!(Error::internal("x").wire_code(), "PROCESSING_ERROR");
        assert_eq!(
            Error::RateLimited {
                key: "agent_b".into(),
                tokens: 2.0
            }
            .wire_code(),
            "RATE_LIMITED"
        );
    }

    #[test]
    fn test_error_suggestions() {
        let err = Error::unknown_state("render");
        assert!(err.suggestion().unwrap().contains("add_state"));
        assert!(Error::internal("x").suggestion().is_none());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            Error::config_file_not_found("x").exit_code(),
            EXIT_CONFIG_ERROR
        );
        assert_eq!(Error::BusNotRunning.exit_code(), EXIT_BUS_ERROR);
        assert_eq!(
            Error::unknown_action("x").exit_code(),
            EXIT_COMMAND_ERROR
        );
        assert_eq!(Error::unknown_state("x").exit_code(), EXIT_WORKFLOW_ERROR);
        assert_eq!(Error::internal("x").exit_code(), EXIT_INTERNAL_ERROR);
    }

    #[test]
    fn test_is_recoverable() {
        assert!(Error::CommandTimeout {
            target: "a".into(),
            action: "b".into(),
            timeout_ms: 10
        }
        .is_recoverable());
        assert!(Error::CircuitOpen {
            source_id: "a".into(),
            target: "b".into()
        }
        .is_recoverable());
        assert!(!Error::unknown_action("b").is_recoverable());
        assert!(!Error::BusNotRunning.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::duplicate_waiter("msg_42");
        let display = format!("{}", err);
        assert!(display.contains("E012"));
        assert!(display.contains("msg_42"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_bail_if() {
        fn check_load(load: f64) -> Result<f64> {
            bail_if!(load < 0.0, Error::invalid_message("negative load"));
            bail_if!(load > 1.0, Error::invalid_message("load above 1"));
            Ok(load)
        }

        assert!(check_load(-0.1).is_err());
        assert!(check_load(1.5).is_err());
        assert_eq!(check_load(0.5).unwrap(), 0.5);
    }
}
