//! Bus error taxonomy.

use std::time::Duration;

use crate::broker::BrokerError;
use crate::bus::BusState;
use crate::codec::CodecError;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Error returned by application handlers and listeners.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("API '{0}' is already registered in this process")]
    DuplicateApi(String),

    #[error("API '{0}' not found; register or declare it before use")]
    ApiNotFound(String),

    #[error("Method '{method}' not found on API '{api}'")]
    MethodNotFound { api: String, method: String },

    #[error("Event '{event}' is not declared on API '{api}'")]
    UnknownEvent { api: String, event: String },

    #[error("Invalid parameters for {target}: expected {expected:?}, got {actual:?}")]
    InvalidParameters {
        target: String,
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("Invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Cannot listen for {api}.{event}: event delivery has already started")]
    ListenAfterStart { api: String, event: String },

    #[error(
        "Timeout after {timeout:?} calling {api}.{method}; the request may still execute. \
         It is possible no process is serving this API"
    )]
    RpcTimeout {
        api: String,
        method: String,
        timeout: Duration,
    },

    #[error("{api}.{method} failed remotely: {message}")]
    Remote {
        api: String,
        method: String,
        message: String,
        trace: Option<String>,
    },

    #[error("Bus is shutting down")]
    Shutdown,

    #[error("Operation not allowed while bus is {0}")]
    InvalidState(BusState),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
}

impl BusError {
    /// Programmer or configuration errors that retrying cannot fix.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            BusError::InvalidConfig(_)
                | BusError::DuplicateApi(_)
                | BusError::ApiNotFound(_)
                | BusError::MethodNotFound { .. }
                | BusError::UnknownEvent { .. }
                | BusError::InvalidParameters { .. }
                | BusError::InvalidName { .. }
                | BusError::ListenAfterStart { .. }
        )
    }
}

/// Render an error and its source chain, one cause per line.
pub fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut out = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        out.push_str("\ncaused by: ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
