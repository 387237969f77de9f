//! Transport Error Types
//!
//! Error handling for the mesh socket, node communicator, request correlation
//! and client session transport. Transport errors are logged at the point they
//! occur and never propagate into the stage dispatcher; request errors are the
//! ones application code actually observes.

use codec::CodecError;
use thiserror::Error;

/// Main transport error type
#[derive(Error, Debug)]
pub enum TransportError {
    /// Listener or socket setup failures
    #[error("Network error: {message}")]
    Network {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A dial was refused or an established connection failed
    #[error("Connection error: {message} (endpoint: {endpoint})")]
    Connection {
        message: String,
        endpoint: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Framing and serialization errors
    #[error("Protocol error: {message}")]
    Protocol {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    #[error("Timeout error: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Component already shut down
    #[error("Closed: {component}")]
    Closed { component: String },

    #[error("I/O error: {message}")]
    Io {
        message: String,
        source: std::io::Error,
    },
}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

impl TransportError {
    pub fn network_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn connection_with_source(
        message: impl Into<String>,
        endpoint: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            endpoint: endpoint.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn closed(component: impl Into<String>) -> Self {
        Self::Closed {
            component: component.into(),
        }
    }

    /// Whether retrying the same operation later can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Network { .. }
            | TransportError::Connection { .. }
            | TransportError::Timeout { .. }
            | TransportError::Io { .. } => true,
            TransportError::Protocol { .. } | TransportError::Configuration { .. } | TransportError::Closed { .. } => {
                false
            }
        }
    }

    /// Get error category for log fields
    pub fn category(&self) -> &'static str {
        match self {
            TransportError::Network { .. } => "network",
            TransportError::Connection { .. } => "connection",
            TransportError::Protocol { .. } => "protocol",
            TransportError::Configuration { .. } => "configuration",
            TransportError::Timeout { .. } => "timeout",
            TransportError::Closed { .. } => "closed",
            TransportError::Io { .. } => "io",
        }
    }
}

/// Convert standard I/O errors to transport errors
impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        TransportError::Io {
            message: error.to_string(),
            source: error,
        }
    }
}

/// Frame errors surface as protocol errors
impl From<CodecError> for TransportError {
    fn from(error: CodecError) -> Self {
        TransportError::Protocol {
            message: error.to_string(),
            source: Some(Box::new(error)),
        }
    }
}

/// Outcome of a request that did not produce a successful reply
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// Deadline elapsed before a reply arrived
    #[error("Request {msg_id} (seq {msg_seq}) timed out after {timeout_ms}ms")]
    Timeout {
        msg_seq: u16,
        msg_id: String,
        timeout_ms: u64,
    },

    /// Owner went away before a reply arrived
    #[error("Request seq {msg_seq} cancelled: {reason}")]
    Cancelled { msg_seq: u16, reason: String },

    /// Peer replied with a non-zero error code
    #[error("Request {msg_id} (seq {msg_seq}) failed with error code {error_code}")]
    ErrorReply {
        msg_seq: u16,
        msg_id: String,
        error_code: u16,
    },

    /// Every sequence id is in flight
    #[error("No free request sequence ids ({in_flight} requests in flight)")]
    SequenceExhausted { in_flight: usize },
}

impl RequestError {
    pub fn category(&self) -> &'static str {
        match self {
            RequestError::Timeout { .. } => "timeout",
            RequestError::Cancelled { .. } => "cancelled",
            RequestError::ErrorReply { .. } => "error_reply",
            RequestError::SequenceExhausted { .. } => "sequence_exhausted",
        }
    }
}
