//! Frame-level codec errors
//!
//! Every variant describes a frame that must not be processed further: the mesh
//! receive path drops the message, the client session closes the connection.

use thiserror::Error;

/// Errors raised while encoding or decoding wire frames
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CodecError {
    /// Buffer ended before a declared field
    #[error("Frame truncated: need {need} bytes, got {got} (context: {context})")]
    Truncated {
        need: usize,
        got: usize,
        context: &'static str,
    },

    /// Declared size is larger than the configured maximum
    #[error("Frame too large: {size} bytes exceeds maximum {max}")]
    TooLarge { size: usize, max: usize },

    /// Declared size is negative or otherwise nonsensical
    #[error("Invalid length {value} for {field}")]
    InvalidLength { field: &'static str, value: i64 },

    /// Header payload_size disagrees with the payload part actually received
    #[error("Payload size mismatch: header declares {declared} bytes, frame carries {actual}")]
    PayloadSizeMismatch { declared: usize, actual: usize },

    /// Multi-part message did not have the expected number of parts
    #[error("Unexpected part count: expected {expected}, got {got}")]
    PartCount { expected: &'static str, got: usize },

    /// Identifier field was not valid UTF-8
    #[error("Invalid UTF-8 in {field}")]
    InvalidUtf8 { field: &'static str },

    /// Field does not fit its length prefix
    #[error("{field} too long: {len} bytes exceeds {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    /// Protobuf decoding failed
    #[error("Protobuf decode failed for {message}: {reason}")]
    Protobuf {
        message: &'static str,
        reason: String,
    },

    /// Header is missing a mandatory field
    #[error("Missing required field {field}")]
    MissingField { field: &'static str },
}

impl CodecError {
    pub fn truncated(need: usize, got: usize, context: &'static str) -> Self {
        Self::Truncated { need, got, context }
    }

    pub fn protobuf(message: &'static str, err: prost::DecodeError) -> Self {
        Self::Protobuf {
            message,
            reason: err.to_string(),
        }
    }

    /// Error category for log fields
    pub fn category(&self) -> &'static str {
        match self {
            CodecError::Truncated { .. } => "truncated",
            CodecError::TooLarge { .. } => "too_large",
            CodecError::InvalidLength { .. } => "invalid_length",
            CodecError::PayloadSizeMismatch { .. } => "payload_size",
            CodecError::PartCount { .. } => "part_count",
            CodecError::InvalidUtf8 { .. } => "utf8",
            CodecError::FieldTooLong { .. } => "field_too_long",
            CodecError::Protobuf { .. } => "protobuf",
            CodecError::MissingField { .. } => "missing_field",
        }
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;
