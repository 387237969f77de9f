//! Errors surfaced by the stage dispatcher

use codec::Packet;
use network::RequestError;
use thiserror::Error;
use types::ErrorCode;

#[derive(Error, Debug)]
pub enum StageError {
    /// A stage with this id is already created
    #[error("Stage {stage_id} already exists")]
    AlreadyExists { stage_id: String },

    /// No factory registered for the stage type
    #[error("Unknown stage type {stage_type}")]
    UnknownType { stage_type: String },

    #[error("Stage {stage_id} not found")]
    StageNotFound { stage_id: String },

    /// The creation hook declined; carries the hook's reply, if any
    #[error("Stage {stage_id} declined creation")]
    CreateDeclined { stage_id: String, reply: Option<Packet> },

    /// The join hook declined the actor
    #[error("Stage {stage_id} rejected account {account_id}")]
    Rejected { stage_id: String, account_id: i64 },

    /// A stage or actor hook returned an error
    #[error("{hook} failed on stage {stage_id}: {message}")]
    HookFailure {
        stage_id: String,
        hook: &'static str,
        message: String,
    },

    #[error("Cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("Request {msg_id} timed out after {timeout_ms}ms")]
    Timeout { msg_id: String, timeout_ms: u64 },

    /// The peer answered with a non-zero error code
    #[error("Request {msg_id} failed with error code {error_code}")]
    ErrorReply { msg_id: String, error_code: u16 },

    /// The dispatcher has shut down
    #[error("Dispatcher closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, StageError>;

impl StageError {
    pub fn hook_failure(stage_id: &str, hook: &'static str, error: anyhow::Error) -> Self {
        Self::HookFailure {
            stage_id: stage_id.to_string(),
            hook,
            message: format!("{error:#}"),
        }
    }

    pub fn not_found(stage_id: &str) -> Self {
        Self::StageNotFound {
            stage_id: stage_id.to_string(),
        }
    }

    /// Wire error code used when this error is turned into a reply
    pub fn error_code(&self) -> ErrorCode {
        match self {
            StageError::AlreadyExists { .. } => ErrorCode::StageAlreadyExists,
            StageError::UnknownType { .. } => ErrorCode::InvalidStageType,
            StageError::StageNotFound { .. } => ErrorCode::StageNotFound,
            StageError::CreateDeclined { .. } => ErrorCode::StageCreationFailed,
            StageError::Rejected { .. } => ErrorCode::JoinStageRejected,
            StageError::HookFailure { .. } => ErrorCode::HookFailure,
            StageError::Cancelled { .. } => ErrorCode::RequestCancelled,
            StageError::Timeout { .. } => ErrorCode::RequestTimeout,
            StageError::ErrorReply { error_code, .. } => {
                ErrorCode::from_u16(*error_code).unwrap_or(ErrorCode::SystemError)
            }
            StageError::Closed => ErrorCode::SystemError,
        }
    }
}

impl From<RequestError> for StageError {
    fn from(error: RequestError) -> Self {
        match error {
            RequestError::Timeout { msg_id, timeout_ms, .. } => StageError::Timeout { msg_id, timeout_ms },
            RequestError::Cancelled { reason, .. } => StageError::Cancelled { reason },
            RequestError::ErrorReply { msg_id, error_code, .. } => StageError::ErrorReply { msg_id, error_code },
            RequestError::SequenceExhausted { in_flight } => StageError::Cancelled {
                reason: format!("no free request sequence ids ({in_flight} in flight)"),
            },
        }
    }
}
