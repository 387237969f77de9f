//! Wire error codes
//!
//! Every mesh reply and client response carries a `u16` error code. Zero means
//! success; the remaining values are shared by all node types so a client
//! connector can interpret failures without knowing which node produced them.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

/// Error codes carried in `RouteHeader::error_code` and client response frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum ErrorCode {
    Success = 0,
    /// Unclassified server-side failure
    SystemError = 1,
    /// Payload could not be parsed by the receiving handler
    InvalidPayload = 2,
    /// Target stage does not exist (or never finished creation)
    StageNotFound = 3,
    /// Request deadline elapsed without a reply
    RequestTimeout = 4,
    /// CreateStage for an id that is already created
    StageAlreadyExists = 5,
    /// No factory registered for the requested stage type
    InvalidStageType = 6,
    /// Stage join hook declined the actor
    JoinStageRejected = 7,
    /// A stage or actor hook returned an error
    HookFailure = 8,
    /// Request abandoned because its owning stage was destroyed
    RequestCancelled = 9,
    /// Actor authentication hook declined or produced an incomplete context
    AuthenticationFailed = 10,
    /// Client sent a stage message before authenticating
    NotAuthenticated = 11,
    /// Stage creation hook reported failure
    StageCreationFailed = 12,
}

/// Raised when a numeric code is outside the known range
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("unknown error code {0}")]
pub struct UnknownErrorCode(pub u16);

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        self.into()
    }

    pub fn from_u16(code: u16) -> Result<Self, UnknownErrorCode> {
        Self::try_from(code).map_err(|_| UnknownErrorCode(code))
    }

    pub fn is_success(self) -> bool {
        self == ErrorCode::Success
    }
}
