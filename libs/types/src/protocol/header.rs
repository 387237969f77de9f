//! Route header carried as part 2 of every mesh frame
//!
//! ```text
//! ┌──────────────┬──────────────────────────┬─────────────────────┐
//! │ part 1       │ part 2                   │ part 3              │
//! │ identity     │ RouteHeader (protobuf)   │ payload             │
//! │ (sender id)  │ payload_size = len(p3)   │ exactly p2.size     │
//! └──────────────┴──────────────────────────┴─────────────────────┘
//! ```
//!
//! A zero-length part 2 is a readiness probe and carries no payload part.

use crate::common::errors::ErrorCode;
use crate::common::identifiers::{AccountId, Sid};

/// Protobuf route header. Sequence, service and error fields are `u16` values
/// carried in `uint32` slots; use the typed accessors.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct RouteHeader {
    /// Correlation id, 0 = fire-and-forget
    #[prost(uint32, tag = "1")]
    pub msg_seq: u32,
    #[prost(uint32, tag = "2")]
    pub service_id: u32,
    #[prost(string, tag = "3")]
    pub msg_id: String,
    /// Mesh identity of the sending node
    #[prost(string, tag = "4")]
    pub from: String,
    /// Empty when the frame is not stage-addressed
    #[prost(string, tag = "5")]
    pub stage_id: String,
    #[prost(int64, tag = "6")]
    pub account_id: i64,
    #[prost(int64, tag = "7")]
    pub sid: i64,
    #[prost(bool, tag = "8")]
    pub is_reply: bool,
    #[prost(bool, tag = "9")]
    pub is_system: bool,
    #[prost(uint32, tag = "10")]
    pub error_code: u32,
    /// Overwritten by the codec with the real payload length at encode time
    #[prost(uint32, tag = "11")]
    pub payload_size: u32,
}

impl RouteHeader {
    /// Header for a new outbound message
    pub fn new(msg_id: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            msg_id: msg_id.into(),
            from: from.into(),
            ..Default::default()
        }
    }

    pub fn with_seq(mut self, msg_seq: u16) -> Self {
        self.msg_seq = u32::from(msg_seq);
        self
    }

    pub fn with_stage(mut self, stage_id: impl Into<String>) -> Self {
        self.stage_id = stage_id.into();
        self
    }

    pub fn with_account(mut self, account_id: AccountId) -> Self {
        self.account_id = account_id;
        self
    }

    pub fn with_sid(mut self, sid: Sid) -> Self {
        self.sid = sid;
        self
    }

    pub fn with_service(mut self, service_id: u16) -> Self {
        self.service_id = u32::from(service_id);
        self
    }

    pub fn system(mut self) -> Self {
        self.is_system = true;
        self
    }

    /// Header for the reply to `self`, sent from `from`.
    ///
    /// The reply keeps the request's sequence, stage and session routing fields.
    pub fn reply(&self, msg_id: impl Into<String>, from: impl Into<String>, error: ErrorCode) -> Self {
        Self {
            msg_seq: self.msg_seq,
            service_id: self.service_id,
            msg_id: msg_id.into(),
            from: from.into(),
            stage_id: self.stage_id.clone(),
            account_id: self.account_id,
            sid: self.sid,
            is_reply: true,
            is_system: self.is_system,
            error_code: u32::from(error.as_u16()),
            payload_size: 0,
        }
    }

    pub fn seq(&self) -> u16 {
        self.msg_seq as u16
    }

    pub fn service(&self) -> u16 {
        self.service_id as u16
    }

    pub fn error(&self) -> u16 {
        self.error_code as u16
    }

    pub fn is_stage_addressed(&self) -> bool {
        !self.stage_id.is_empty()
    }
}
