//! System messages exchanged between nodes and with client connectors
//!
//! Stage lifecycle requests travel over the mesh with `is_system = true` and the
//! message ids in [`msg_ids`]. `AuthenticateRes` is the payload of the reply a
//! play node sends to a client after a successful authentication; connectors
//! read the resolved stage type from field 6 without decoding the rest.

/// Message ids of system messages
pub mod msg_ids {
    pub const CREATE_STAGE_REQ: &str = "CreateStageReq";
    pub const CREATE_STAGE_RES: &str = "CreateStageRes";
    pub const GET_OR_CREATE_STAGE_REQ: &str = "GetOrCreateStageReq";
    pub const GET_OR_CREATE_STAGE_RES: &str = "GetOrCreateStageRes";
    pub const DESTROY_STAGE_REQ: &str = "DestroyStageReq";
    pub const DESTROY_STAGE_RES: &str = "DestroyStageRes";
    pub const AUTHENTICATE_RES: &str = "AuthenticateRes";
    /// Empty-payload reply used when a stage-addressed request fails
    pub const ERROR_RES: &str = "ErrorRes";
}

#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct CreateStageReq {
    #[prost(string, tag = "1")]
    pub stage_type: String,
    #[prost(string, tag = "2")]
    pub payload_id: String,
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
}

#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct CreateStageRes {
    #[prost(bool, tag = "1")]
    pub result: bool,
    #[prost(string, tag = "2")]
    pub payload_id: String,
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
}

#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct GetOrCreateStageReq {
    #[prost(string, tag = "1")]
    pub stage_type: String,
    #[prost(string, tag = "2")]
    pub payload_id: String,
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
}

#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct GetOrCreateStageRes {
    #[prost(bool, tag = "1")]
    pub result: bool,
    /// True only for the caller whose request actually created the stage
    #[prost(bool, tag = "2")]
    pub is_created: bool,
    #[prost(string, tag = "3")]
    pub payload_id: String,
    #[prost(bytes = "vec", tag = "4")]
    pub payload: Vec<u8>,
}

#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct DestroyStageReq {
    #[prost(string, tag = "1")]
    pub reason: String,
}

/// Reply payload for a successful client authentication
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct AuthenticateRes {
    #[prost(string, tag = "1")]
    pub payload_id: String,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
    #[prost(int64, tag = "3")]
    pub account_id: i64,
    #[prost(string, tag = "4")]
    pub stage_id: String,
    #[prost(bool, tag = "5")]
    pub reconnected: bool,
    /// Read directly by connectors; keep at tag 6.
    #[prost(string, tag = "6")]
    pub stage_type: String,
}
