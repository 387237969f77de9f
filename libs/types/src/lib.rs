//! # PlayMesh Types
//!
//! Shared wire-level type definitions for every PlayMesh node.
//!
//! ## Contents
//!
//! - **Route header**: the protobuf-encoded header carried as the second part of
//!   every mesh frame ([`RouteHeader`]).
//! - **System messages**: stage lifecycle requests exchanged between nodes
//!   ([`CreateStageReq`], [`GetOrCreateStageReq`], [`DestroyStageReq`], ...).
//! - **Error codes**: the numeric error space shared by mesh replies and client
//!   responses ([`ErrorCode`]).
//! - **Stage modes**: how actors are placed into stages ([`StageMode`]).
//!
//! ## Dependency Rules
//!
//! This crate sits at the bottom of the workspace. It knows nothing about
//! sockets, buffers or the dispatcher; `codec` builds frames out of these types
//! and everything above it talks in terms of `codec` packets.

pub mod common;
pub mod protocol;

pub use common::errors::{ErrorCode, UnknownErrorCode};
pub use common::identifiers::{single_stage_id, AccountId, ServerId, Sid, StageMode};
pub use protocol::header::RouteHeader;
pub use protocol::system::{
    msg_ids, AuthenticateRes, CreateStageReq, CreateStageRes, DestroyStageReq,
    GetOrCreateStageReq, GetOrCreateStageRes,
};
