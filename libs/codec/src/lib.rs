//! # PlayMesh Codec
//!
//! ## Purpose
//!
//! The "rules" layer between raw bytes and the runtime:
//! - pooled payload buffers with exactly-once return ([`buffers`])
//! - application and mesh packets with move-only ownership ([`packet`])
//! - multi-part mesh frame encoding and validation ([`route`])
//! - length-prefixed client-session frames ([`client`])
//! - connector-side stage-type extraction from authentication replies ([`auth`])
//!
//! ## Architecture Role
//!
//! ```text
//! libs/types → [codec] → libs/network → libs/actors
//!     ↑           ↓            ↓
//! RouteHeader  Frames      Sockets, queues,
//! messages     Buffers     request correlation
//! ```
//!
//! Nothing in this crate performs I/O. Decoders work on `BytesMut` buffers
//! filled by the transports and report either "need more bytes" or a
//! [`CodecError`].

pub mod auth;
pub mod buffers;
pub mod client;
pub mod error;
pub mod packet;
pub mod route;

pub use auth::extract_stage_type;
pub use buffers::{BufferPool, Payload, PoolConfig, PoolStats, PooledBuffer};
pub use client::{encode_request, encode_response, ClientFrameDecoder, ClientRequest, ClientResponse};
pub use error::{CodecError, Result};
pub use packet::{Packet, RoutePacket};
pub use route::{Inbound, MeshFrame, Multipart, MultipartDecoder};
