//! # PlayMesh Network
//!
//! Transport layer shared by every node:
//!
//! - [`mesh`]: router-style TCP socket between nodes with identity routing and
//!   a readiness handshake
//! - [`communicator`]: single drain thread in front of the mesh socket that
//!   defers packets for peers that are not ready yet
//! - [`request_cache`]: sequence allocation and reply correlation with
//!   exactly-once completion
//! - [`session`]: client-facing TCP sessions with length-prefixed frames
//!
//! Transport failures are logged where they happen; only request outcomes
//! ([`RequestError`]) are surfaced to application code.

pub mod communicator;
pub mod error;
pub mod mesh;
pub mod request_cache;
pub mod session;

pub use communicator::{CommunicatorConfig, CommunicatorStats, NodeCommunicator, PacketSender};
pub use error::{RequestError, Result, TransportError};
pub use mesh::{MeshReceiver, MeshSocketConfig, PeerReadiness, PlaySocket, TcpPlaySocket};
pub use request_cache::{ReplyFuture, ReplyResult, RequestCache};
pub use session::{ClientSession, SessionHandler, SessionServer, SessionServerConfig, SessionSink};
