//! Inter-Node Mesh Socket
//!
//! Router-style messaging between nodes. Every node binds one endpoint and dials
//! the endpoints of the peers it talks to. Messages are addressed by the peer's
//! mesh identity (its server id), not by connection.
//!
//! ## Readiness Handshake
//!
//! A dialed connection exists before the peer can actually route replies back.
//! Each side therefore announces itself with a readiness probe (a message with
//! a zero-length header) as soon as a connection is established, and a peer is
//! only considered ready once a frame from it has been observed:
//!
//! ```text
//!  node A                                node B
//!    │── connect(endpoint_B, "B") ─────────▶│  readiness[B] = false
//!    │── probe(identity = "A") ────────────▶│  readiness[A] = true
//!    │◀──────────── probe(identity = "B") ──│
//!    │  readiness[B] = true                 │
//! ```
//!
//! Sends to a peer that is not ready are deferred by the
//! [`NodeCommunicator`](crate::communicator::NodeCommunicator), never dropped.
//!
//! ## Threading
//!
//! [`PlaySocket::send`] is only called from the communicator's drain thread.
//! The readiness table is owned by the socket: it is written by the receive
//! path and by connect/disconnect, and only read elsewhere.

pub mod tcp;

use crate::Result;
use codec::RoutePacket;
use dashmap::DashMap;
use std::sync::Arc;

pub use tcp::{MeshReceiver, MeshSocketConfig, TcpPlaySocket};

/// Sending side of a mesh socket
pub trait PlaySocket: Send + Sync {
    /// Mesh identity of this node
    fn server_id(&self) -> &str;

    /// Send `packet` to the peer with identity `target`.
    ///
    /// Failures (unknown route, closed connection) are logged and the packet is
    /// dropped; they are never returned to the caller.
    fn send(&self, target: &str, packet: RoutePacket);

    /// Start connecting to `endpoint`, expected to be served by `peer_id`
    fn connect(&self, endpoint: &str, peer_id: &str) -> Result<()>;

    /// Stop connecting to / drop the connection to `endpoint`
    fn disconnect(&self, endpoint: &str) -> Result<()>;

    fn is_peer_ready(&self, peer_id: &str) -> bool;

    fn mark_peer_not_ready(&self, peer_id: &str);
}

/// Per-peer readiness flags
///
/// The empty peer id is always ready so that packets without a routing target
/// are never deferred forever.
#[derive(Debug, Clone, Default)]
pub struct PeerReadiness {
    peers: Arc<DashMap<String, bool>>,
}

impl PeerReadiness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self, peer_id: &str) -> bool {
        peer_id.is_empty() || self.peers.get(peer_id).map(|ready| *ready).unwrap_or(false)
    }

    /// Returns true when the flag changed
    pub fn mark_ready(&self, peer_id: &str) -> bool {
        if peer_id.is_empty() {
            return false;
        }
        match self.peers.get_mut(peer_id) {
            Some(ready) if *ready => false,
            Some(mut ready) => {
                *ready = true;
                true
            }
            None => {
                self.peers.insert(peer_id.to_string(), true);
                true
            }
        }
    }

    pub fn mark_not_ready(&self, peer_id: &str) {
        if let Some(mut ready) = self.peers.get_mut(peer_id) {
            *ready = false;
        }
    }

    pub fn ready_peers(&self) -> Vec<String> {
        self.peers
            .iter()
            .filter(|entry| *entry.value())
            .map(|entry| entry.key().clone())
            .collect()
    }
}
