//! Client Session Transport
//!
//! Clients hold one TCP connection to a play node and exchange length-prefixed
//! frames (see [`codec::client`]). Each accepted connection becomes a
//! [`ClientSession`] with a node-unique `sid`.
//!
//! ## Per-session tasks
//!
//! ```text
//!   socket ──▶ reader ──▶ SessionHandler::on_message (awaited inline)
//!   socket ◀── writer ◀── send queue ◀── ClientSession::send_response (any thread)
//! ```
//!
//! Because the reader awaits the handler before decoding the next frame,
//! requests from one client are handled strictly in arrival order. Anything
//! that must not stall the reader (stage work) is handed off by the handler.

mod server;

pub use server::{SessionServer, SessionServerConfig};

use crate::{Result, TransportError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use codec::ClientRequest;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::debug;
use types::Sid;

/// Callbacks for session lifecycle and inbound frames
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    async fn on_connect(&self, _session: &Arc<ClientSession>) {}

    /// Called once per decoded frame, in arrival order
    async fn on_message(&self, session: &Arc<ClientSession>, request: ClientRequest);

    async fn on_disconnect(&self, session: &Arc<ClientSession>);
}

/// Outbound half of a client session as seen by stage code
pub trait SessionSink: Send + Sync {
    fn sid(&self) -> Sid;

    fn is_connected(&self) -> bool;

    fn send_response(&self, msg_id: &str, msg_seq: u16, stage_id: &str, error_code: u16, payload: &[u8]) -> Result<()>;

    /// Close the connection; idempotent
    fn disconnect(&self);
}

/// One connected client
#[derive(Debug)]
pub struct ClientSession {
    sid: Sid,
    remote_addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Bytes>,
    connected: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl ClientSession {
    pub(crate) fn new(
        sid: Sid,
        remote_addr: SocketAddr,
        outbound: mpsc::UnboundedSender<Bytes>,
        shutdown: watch::Sender<bool>,
    ) -> Self {
        Self {
            sid,
            remote_addr,
            outbound,
            connected: AtomicBool::new(true),
            shutdown,
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Mark closed without signalling the tasks; used when the reader ends
    pub(crate) fn mark_closed(&self) -> bool {
        self.connected.swap(false, Ordering::AcqRel)
    }
}

impl SessionSink for ClientSession {
    fn sid(&self) -> Sid {
        self.sid
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn send_response(&self, msg_id: &str, msg_seq: u16, stage_id: &str, error_code: u16, payload: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(TransportError::closed(format!("session {}", self.sid)));
        }
        let mut frame = BytesMut::new();
        codec::encode_response(&mut frame, msg_id, msg_seq, stage_id, error_code, payload)?;
        self.outbound
            .send(frame.freeze())
            .map_err(|_| TransportError::closed(format!("session {}", self.sid)))
    }

    fn disconnect(&self) {
        if self.mark_closed() {
            debug!(sid = self.sid, remote = %self.remote_addr, "Disconnecting client session");
        }
        let _ = self.shutdown.send(true);
    }
}
