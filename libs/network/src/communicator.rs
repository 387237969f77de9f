//! Node Communicator
//!
//! Multi-producer front door to the mesh socket. Any thread may call
//! [`NodeCommunicator::send`]; the call only enqueues. A single dedicated drain
//! thread owns every call to [`PlaySocket::send`].
//!
//! ## Drain Pass
//!
//! ```text
//!            ┌────────────── deferred (older first) ─────────────┐
//!            ▼                                                    │
//! queue ──▶ batch ──▶ target ready and nothing older deferred? ──┤ no
//!                           │ yes                                 │
//!                           ▼                                     │
//!                     socket.send()              sleep(backoff) ──┘
//! ```
//!
//! Packets for a peer that is not ready yet are deferred, never dropped. Once a
//! peer has a deferred packet, newer packets for that peer in the same pass are
//! deferred behind it, so per-peer order is preserved across the handshake.
//!
//! ## Shutdown
//!
//! [`NodeCommunicator::stop`] stops the drain thread and disposes every packet
//! still queued or deferred; the count is logged. Sends after stop are
//! disposed immediately.

use crate::mesh::PlaySocket;
use crate::{Result, TransportError};
use codec::RoutePacket;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Anything that can put a packet on the mesh
pub trait PacketSender: Send + Sync {
    /// Mesh identity used as `from` in outbound headers
    fn server_id(&self) -> &str;

    /// Enqueue `packet` for `target`; never blocks, never fails visibly
    fn send(&self, target: &str, packet: RoutePacket);
}

/// Communicator tuning
#[derive(Debug, Clone)]
pub struct CommunicatorConfig {
    /// Sleep between passes while packets are deferred
    pub backoff: Duration,
    /// How long the idle drain thread blocks before re-checking for stop
    pub idle_poll: Duration,
}

impl Default for CommunicatorConfig {
    fn default() -> Self {
        Self {
            backoff: Duration::from_millis(1),
            idle_poll: Duration::from_millis(50),
        }
    }
}

/// Counters reported by the drain thread
#[derive(Debug, Default)]
pub struct CommunicatorStats {
    pub sent: AtomicU64,
    pub deferred: AtomicU64,
    pub disposed: AtomicU64,
}

struct SendRequest {
    target: String,
    packet: RoutePacket,
}

/// Single-writer mesh sender with readiness-aware deferral
pub struct NodeCommunicator {
    server_id: String,
    socket: Arc<dyn PlaySocket>,
    queue: Sender<SendRequest>,
    connected: DashMap<String, String>,
    running: Arc<AtomicBool>,
    drain: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<CommunicatorStats>,
}

impl NodeCommunicator {
    /// Start the drain thread
    pub fn start(socket: Arc<dyn PlaySocket>, config: CommunicatorConfig) -> Result<Arc<Self>> {
        let server_id = socket.server_id().to_string();
        let (tx, rx) = crossbeam_channel::unbounded();
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(CommunicatorStats::default());

        let drain = {
            let socket = Arc::clone(&socket);
            let running = Arc::clone(&running);
            let stats = Arc::clone(&stats);
            std::thread::Builder::new()
                .name(format!("mesh-send-{server_id}"))
                .spawn(move || drain_loop(socket, rx, running, stats, config))
                .map_err(|e| TransportError::network_with_source("Failed to spawn mesh drain thread", e))?
        };

        info!(server_id = %server_id, "Node communicator started");
        Ok(Arc::new(Self {
            server_id,
            socket,
            queue: tx,
            connected: DashMap::new(),
            running,
            drain: Mutex::new(Some(drain)),
            stats,
        }))
    }

    /// Connect to `peer_id` at `address`. Connecting an address twice is a no-op.
    pub fn connect(&self, peer_id: &str, address: &str) -> Result<()> {
        if self.connected.contains_key(address) {
            debug!(peer = %peer_id, address = %address, "Already connected");
            return Ok(());
        }
        self.socket.mark_peer_not_ready(peer_id);
        self.socket.connect(address, peer_id)?;
        self.connected.insert(address.to_string(), peer_id.to_string());
        Ok(())
    }

    /// Disconnect from `address`. Unknown addresses are ignored.
    pub fn disconnect(&self, address: &str) -> Result<()> {
        let Some((_, peer_id)) = self.connected.remove(address) else {
            return Ok(());
        };
        self.socket.mark_peer_not_ready(&peer_id);
        self.socket.disconnect(address)
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.connected.contains_key(address)
    }

    pub fn is_peer_ready(&self, peer_id: &str) -> bool {
        self.socket.is_peer_ready(peer_id)
    }

    pub fn stats(&self) -> &CommunicatorStats {
        &self.stats
    }

    /// Stop the drain thread and dispose undelivered packets
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.drain.lock().take() {
            if handle.join().is_err() {
                warn!(server_id = %self.server_id, "Mesh drain thread panicked");
            }
        }
        info!(
            server_id = %self.server_id,
            sent = self.stats.sent.load(Ordering::Relaxed),
            disposed = self.stats.disposed.load(Ordering::Relaxed),
            "Node communicator stopped"
        );
    }
}

impl PacketSender for NodeCommunicator {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    fn send(&self, target: &str, packet: RoutePacket) {
        let request = SendRequest {
            target: target.to_string(),
            packet,
        };
        let rejected = if self.running.load(Ordering::Acquire) {
            self.queue.send(request).err().map(|e| e.into_inner())
        } else {
            Some(request)
        };
        if let Some(request) = rejected {
            self.stats.disposed.fetch_add(1, Ordering::Relaxed);
            debug!(peer = %request.target, msg_id = %request.packet.header.msg_id, "Communicator stopped, packet disposed");
        }
    }
}

impl Drop for NodeCommunicator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn drain_loop(
    socket: Arc<dyn PlaySocket>,
    rx: Receiver<SendRequest>,
    running: Arc<AtomicBool>,
    stats: Arc<CommunicatorStats>,
    config: CommunicatorConfig,
) {
    let mut deferred: VecDeque<SendRequest> = VecDeque::new();

    while running.load(Ordering::Acquire) {
        let mut batch = std::mem::take(&mut deferred);
        if batch.is_empty() {
            match rx.recv_timeout(config.idle_poll) {
                Ok(request) => batch.push_back(request),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        batch.extend(rx.try_iter());

        let mut blocked: HashSet<String> = HashSet::new();
        for request in batch {
            if blocked.contains(&request.target) || !socket.is_peer_ready(&request.target) {
                blocked.insert(request.target.clone());
                deferred.push_back(request);
                continue;
            }
            socket.send(&request.target, request.packet);
            stats.sent.fetch_add(1, Ordering::Relaxed);
        }

        if !deferred.is_empty() {
            stats.deferred.fetch_add(deferred.len() as u64, Ordering::Relaxed);
            std::thread::sleep(config.backoff);
        }
    }

    let leftover = deferred.len() + rx.try_iter().count();
    if leftover > 0 {
        stats.disposed.fetch_add(leftover as u64, Ordering::Relaxed);
        warn!(server_id = %socket.server_id(), leftover, "Disposed undelivered mesh packets at shutdown");
    }
}
