//! TCP Mesh Socket Implementation
//!
//! Router-style mesh socket over plain TCP. One listener accepts peers, one
//! dial task per configured endpoint keeps an outbound connection alive, and
//! every live connection gets a reader task and a writer task.
//!
//! Routes are keyed by the identity the peer announces in part 1 of its
//! frames. When a peer shows up on a newer connection its route is handed over
//! to that connection; the old connection keeps draining reads until it closes.

use super::{PeerReadiness, PlaySocket};
use crate::{Result, TransportError};
use bytes::BytesMut;
use codec::{BufferPool, Inbound, MeshFrame, Multipart, MultipartDecoder, RoutePacket};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Mesh socket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshSocketConfig {
    /// Address the listener binds to (`host:port`, port 0 for ephemeral)
    pub bind_endpoint: String,
    /// Upper bound on a single `receive()` call
    pub receive_timeout: Duration,
    /// Dial attempt timeout
    pub connect_timeout: Duration,
    /// Pause between dial attempts after a failure or disconnect
    pub reconnect_interval: Duration,
    /// Largest accepted frame part
    pub max_part_size: usize,
    /// Initial capacity of per-connection read/write buffers
    pub buffer_size: usize,
}

impl Default for MeshSocketConfig {
    fn default() -> Self {
        Self {
            bind_endpoint: "127.0.0.1:0".to_string(),
            receive_timeout: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(5),
            reconnect_interval: Duration::from_millis(200),
            max_part_size: 16 * 1024 * 1024, // 16MB
            buffer_size: 64 * 1024,          // 64KB
        }
    }
}

/// Message handed from connection readers to the receiver
#[derive(Debug)]
struct RawInbound {
    conn_id: u64,
    message: Multipart,
}

#[derive(Debug, Clone)]
struct Route {
    conn_id: u64,
    tx: mpsc::UnboundedSender<MeshFrame>,
}

struct Dial {
    peer_id: String,
    task: JoinHandle<()>,
}

struct SocketInner {
    server_id: String,
    config: MeshSocketConfig,
    local_addr: SocketAddr,
    readiness: PeerReadiness,
    routes: Arc<DashMap<String, Route>>,
    dials: DashMap<String, Dial>,
    connections: DashMap<u64, JoinHandle<()>>,
    inbound_tx: mpsc::UnboundedSender<RawInbound>,
    next_conn_id: AtomicU64,
    closed: AtomicBool,
    runtime: Handle,
    accept_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Router-style mesh socket over TCP
#[derive(Clone)]
pub struct TcpPlaySocket {
    inner: Arc<SocketInner>,
}

/// Receiving side of a [`TcpPlaySocket`]
pub struct MeshReceiver {
    rx: mpsc::UnboundedReceiver<RawInbound>,
    readiness: PeerReadiness,
    routes: Arc<DashMap<String, Route>>,
    pool: Arc<BufferPool>,
    receive_timeout: Duration,
    server_id: String,
}

impl TcpPlaySocket {
    /// Bind the listener and start accepting peers.
    ///
    /// Must be called from within a tokio runtime; the runtime handle is kept
    /// so that `connect` may be called from any thread afterwards.
    pub async fn bind(server_id: impl Into<String>, config: MeshSocketConfig) -> Result<(Self, MeshReceiver)> {
        let server_id = server_id.into();
        if server_id.is_empty() {
            return Err(TransportError::configuration("server id must not be empty", Some("server_id")));
        }

        let listener = TcpListener::bind(&config.bind_endpoint).await.map_err(|e| {
            TransportError::network_with_source(format!("Failed to bind mesh endpoint {}", config.bind_endpoint), e)
        })?;
        let local_addr = listener.local_addr()?;
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let readiness = PeerReadiness::new();
        let pool = BufferPool::global();
        let routes = Arc::new(DashMap::new());

        let inner = Arc::new(SocketInner {
            server_id: server_id.clone(),
            config: config.clone(),
            local_addr,
            readiness: readiness.clone(),
            routes: Arc::clone(&routes),
            dials: DashMap::new(),
            connections: DashMap::new(),
            inbound_tx,
            next_conn_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            runtime: Handle::current(),
            accept_task: parking_lot::Mutex::new(None),
        });

        let accept_inner = Arc::clone(&inner);
        let accept_task = tokio::spawn(async move { accept_loop(accept_inner, listener).await });
        *inner.accept_task.lock() = Some(accept_task);

        info!(server_id = %server_id, endpoint = %local_addr, "Mesh socket bound");

        let receiver = MeshReceiver {
            rx: inbound_rx,
            readiness,
            routes,
            pool,
            receive_timeout: config.receive_timeout,
            server_id,
        };
        Ok((Self { inner }, receiver))
    }

    /// Address the listener actually bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn readiness(&self) -> &PeerReadiness {
        &self.inner.readiness
    }

    pub fn route_count(&self) -> usize {
        self.inner.routes.len()
    }

    /// Stop accepting, cancel dials and drop every connection
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.inner.accept_task.lock().take() {
            task.abort();
        }
        self.inner.dials.iter().for_each(|dial| dial.task.abort());
        self.inner.dials.clear();
        self.inner.connections.iter().for_each(|conn| conn.value().abort());
        self.inner.connections.clear();
        self.inner.routes.clear();
        info!(server_id = %self.inner.server_id, "Mesh socket closed");
    }
}

impl PlaySocket for TcpPlaySocket {
    fn server_id(&self) -> &str {
        &self.inner.server_id
    }

    fn send(&self, target: &str, packet: RoutePacket) {
        let inner = &self.inner;
        let msg_id = packet.header.msg_id.clone();

        let frame = match MeshFrame::from_packet(&inner.server_id, packet) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(peer = %target, msg_id = %msg_id, error = %e, "Dropping unencodable mesh packet");
                return;
            }
        };

        if target == inner.server_id {
            // Loopback: deliver straight to our own receiver.
            let mut wire = BytesMut::with_capacity(frame.encoded_len());
            frame.write_to(&mut wire);
            match MultipartDecoder::new(inner.config.max_part_size).decode(&mut wire) {
                Ok(Some(message)) => {
                    let _ = inner.inbound_tx.send(RawInbound { conn_id: 0, message });
                }
                Ok(None) | Err(_) => warn!(msg_id = %msg_id, "Loopback frame failed to decode"),
            }
            return;
        }

        let Some(route) = inner.routes.get(target).map(|r| r.value().clone()) else {
            warn!(peer = %target, msg_id = %msg_id, "Unroutable mesh packet dropped: no connection for peer");
            return;
        };
        if route.tx.send(frame).is_err() {
            warn!(peer = %target, msg_id = %msg_id, conn_id = route.conn_id, "Mesh connection closed, packet dropped");
        }
    }

    fn connect(&self, endpoint: &str, peer_id: &str) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TransportError::closed("mesh socket"));
        }
        self.inner.readiness.mark_not_ready(peer_id);
        if self.inner.dials.contains_key(endpoint) {
            debug!(endpoint = %endpoint, peer = %peer_id, "Already dialing endpoint");
            return Ok(());
        }

        let inner = Arc::clone(&self.inner);
        let endpoint_owned = endpoint.to_string();
        let peer_owned = peer_id.to_string();
        let task = self
            .inner
            .runtime
            .spawn(async move { dial_loop(inner, endpoint_owned, peer_owned).await });
        self.inner.dials.insert(
            endpoint.to_string(),
            Dial {
                peer_id: peer_id.to_string(),
                task,
            },
        );
        info!(server_id = %self.inner.server_id, endpoint = %endpoint, peer = %peer_id, "Connecting to mesh peer");
        Ok(())
    }

    fn disconnect(&self, endpoint: &str) -> Result<()> {
        let Some((_, dial)) = self.inner.dials.remove(endpoint) else {
            debug!(endpoint = %endpoint, "Disconnect for unknown endpoint ignored");
            return Ok(());
        };
        dial.task.abort();
        self.inner.readiness.mark_not_ready(&dial.peer_id);
        if let Some((_, route)) = self.inner.routes.remove(&dial.peer_id) {
            if let Some((_, conn)) = self.inner.connections.remove(&route.conn_id) {
                conn.abort();
            }
        }
        info!(server_id = %self.inner.server_id, endpoint = %endpoint, peer = %dial.peer_id, "Disconnected mesh peer");
        Ok(())
    }

    fn is_peer_ready(&self, peer_id: &str) -> bool {
        peer_id == self.inner.server_id || self.inner.readiness.is_ready(peer_id)
    }

    fn mark_peer_not_ready(&self, peer_id: &str) {
        self.inner.readiness.mark_not_ready(peer_id);
    }
}

impl MeshReceiver {
    /// Wait up to the configured receive timeout for the next packet.
    ///
    /// Probes and malformed messages are consumed internally; `None` means the
    /// timeout elapsed (or the socket is gone) and the caller should poll again.
    pub async fn receive(&mut self) -> Option<RoutePacket> {
        let deadline = tokio::time::Instant::now() + self.receive_timeout;
        loop {
            let raw = match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(raw)) => raw,
                Ok(None) | Err(_) => return None,
            };

            match Inbound::parse(raw.message, &self.pool) {
                Ok(Inbound::Probe { identity }) => {
                    if self.owns_route(&identity, raw.conn_id) && self.readiness.mark_ready(&identity) {
                        info!(server_id = %self.server_id, peer = %identity, "Mesh peer ready (probe)");
                    }
                }
                Ok(Inbound::Packet { identity, packet }) => {
                    if self.owns_route(&identity, raw.conn_id) {
                        if self.readiness.mark_ready(&identity) {
                            info!(server_id = %self.server_id, peer = %identity, "Mesh peer ready");
                        }
                    } else {
                        debug!(peer = %identity, conn_id = raw.conn_id, "Frame from a released connection, readiness unchanged");
                    }
                    debug!(
                        from = %identity,
                        msg_id = %packet.header.msg_id,
                        msg_seq = packet.header.msg_seq,
                        bytes = packet.payload.len(),
                        "Received mesh packet"
                    );
                    return Some(packet);
                }
                Err(e) => {
                    warn!(conn_id = raw.conn_id, error = %e, category = e.category(), "Dropping malformed mesh message");
                }
            }
        }
    }

    /// A frame may only mark its sender ready while its connection still
    /// carries the route to that identity; conn id 0 is loopback.
    fn owns_route(&self, identity: &str, conn_id: u64) -> bool {
        if conn_id == 0 {
            return identity == self.server_id;
        }
        self.routes
            .get(identity)
            .is_some_and(|route| route.conn_id == conn_id)
    }

    pub fn readiness(&self) -> &PeerReadiness {
        &self.readiness
    }
}

async fn accept_loop(inner: Arc<SocketInner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(server_id = %inner.server_id, remote = %addr, "Accepted mesh connection");
                let conn_id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
                let conn_inner = Arc::clone(&inner);
                let task = tokio::spawn(async move {
                    run_connection(conn_inner, stream, conn_id, None).await;
                });
                inner.connections.insert(conn_id, task);
            }
            Err(e) => {
                warn!(server_id = %inner.server_id, error = %e, "Mesh accept failed");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

async fn dial(endpoint: &str, connect_timeout: Duration) -> Result<TcpStream> {
    match tokio::time::timeout(connect_timeout, TcpStream::connect(endpoint)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(TransportError::connection_with_source("Mesh dial failed", endpoint, e)),
        Err(_) => Err(TransportError::timeout(
            format!("mesh dial to {endpoint}"),
            connect_timeout.as_millis() as u64,
        )),
    }
}

async fn dial_loop(inner: Arc<SocketInner>, endpoint: String, peer_id: String) {
    loop {
        match dial(&endpoint, inner.config.connect_timeout).await {
            Ok(stream) => {
                let conn_id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
                info!(server_id = %inner.server_id, endpoint = %endpoint, peer = %peer_id, conn_id, "Mesh connection established");
                run_connection(Arc::clone(&inner), stream, conn_id, Some(peer_id.clone())).await;
                inner.readiness.mark_not_ready(&peer_id);
                debug!(endpoint = %endpoint, peer = %peer_id, "Mesh connection lost, redialing");
            }
            Err(e) => {
                debug!(endpoint = %endpoint, peer = %peer_id, error = %e, category = e.category(), "Mesh dial failed");
            }
        }
        if inner.closed.load(Ordering::Acquire) {
            return;
        }
        tokio::time::sleep(inner.config.reconnect_interval).await;
    }
}

/// Drive one connection until either half fails.
///
/// `known_peer` is set for dialed connections: the route is registered up front
/// so sends can be queued as soon as the peer reports ready.
async fn run_connection(inner: Arc<SocketInner>, stream: TcpStream, conn_id: u64, known_peer: Option<String>) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(conn_id, error = %e, "Failed to set TCP_NODELAY");
    }
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel::<MeshFrame>();

    let mut writer = tokio::spawn(write_loop(write_half, rx, inner.config.buffer_size, conn_id));
    let _ = tx.send(MeshFrame::probe(&inner.server_id));

    if let Some(peer) = &known_peer {
        register_route(&inner, peer, conn_id, &tx);
    }

    tokio::select! {
        _ = read_loop(&inner, read_half, conn_id, known_peer.clone(), &tx) => {}
        _ = &mut writer => {}
    }
    writer.abort();

    let mut released = Vec::new();
    inner.routes.retain(|peer, route| {
        if route.conn_id == conn_id {
            released.push(peer.clone());
            false
        } else {
            true
        }
    });
    for peer in released {
        inner.readiness.mark_not_ready(&peer);
        debug!(peer = %peer, conn_id, "Mesh route released");
    }
    inner.connections.remove(&conn_id);
}

fn register_route(inner: &SocketInner, peer: &str, conn_id: u64, tx: &mpsc::UnboundedSender<MeshFrame>) {
    let previous = inner.routes.insert(
        peer.to_string(),
        Route {
            conn_id,
            tx: tx.clone(),
        },
    );
    match previous {
        Some(old) if old.conn_id != conn_id => {
            info!(peer = %peer, old_conn = old.conn_id, new_conn = conn_id, "Mesh route handed over to newer connection");
        }
        Some(_) => {}
        None => debug!(peer = %peer, conn_id, "Mesh route registered"),
    }
}

async fn read_loop(
    inner: &Arc<SocketInner>,
    mut read_half: OwnedReadHalf,
    conn_id: u64,
    mut peer: Option<String>,
    tx: &mpsc::UnboundedSender<MeshFrame>,
) {
    let decoder = MultipartDecoder::new(inner.config.max_part_size);
    let mut buffer = BytesMut::with_capacity(inner.config.buffer_size);

    loop {
        match read_half.read_buf(&mut buffer).await {
            Ok(0) => {
                debug!(conn_id, "Mesh connection closed by peer");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(conn_id, error = %e, "Mesh connection read failed");
                return;
            }
        }

        loop {
            let message = match decoder.decode(&mut buffer) {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(e) => {
                    warn!(conn_id, error = %e, "Mesh framing error, closing connection");
                    return;
                }
            };

            if let Some(identity) = message.parts.first().and_then(|p| std::str::from_utf8(p).ok()) {
                if !identity.is_empty() && peer.as_deref() != Some(identity) {
                    register_route(inner, identity, conn_id, tx);
                    peer = Some(identity.to_string());
                }
            }

            if inner.inbound_tx.send(RawInbound { conn_id, message }).is_err() {
                debug!(conn_id, "Mesh receiver dropped, stopping reader");
                return;
            }
        }
    }
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<MeshFrame>,
    buffer_size: usize,
    conn_id: u64,
) {
    let mut write_buffer = BytesMut::with_capacity(buffer_size);
    while let Some(frame) = rx.recv().await {
        write_buffer.clear();
        frame.write_to(&mut write_buffer);
        // Coalesce whatever else is already queued into one write.
        while let Ok(next) = rx.try_recv() {
            next.write_to(&mut write_buffer);
            if write_buffer.len() >= buffer_size {
                break;
            }
        }

        if let Err(e) = write_half.write_all(&write_buffer).await {
            debug!(conn_id, error = %e, "Mesh connection write failed");
            return;
        }
    }
    let _ = write_half.shutdown().await;
}
