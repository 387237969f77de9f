//! TCP listener and per-connection tasks for client sessions

use super::{ClientSession, SessionHandler, SessionSink};
use crate::{Result, TransportError};
use bytes::{Bytes, BytesMut};
use codec::{BufferPool, ClientFrameDecoder};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use types::Sid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionServerConfig {
    pub bind_endpoint: String,
    /// Largest accepted `contentSize`
    pub max_frame_size: usize,
    pub buffer_size: usize,
}

impl Default for SessionServerConfig {
    fn default() -> Self {
        Self {
            bind_endpoint: "127.0.0.1:0".to_string(),
            max_frame_size: 2 * 1024 * 1024, // 2MB
            buffer_size: 16 * 1024,          // 16KB
        }
    }
}

struct ServerInner {
    config: SessionServerConfig,
    handler: Arc<dyn SessionHandler>,
    sessions: DashMap<Sid, Arc<ClientSession>>,
    next_sid: AtomicI64,
    pool: Arc<BufferPool>,
}

/// Accepts client connections and runs one session per connection
pub struct SessionServer {
    inner: Arc<ServerInner>,
    local_addr: SocketAddr,
    accept_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SessionServer {
    pub async fn bind(config: SessionServerConfig, handler: Arc<dyn SessionHandler>) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind_endpoint).await.map_err(|e| {
            TransportError::network_with_source(format!("Failed to bind session endpoint {}", config.bind_endpoint), e)
        })?;
        let local_addr = listener.local_addr()?;

        let inner = Arc::new(ServerInner {
            config,
            handler,
            sessions: DashMap::new(),
            next_sid: AtomicI64::new(1),
            pool: BufferPool::global(),
        });

        let accept_inner = Arc::clone(&inner);
        let accept_task = tokio::spawn(async move { accept_loop(accept_inner, listener).await });
        info!(endpoint = %local_addr, "Client session server listening");

        Ok(Self {
            inner,
            local_addr,
            accept_task: parking_lot::Mutex::new(Some(accept_task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn session(&self, sid: Sid) -> Option<Arc<ClientSession>> {
        self.inner.sessions.get(&sid).map(|s| Arc::clone(s.value()))
    }

    /// Stop accepting and disconnect every live session
    pub fn shutdown(&self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        let sessions: Vec<_> = self.inner.sessions.iter().map(|s| Arc::clone(s.value())).collect();
        for session in sessions {
            session.disconnect();
        }
        info!(endpoint = %self.local_addr, "Client session server stopped");
    }
}

impl Drop for SessionServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(inner: Arc<ServerInner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let conn_inner = Arc::clone(&inner);
                tokio::spawn(async move { run_session(conn_inner, stream, addr).await });
            }
            Err(e) => {
                warn!(error = %e, "Client accept failed");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

async fn run_session(inner: Arc<ServerInner>, stream: TcpStream, remote_addr: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(remote = %remote_addr, error = %e, "Failed to set TCP_NODELAY");
    }
    let (read_half, write_half) = stream.into_split();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sid = inner.next_sid.fetch_add(1, Ordering::Relaxed);
    let session = Arc::new(ClientSession::new(sid, remote_addr, outbound_tx, shutdown_tx));
    inner.sessions.insert(sid, Arc::clone(&session));
    debug!(sid, remote = %remote_addr, "Client session opened");

    let writer = tokio::spawn(write_loop(write_half, outbound_rx, shutdown_rx.clone(), sid));
    inner.handler.on_connect(&session).await;

    read_loop(&inner, &session, read_half, shutdown_rx).await;

    session.mark_closed();
    session.disconnect();
    inner.sessions.remove(&sid);
    inner.handler.on_disconnect(&session).await;
    if let Err(e) = writer.await {
        debug!(sid, error = %e, "Session writer ended abnormally");
    }
    debug!(sid, remote = %remote_addr, "Client session closed");
}

async fn read_loop(
    inner: &Arc<ServerInner>,
    session: &Arc<ClientSession>,
    mut read_half: OwnedReadHalf,
    mut shutdown: watch::Receiver<bool>,
) {
    let decoder = ClientFrameDecoder::new(inner.config.max_frame_size, Arc::clone(&inner.pool));
    let mut buffer = BytesMut::with_capacity(inner.config.buffer_size);
    let sid = session.sid();

    loop {
        tokio::select! {
            read = read_half.read_buf(&mut buffer) => match read {
                Ok(0) => {
                    debug!(sid, "Client closed connection");
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(sid, error = %e, "Client read failed");
                    return;
                }
            },
            _ = shutdown.changed() => return,
        }

        loop {
            let request = match decoder.decode_request(&mut buffer) {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e) => {
                    warn!(sid, error = %e, category = e.category(), "Malformed client frame, closing session");
                    return;
                }
            };
            inner.handler.on_message(session, request).await;
            if !session.is_connected() {
                return;
            }
        }
    }
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    mut shutdown: watch::Receiver<bool>,
    sid: Sid,
) {
    loop {
        tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = write_half.write_all(&frame).await {
                        debug!(sid, error = %e, "Client write failed");
                        return;
                    }
                }
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }

    // Flush what was queued before the disconnect, e.g. an auth failure reply.
    while let Ok(frame) = rx.try_recv() {
        if write_half.write_all(&frame).await.is_err() {
            return;
        }
    }
    let _ = write_half.shutdown().await;
}
