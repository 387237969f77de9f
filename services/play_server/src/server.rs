//! Play node wiring
//!
//! ```text
//!   peers ◀──▶ TcpPlaySocket ──receive──▶ reply?  ──yes──▶ RequestCache::resolve
//!                   ▲                        │ no
//!                   │ send                   ▼
//!            NodeCommunicator ◀──────── PlayDispatcher ◀──── AuthBridge ◀── clients
//! ```

use crate::auth::AuthBridge;
use anyhow::{Context, Result};
use network::{
    CommunicatorConfig, MeshReceiver, MeshSocketConfig, NodeCommunicator, PacketSender, PlaySocket, RequestCache,
    SessionHandler, SessionServer, SessionServerConfig, TcpPlaySocket,
};
use node_config::NodeConfig;
use parking_lot::Mutex;
use stage_actors::{PlayDispatcher, StageRegistry};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A running play node
pub struct PlayServer {
    config: NodeConfig,
    socket: TcpPlaySocket,
    communicator: Arc<NodeCommunicator>,
    cache: Arc<RequestCache>,
    dispatcher: PlayDispatcher,
    sessions: SessionServer,
    bridge: Arc<AuthBridge>,
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PlayServer {
    /// Bind the mesh and session listeners, start the dispatcher and dial the
    /// configured peers
    pub async fn start(config: NodeConfig, registry: StageRegistry) -> Result<Self> {
        config.validate()?;
        if config.stage.default_stage_type.is_empty() {
            warn!(server_id = %config.server_id, "No default stage type configured; client authentication disabled");
        } else if !registry.contains(&config.stage.default_stage_type) {
            anyhow::bail!(
                "default stage type {} is not registered",
                config.stage.default_stage_type
            );
        }

        let (socket, receiver) = TcpPlaySocket::bind(config.server_id.clone(), mesh_socket_config(&config))
            .await
            .context("Failed to bind mesh socket")?;
        let communicator = NodeCommunicator::start(
            Arc::new(socket.clone()) as Arc<dyn PlaySocket>,
            CommunicatorConfig {
                backoff: config.mesh.deferred_backoff(),
                ..CommunicatorConfig::default()
            },
        )
        .context("Failed to start node communicator")?;

        let cache = Arc::new(RequestCache::new(config.request.timeout()));
        let dispatcher = PlayDispatcher::start(
            Arc::new(registry),
            Arc::clone(&communicator) as Arc<dyn PacketSender>,
            Arc::clone(&cache),
        );

        let bridge = Arc::new(AuthBridge::new(
            dispatcher.clone(),
            config.session.authenticate_msg_id.clone(),
            config.stage.default_stage_type.clone(),
        ));
        let sessions = SessionServer::bind(session_server_config(&config), Arc::clone(&bridge) as Arc<dyn SessionHandler>)
            .await
            .context("Failed to bind client session listener")?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let receive_task = tokio::spawn(mesh_receive_loop(
            receiver,
            Arc::clone(&cache),
            dispatcher.clone(),
            stop_rx,
        ));
        let sweeper = cache.spawn_sweeper(config.request.sweep_interval());

        for peer in &config.peers {
            communicator
                .connect(&peer.server_id, &peer.endpoint)
                .with_context(|| format!("Failed to connect to peer {}", peer.server_id))?;
        }

        info!(
            server_id = %config.server_id,
            mesh = %socket.local_addr(),
            sessions = %sessions.local_addr(),
            peers = config.peers.len(),
            "Play server started"
        );

        Ok(Self {
            config,
            socket,
            communicator,
            cache,
            dispatcher,
            sessions,
            bridge,
            stop_tx,
            tasks: Mutex::new(vec![receive_task, sweeper]),
        })
    }

    pub fn server_id(&self) -> &str {
        &self.config.server_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Address the mesh listener bound to
    pub fn mesh_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    /// Address the client listener bound to
    pub fn session_addr(&self) -> SocketAddr {
        self.sessions.local_addr()
    }

    pub fn dispatcher(&self) -> &PlayDispatcher {
        &self.dispatcher
    }

    pub fn request_cache(&self) -> &Arc<RequestCache> {
        &self.cache
    }

    pub fn communicator(&self) -> &Arc<NodeCommunicator> {
        &self.communicator
    }

    /// Dial another node; sends to it are deferred until it is ready
    pub fn connect_peer(&self, server_id: &str, endpoint: &str) -> Result<()> {
        self.communicator
            .connect(server_id, endpoint)
            .with_context(|| format!("Failed to connect to peer {server_id}"))
    }

    pub fn is_peer_ready(&self, server_id: &str) -> bool {
        self.communicator.is_peer_ready(server_id)
    }

    pub fn authenticated_sessions(&self) -> usize {
        self.bridge.bound_sessions()
    }

    /// Stop accepting clients, destroy every stage and close the mesh
    pub async fn stop(&self) {
        if self.stop_tx.send_replace(true) {
            return;
        }
        info!(server_id = %self.config.server_id, "Play server stopping");

        self.sessions.shutdown();
        self.dispatcher.shutdown().await;
        let cancelled = self.cache.cancel_all("server stopping");
        self.communicator.stop();
        self.socket.close();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        info!(server_id = %self.config.server_id, cancelled, "Play server stopped");
    }
}

fn mesh_socket_config(config: &NodeConfig) -> MeshSocketConfig {
    MeshSocketConfig {
        bind_endpoint: config.mesh.bind_endpoint.clone(),
        receive_timeout: config.mesh.receive_timeout(),
        connect_timeout: config.mesh.connect_timeout(),
        reconnect_interval: config.mesh.reconnect_interval(),
        max_part_size: config.mesh.max_part_size,
        ..MeshSocketConfig::default()
    }
}

fn session_server_config(config: &NodeConfig) -> SessionServerConfig {
    SessionServerConfig {
        bind_endpoint: config.session.bind_endpoint.clone(),
        max_frame_size: config.session.max_frame_size,
        ..SessionServerConfig::default()
    }
}

/// Replies complete pending requests; everything else goes to the dispatcher
async fn mesh_receive_loop(
    mut receiver: MeshReceiver,
    cache: Arc<RequestCache>,
    dispatcher: PlayDispatcher,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            packet = receiver.receive() => {
                let Some(packet) = packet else {
                    continue;
                };
                if packet.is_reply() {
                    cache.resolve(packet);
                } else {
                    dispatcher.post(packet);
                }
            }
        }
    }
    debug!("Mesh receive loop stopped");
}
