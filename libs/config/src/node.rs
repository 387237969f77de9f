//! Node Configuration Module
//!
//! Loads a [`NodeConfig`] from an optional TOML file with `PLAYMESH_`
//! environment overrides. Every field has a default, so an empty file (or no
//! file at all) yields a runnable single-node setup.

use crate::defaults;
use anyhow::{bail, Context, Result};
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};
use types::ServerId;

/// Main node configuration structure
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct NodeConfig {
    /// Mesh identity of this node; must be unique across the mesh
    pub server_id: ServerId,
    pub service_id: u16,
    /// Log filter directive, overridden by `RUST_LOG`
    pub log_level: String,
    pub mesh: MeshSettings,
    pub session: SessionSettings,
    pub request: RequestSettings,
    pub stage: StageSettings,
    /// Statically configured peers dialed at startup
    pub peers: Vec<PeerSettings>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct MeshSettings {
    pub bind_endpoint: String,
    pub receive_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub reconnect_interval_ms: u64,
    pub max_part_size: usize,
    pub deferred_backoff_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SessionSettings {
    pub bind_endpoint: String,
    pub max_frame_size: usize,
    pub authenticate_msg_id: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RequestSettings {
    pub timeout_ms: u64,
    pub sweep_interval_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct StageSettings {
    /// Stage type whose actor factory handles unauthenticated clients
    pub default_stage_type: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct PeerSettings {
    pub server_id: ServerId,
    pub endpoint: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            server_id: defaults::node::SERVER_ID.to_string(),
            service_id: defaults::node::SERVICE_ID,
            log_level: defaults::node::LOG_LEVEL.to_string(),
            mesh: MeshSettings::default(),
            session: SessionSettings::default(),
            request: RequestSettings::default(),
            stage: StageSettings::default(),
            peers: Vec::new(),
        }
    }
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            bind_endpoint: defaults::mesh::BIND_ENDPOINT.to_string(),
            receive_timeout_ms: defaults::mesh::RECEIVE_TIMEOUT_MS,
            connect_timeout_ms: defaults::mesh::CONNECT_TIMEOUT_MS,
            reconnect_interval_ms: defaults::mesh::RECONNECT_INTERVAL_MS,
            max_part_size: defaults::mesh::MAX_PART_SIZE,
            deferred_backoff_ms: defaults::communicator::DEFERRED_BACKOFF_MS,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            bind_endpoint: defaults::session::BIND_ENDPOINT.to_string(),
            max_frame_size: defaults::session::MAX_FRAME_SIZE,
            authenticate_msg_id: defaults::session::AUTHENTICATE_MSG_ID.to_string(),
        }
    }
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self {
            timeout_ms: defaults::request::TIMEOUT_MS,
            sweep_interval_ms: defaults::request::SWEEP_INTERVAL_MS,
        }
    }
}

impl MeshSettings {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn deferred_backoff(&self) -> Duration {
        Duration::from_millis(self.deferred_backoff_ms)
    }
}

impl RequestSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl NodeConfig {
    /// Load configuration from an optional file with environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(path, "PLAYMESH")
    }

    /// Same as [`load`](Self::load) with a custom environment prefix
    pub fn load_with_prefix(path: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!("Loading node config: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;
        let mut node: NodeConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        node.expand_env_vars()?;
        node.validate()?;
        debug!(server_id = %node.server_id, peers = node.peers.len(), "Node configuration loaded");
        Ok(node)
    }

    /// Parse a TOML document directly, without environment overrides
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut node: NodeConfig = toml::from_str(content).context("Failed to parse TOML configuration")?;
        node.expand_env_vars()?;
        node.validate()?;
        Ok(node)
    }

    /// Expand environment variables in endpoint strings
    pub fn expand_env_vars(&mut self) -> Result<()> {
        self.mesh.bind_endpoint = shellexpand::env(&self.mesh.bind_endpoint)
            .context("Failed to expand mesh endpoint")?
            .to_string();
        self.session.bind_endpoint = shellexpand::env(&self.session.bind_endpoint)
            .context("Failed to expand session endpoint")?
            .to_string();
        for peer in &mut self.peers {
            peer.endpoint = shellexpand::env(&peer.endpoint)
                .with_context(|| format!("Failed to expand endpoint of peer {}", peer.server_id))?
                .to_string();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_id.is_empty() {
            bail!("server_id must not be empty");
        }
        if self.log_level.trim().is_empty() {
            bail!("log_level must not be empty");
        }
        if self.request.timeout_ms == 0 {
            bail!("request.timeout_ms must be greater than zero");
        }
        if self.session.authenticate_msg_id.is_empty() {
            bail!("session.authenticate_msg_id must not be empty");
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.server_id.is_empty() || peer.endpoint.is_empty() {
                bail!("peer entries need both server_id and endpoint");
            }
            if peer.server_id == self.server_id {
                bail!("peer {} has this node's own server_id", peer.server_id);
            }
            if !seen.insert(peer.server_id.as_str()) {
                bail!("duplicate peer server_id {}", peer.server_id);
            }
        }
        Ok(())
    }

    pub fn peer(&self, server_id: &str) -> Option<&PeerSettings> {
        self.peers.iter().find(|p| p.server_id == server_id)
    }
}

/// Convenience function to load configuration from a file path
pub fn load_config(path: Option<&Path>) -> Result<NodeConfig> {
    NodeConfig::load(path)
}
