//! # PlayMesh Node Configuration
//!
//! Configuration loading and default values for play nodes.
//!
//! ## Sources (later wins)
//!
//! 1. Built-in defaults ([`defaults`])
//! 2. A TOML file, e.g. `config/play.toml`
//! 3. `PLAYMESH_` environment variables, `__` between nesting levels
//!    (`PLAYMESH_SESSION__BIND_ENDPOINT=0.0.0.0:6000`)
//!
//! ## Usage
//!
//! ```no_run
//! use node_config::NodeConfig;
//! use std::path::Path;
//!
//! let config = NodeConfig::load(Some(Path::new("config/play.toml")))?;
//! println!("{} listening on {}", config.server_id, config.session.bind_endpoint);
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod defaults;
pub mod node;

pub use node::{
    load_config, MeshSettings, NodeConfig, PeerSettings, RequestSettings, SessionSettings, StageSettings,
};
