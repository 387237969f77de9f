//! # Play Server
//!
//! One PlayMesh node: a mesh socket shared with the other nodes, a client
//! session listener, and the stage dispatcher that hosts game logic.
//!
//! Applications build a [`StageRegistry`](stage_actors::StageRegistry) with
//! their stage and actor types and hand it to [`PlayServer::start`]. The
//! binary in `main.rs` does the same with the built-in [`echo`] stage.

pub mod auth;
pub mod echo;
pub mod server;

pub use auth::AuthBridge;
pub use server::PlayServer;
