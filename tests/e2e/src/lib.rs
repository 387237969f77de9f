//! # PlayMesh End-to-End Harness
//!
//! Starts real play nodes on loopback ports and drives them the way a game
//! client or a peer node would.
//!
//! - [`client::TestClient`]: minimal client connector speaking the session
//!   framing over TCP
//! - [`fixtures`]: a hooks-instrumented stage type and node bootstrap helpers

pub mod client;
pub mod fixtures;

pub use client::{AuthReply, TestClient};
pub use fixtures::{peer_of, start_node, test_config, test_registry, wait_until, HookCounters, TEST_STAGE_TYPE};
