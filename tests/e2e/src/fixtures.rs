//! Hooks-instrumented stage type and node bootstrap

use anyhow::Result;
use async_trait::async_trait;
use codec::Packet;
use node_config::{NodeConfig, PeerSettings};
use play_server::PlayServer;
use stage_actors::{Actor, ActorLink, Stage, StageActor, StageLink, StageRegistry};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use types::StageMode;

pub const TEST_STAGE_TYPE: &str = "TestStage";

/// Hook invocation counters shared by every stage and actor of one node
#[derive(Debug, Default)]
pub struct HookCounters {
    pub stage_create: AtomicU32,
    pub stage_post_create: AtomicU32,
    pub stage_join: AtomicU32,
    pub stage_post_join: AtomicU32,
    pub stage_destroy: AtomicU32,
    pub connection_changes: AtomicU32,
    pub actor_create: AtomicU32,
    pub actor_authenticate: AtomicU32,
    pub actor_post_authenticate: AtomicU32,
    pub actor_destroy: AtomicU32,
}

impl HookCounters {
    pub fn get(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::SeqCst)
    }
}

fn bump(counter: &AtomicU32) {
    counter.fetch_add(1, Ordering::SeqCst);
}

/// Echoes `Echo` requests and counts lifecycle hooks
struct CountingStage {
    link: StageLink,
    hooks: Arc<HookCounters>,
}

#[async_trait]
impl Stage for CountingStage {
    async fn on_create(&mut self, packet: Packet) -> anyhow::Result<(bool, Option<Packet>)> {
        bump(&self.hooks.stage_create);
        debug!(stage_id = %self.link.stage_id(), msg_id = %packet.msg_id(), "Hooks stage created");
        Ok((true, Some(Packet::new("Created", self.link.stage_id().as_bytes().to_vec()))))
    }

    async fn on_post_create(&mut self) -> anyhow::Result<()> {
        bump(&self.hooks.stage_post_create);
        Ok(())
    }

    async fn on_destroy(&mut self) -> anyhow::Result<()> {
        bump(&self.hooks.stage_destroy);
        Ok(())
    }

    async fn on_join_stage(&mut self, _actor: &mut StageActor) -> anyhow::Result<bool> {
        bump(&self.hooks.stage_join);
        Ok(true)
    }

    async fn on_post_join_stage(&mut self, _actor: &mut StageActor) -> anyhow::Result<()> {
        bump(&self.hooks.stage_post_join);
        Ok(())
    }

    async fn on_connection_changed(&mut self, _actor: &mut StageActor, _connected: bool) -> anyhow::Result<()> {
        bump(&self.hooks.connection_changes);
        Ok(())
    }

    async fn on_actor_dispatch(&mut self, actor: &mut StageActor, packet: Packet) -> anyhow::Result<()> {
        match packet.msg_id() {
            "Echo" => actor.link().reply(packet),
            "WhoAmI" => actor
                .link()
                .reply(Packet::new("WhoAmI", actor.account_id().to_string().into_bytes())),
            "Push" => actor.link().send_to_client(packet),
            _ => {}
        }
        Ok(())
    }

    async fn on_dispatch(&mut self, packet: Packet) -> anyhow::Result<()> {
        if packet.msg_id() == "Echo" {
            self.link.reply(packet);
        }
        Ok(())
    }
}

/// Authenticates with a decimal account id and asks for its own single stage
struct CountingActor {
    link: ActorLink,
    hooks: Arc<HookCounters>,
}

#[async_trait]
impl Actor for CountingActor {
    async fn on_create(&mut self) -> anyhow::Result<()> {
        bump(&self.hooks.actor_create);
        Ok(())
    }

    async fn on_destroy(&mut self) -> anyhow::Result<()> {
        bump(&self.hooks.actor_destroy);
        Ok(())
    }

    async fn on_authenticate(&mut self, packet: Packet) -> anyhow::Result<(bool, Option<Packet>)> {
        bump(&self.hooks.actor_authenticate);
        let Ok(account_id) = std::str::from_utf8(packet.data())?.trim().parse::<i64>() else {
            return Ok((false, Some(Packet::new("AuthFailed", b"bad account id".to_vec()))));
        };
        self.link.set_auth_single_context(account_id, TEST_STAGE_TYPE);
        Ok((true, None))
    }

    async fn on_post_authenticate(&mut self) -> anyhow::Result<()> {
        bump(&self.hooks.actor_post_authenticate);
        Ok(())
    }
}

/// Registry with the hooks stage registered in single mode
pub fn test_registry(hooks: &Arc<HookCounters>) -> StageRegistry {
    let mut registry = StageRegistry::new();
    let stage_hooks = Arc::clone(hooks);
    let actor_hooks = Arc::clone(hooks);
    registry.register(
        TEST_STAGE_TYPE,
        StageMode::Single,
        move |link| {
            Box::new(CountingStage {
                link,
                hooks: Arc::clone(&stage_hooks),
            }) as Box<dyn Stage>
        },
        move |link| {
            Box::new(CountingActor {
                link,
                hooks: Arc::clone(&actor_hooks),
            }) as Box<dyn Actor>
        },
    );
    registry
}

/// Loopback config with ephemeral ports and short timeouts
pub fn test_config(server_id: &str) -> NodeConfig {
    let mut config = NodeConfig {
        server_id: server_id.to_string(),
        ..NodeConfig::default()
    };
    config.mesh.bind_endpoint = "127.0.0.1:0".to_string();
    config.mesh.receive_timeout_ms = 20;
    config.mesh.reconnect_interval_ms = 50;
    config.session.bind_endpoint = "127.0.0.1:0".to_string();
    config.request.timeout_ms = 2_000;
    config.request.sweep_interval_ms = 20;
    config.stage.default_stage_type = TEST_STAGE_TYPE.to_string();
    config
}

pub async fn start_node(config: NodeConfig, hooks: &Arc<HookCounters>) -> Result<PlayServer> {
    PlayServer::start(config, test_registry(hooks)).await
}

/// Peer entry pointing at a running node's mesh listener
pub fn peer_of(server: &PlayServer) -> PeerSettings {
    PeerSettings {
        server_id: server.server_id().to_string(),
        endpoint: server.mesh_addr().to_string(),
    }
}

/// Poll `condition` until it holds or `deadline` passes
pub async fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let end = tokio::time::Instant::now() + deadline;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= end {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
