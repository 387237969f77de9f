//! Built-in echo stage
//!
//! A single-mode stage type that answers every client request with the request
//! itself. The authentication payload is the account id as decimal text.

use anyhow::Context;
use async_trait::async_trait;
use codec::Packet;
use stage_actors::{Actor, ActorLink, Stage, StageActor, StageLink, StageRegistry};
use tracing::debug;
use types::StageMode;

pub const ECHO_STAGE_TYPE: &str = "EchoStage";

pub struct EchoStage {
    link: StageLink,
}

#[async_trait]
impl Stage for EchoStage {
    async fn on_create(&mut self, _packet: Packet) -> anyhow::Result<(bool, Option<Packet>)> {
        debug!(stage_id = %self.link.stage_id(), "Echo stage created");
        Ok((true, None))
    }

    async fn on_join_stage(&mut self, _actor: &mut StageActor) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn on_actor_dispatch(&mut self, actor: &mut StageActor, packet: Packet) -> anyhow::Result<()> {
        if self.link.is_request() {
            self.link.reply(packet);
        } else {
            actor.link().send_to_client(packet);
        }
        Ok(())
    }

    async fn on_dispatch(&mut self, packet: Packet) -> anyhow::Result<()> {
        if self.link.is_request() {
            self.link.reply(packet);
        }
        Ok(())
    }
}

pub struct EchoActor {
    link: ActorLink,
}

#[async_trait]
impl Actor for EchoActor {
    async fn on_authenticate(&mut self, packet: Packet) -> anyhow::Result<(bool, Option<Packet>)> {
        let text = std::str::from_utf8(packet.data()).context("account id is not UTF-8")?;
        let account_id: i64 = text.trim().parse().context("account id is not a number")?;
        if account_id <= 0 {
            return Ok((false, None));
        }
        self.link.set_auth_single_context(account_id, ECHO_STAGE_TYPE);
        Ok((true, None))
    }
}

/// Add the echo stage type to `registry`
pub fn register(registry: &mut StageRegistry) -> &mut StageRegistry {
    registry.register(
        ECHO_STAGE_TYPE,
        StageMode::Single,
        |link| -> Box<dyn Stage> { Box::new(EchoStage { link }) },
        |link| -> Box<dyn Actor> { Box::new(EchoActor { link }) },
    )
}
