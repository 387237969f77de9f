//! Stage hook contract and the runtime's per-stage record

use crate::actor::StageActor;
use crate::link::StageLink;
use async_trait::async_trait;
use codec::Packet;
use std::collections::HashMap;
use types::AccountId;

/// Application logic of one stage.
///
/// Hooks of one stage never run concurrently; hooks of different stages may
/// interleave at their await points.
#[async_trait]
pub trait Stage: Send + 'static {
    /// Primary creation hook. Returns whether creation succeeded and an
    /// optional reply for the creator.
    async fn on_create(&mut self, packet: Packet) -> anyhow::Result<(bool, Option<Packet>)>;

    /// Runs after a successful `on_create`. An error rolls the stage back to
    /// not-created; the next create attempt starts again from `on_create`.
    async fn on_post_create(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_destroy(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Decide whether `actor` may join
    async fn on_join_stage(&mut self, actor: &mut StageActor) -> anyhow::Result<bool>;

    async fn on_post_join_stage(&mut self, _actor: &mut StageActor) -> anyhow::Result<()> {
        Ok(())
    }

    /// Client connection of a joined actor went away or came back
    async fn on_connection_changed(&mut self, _actor: &mut StageActor, _connected: bool) -> anyhow::Result<()> {
        Ok(())
    }

    /// Message from (or on behalf of) a joined actor
    async fn on_actor_dispatch(&mut self, actor: &mut StageActor, packet: Packet) -> anyhow::Result<()>;

    /// Message addressed to the stage itself
    async fn on_dispatch(&mut self, packet: Packet) -> anyhow::Result<()>;
}

/// A stage instance together with its joined actors
pub(crate) struct BaseStage {
    pub(crate) stage_id: String,
    pub(crate) stage_type: String,
    pub(crate) link: StageLink,
    pub(crate) stage: Box<dyn Stage>,
    pub(crate) actors: HashMap<AccountId, StageActor>,
}

impl BaseStage {
    pub(crate) fn new(link: StageLink, stage: Box<dyn Stage>) -> Self {
        Self {
            stage_id: link.stage_id().to_string(),
            stage_type: link.stage_type().to_string(),
            link,
            stage,
            actors: HashMap::new(),
        }
    }
}
