//! Actor hook contract

use crate::link::ActorLink;
use async_trait::async_trait;
use codec::Packet;
use types::AccountId;

/// Server-side representative of one client account.
///
/// `on_authenticate` must set the authentication context on the actor's
/// [`ActorLink`] (account id plus either a stage id or a single-mode stage
/// type), otherwise authentication fails.
#[async_trait]
pub trait Actor: Send + 'static {
    async fn on_create(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_destroy(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Validate the authentication packet; the optional packet is echoed to
    /// the client inside the authentication reply
    async fn on_authenticate(&mut self, packet: Packet) -> anyhow::Result<(bool, Option<Packet>)>;

    async fn on_post_authenticate(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// An actor as held by a stage
pub struct StageActor {
    link: ActorLink,
    actor: Box<dyn Actor>,
}

impl StageActor {
    pub fn new(link: ActorLink, actor: Box<dyn Actor>) -> Self {
        Self { link, actor }
    }

    pub fn link(&self) -> &ActorLink {
        &self.link
    }

    pub fn account_id(&self) -> AccountId {
        self.link.account_id()
    }

    pub fn actor_mut(&mut self) -> &mut dyn Actor {
        self.actor.as_mut()
    }

    /// Run the destroy hook and detach from any stage
    pub async fn destroy(mut self) {
        self.link.unbind_stage();
        if let Err(e) = self.actor.on_destroy().await {
            tracing::warn!(account_id = self.link.account_id(), error = %e, "Actor on_destroy failed");
        }
    }
}
