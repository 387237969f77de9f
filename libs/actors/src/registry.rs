//! Stage type registry
//!
//! Maps a stage type name to its placement mode and the two constructors the
//! runtime needs: one for stage instances and one for the actors that join
//! them. The registry is built once at startup and shared read-only.

use crate::actor::Actor;
use crate::link::{ActorLink, StageLink};
use crate::stage::Stage;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use types::StageMode;

pub type StageFactory = Arc<dyn Fn(StageLink) -> Box<dyn Stage> + Send + Sync>;
pub type ActorFactory = Arc<dyn Fn(ActorLink) -> Box<dyn Actor> + Send + Sync>;

#[derive(Clone)]
struct Registration {
    mode: StageMode,
    stage_factory: StageFactory,
    actor_factory: ActorFactory,
}

#[derive(Default, Clone)]
pub struct StageRegistry {
    types: HashMap<String, Registration>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `stage_type`; a second registration replaces the first
    pub fn register<S, A>(&mut self, stage_type: impl Into<String>, mode: StageMode, stage: S, actor: A) -> &mut Self
    where
        S: Fn(StageLink) -> Box<dyn Stage> + Send + Sync + 'static,
        A: Fn(ActorLink) -> Box<dyn Actor> + Send + Sync + 'static,
    {
        let stage_type = stage_type.into();
        debug!(stage_type = %stage_type, mode = %mode, "Registered stage type");
        self.types.insert(
            stage_type,
            Registration {
                mode,
                stage_factory: Arc::new(stage),
                actor_factory: Arc::new(actor),
            },
        );
        self
    }

    pub fn contains(&self, stage_type: &str) -> bool {
        self.types.contains_key(stage_type)
    }

    pub fn mode(&self, stage_type: &str) -> Option<StageMode> {
        self.types.get(stage_type).map(|r| r.mode)
    }

    pub fn stage_types(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    pub(crate) fn create_stage(&self, stage_type: &str, link: StageLink) -> Option<Box<dyn Stage>> {
        self.types.get(stage_type).map(|r| (r.stage_factory)(link))
    }

    pub fn create_actor(&self, stage_type: &str, link: ActorLink) -> Option<Box<dyn Actor>> {
        self.types.get(stage_type).map(|r| (r.actor_factory)(link))
    }
}
