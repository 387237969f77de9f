//! Stage/Actor Runtime
//!
//! Hosts the application logic of a play node: *stages* (rooms, matches,
//! per-player worlds) and the *actors* (connected accounts) that join them.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐        ┌────────────────────────────────┐
//! │ mesh receive loop    │──post─▶│                                │
//! └──────────────────────┘        │        PlayDispatcher          │
//! ┌──────────────────────┐        │                                │
//! │ client sessions      │──cmd──▶│  stage-1 mailbox ─▶ Stage hooks│
//! └──────────────────────┘        │  stage-2 mailbox ─▶ Stage hooks│
//! ┌──────────────────────┐        │  ...                           │
//! │ StageLink timers     │──tick─▶│                                │
//! └──────────────────────┘        └────────────────────────────────┘
//! ```
//!
//! Hooks of one stage run strictly one at a time, in arrival order. A stage
//! that awaits a mesh reply only holds up its own mailbox.
//!
//! # Usage
//!
//! ```rust,ignore
//! let mut registry = StageRegistry::new();
//! registry.register("Lobby", StageMode::Multi, |link| Box::new(Lobby::new(link)), |link| Box::new(Player::new(link)));
//!
//! let dispatcher = PlayDispatcher::start(Arc::new(registry), sender, cache);
//! dispatcher.create_stage("lobby-1", "Lobby", Packet::empty("Init")).await?;
//! ```

pub mod actor;
pub mod dispatcher;
pub mod error;
pub mod link;
pub mod registry;
pub mod stage;
pub mod timer;

pub use actor::{Actor, StageActor};
pub use dispatcher::{CreateStageReply, DispatcherSnapshot, JoinStageReply, PlayDispatcher, StageInfo};
pub use error::{Result, StageError};
pub use link::{ActorLink, MeshLink, StageLink};
pub use registry::{ActorFactory, StageFactory, StageRegistry};
pub use stage::Stage;
pub use timer::{timer_callback, TimerCallback, TimerId, TimerKind};
