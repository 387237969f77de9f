//! Stage Dispatcher
//!
//! Every stage lifecycle change and every message for a stage goes through one
//! command queue consumed by one task. That task owns the live-stage table.
//!
//! ## Per-stage mailbox
//!
//! ```text
//!  commands ──▶ loop ──▶ slot[stage_id].queue ──▶ one job at a time ──┐
//!                ▲                                                     │
//!                └──────────── job done (stage returned) ◀─────────────┘
//! ```
//!
//! A job takes the stage instance out of its slot, runs the stage hooks as a
//! future, and hands the instance back when it completes. While a job is in
//! flight further commands for that stage queue behind it; commands for other
//! stages keep flowing, so one stage awaiting a remote reply never stalls the
//! rest.
//!
//! ## Creation
//!
//! `on_create` failing (or declining) leaves the stage absent. `on_post_create`
//! failing rolls the stage back to not-created; the next create attempt for the
//! same id runs `on_create` again.

mod event_loop;
mod jobs;

use crate::actor::StageActor;
use crate::error::{Result, StageError};
use crate::link::{ActorLink, MeshLink};
use crate::registry::StageRegistry;
use crate::timer::{TimerCallback, TimerId, TimerKind};
use codec::{Packet, RoutePacket};
use network::{PacketSender, RequestCache, SessionSink};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;
use types::{AccountId, RouteHeader, Sid};

pub(crate) use jobs::{Ack, CreateResponder};

/// Successful outcome of a create or get-or-create
#[derive(Debug)]
pub struct CreateStageReply {
    /// False when get-or-create found the stage already created
    pub is_created: bool,
    /// Reply produced by `on_create`
    pub payload: Option<Packet>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinStageReply {
    /// The account was already in the stage; its session was replaced
    pub reconnected: bool,
}

/// State of one stage id as seen by the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageInfo {
    pub stage_id: String,
    pub stage_type: String,
    /// False while the stage exists only as a rolled-back instance
    pub created: bool,
    pub actor_count: usize,
}

/// Point-in-time counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherSnapshot {
    /// Stages in the created state
    pub stage_count: usize,
    pub actor_count: usize,
    pub timer_count: usize,
}

pub(crate) enum Command {
    Route(RoutePacket),
    CreateStage {
        stage_id: String,
        stage_type: String,
        packet: Packet,
        get_or_create: bool,
        responder: CreateResponder,
    },
    DestroyStage {
        stage_id: String,
        ack: Option<Ack>,
    },
    Dispatch {
        stage_id: String,
        packet: RoutePacket,
        ack: Option<Ack>,
    },
    ClientDispatch {
        stage_id: String,
        account_id: AccountId,
        msg_seq: u16,
        packet: Packet,
        session: Arc<dyn SessionSink>,
    },
    JoinStage {
        stage_id: String,
        actor: StageActor,
        reply: oneshot::Sender<Result<JoinStageReply>>,
    },
    LeaveStage {
        stage_id: String,
        account_id: AccountId,
    },
    ConnectionChanged {
        stage_id: String,
        account_id: AccountId,
        sid: Sid,
        connected: bool,
    },
    AddTimer {
        timer_id: TimerId,
        stage_id: String,
        kind: TimerKind,
        callback: TimerCallback,
    },
    CancelTimer {
        timer_id: TimerId,
    },
    TimerFired {
        timer_id: TimerId,
    },
    Inspect {
        reply: oneshot::Sender<DispatcherSnapshot>,
    },
    StageInfo {
        stage_id: String,
        reply: oneshot::Sender<Option<StageInfo>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Weak handle used by links and timer tasks to post commands
#[derive(Clone)]
pub(crate) struct CommandPort {
    tx: mpsc::WeakUnboundedSender<Command>,
    next_timer_id: Arc<AtomicU64>,
}

impl CommandPort {
    pub(crate) fn post(&self, command: Command) -> bool {
        match self.tx.upgrade() {
            Some(tx) => tx.send(command).is_ok(),
            None => {
                debug!("Dispatcher gone, command dropped");
                false
            }
        }
    }

    pub(crate) fn next_timer_id(&self) -> TimerId {
        self.next_timer_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Default)]
pub(crate) struct Stats {
    pub(crate) stages: AtomicUsize,
    pub(crate) actors: AtomicUsize,
    pub(crate) timers: AtomicUsize,
}

pub(crate) struct Shared {
    pub(crate) registry: Arc<StageRegistry>,
    pub(crate) mesh: MeshLink,
    pub(crate) port: CommandPort,
    pub(crate) stats: Stats,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running stage dispatcher
#[derive(Clone)]
pub struct PlayDispatcher {
    tx: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl PlayDispatcher {
    /// Spawn the dispatcher loop on the current tokio runtime
    pub fn start(registry: Arc<StageRegistry>, sender: Arc<dyn PacketSender>, cache: Arc<RequestCache>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            registry,
            mesh: MeshLink::new(sender, cache),
            port: CommandPort {
                tx: tx.downgrade(),
                next_timer_id: Arc::new(AtomicU64::new(1)),
            },
            stats: Stats::default(),
            task: Mutex::new(None),
        });

        let task = tokio::spawn(event_loop::DispatcherLoop::new(Arc::clone(&shared)).run(rx));
        *shared.task.lock() = Some(task);
        Self { tx, shared }
    }

    pub fn server_id(&self) -> &str {
        self.shared.mesh.server_id()
    }

    pub fn registry(&self) -> &Arc<StageRegistry> {
        &self.shared.registry
    }

    /// Node-level mesh operations (requests not owned by any stage)
    pub fn mesh(&self) -> &MeshLink {
        &self.shared.mesh
    }

    /// Link for a new actor talking through `session`
    pub fn actor_link(&self, session: Arc<dyn SessionSink>) -> ActorLink {
        ActorLink::new(session, self.shared.mesh.clone(), self.shared.port.clone())
    }

    /// Build an actor of `stage_type` bound to `session`
    pub fn create_actor(&self, stage_type: &str, session: Arc<dyn SessionSink>) -> Option<StageActor> {
        let link = self.actor_link(session);
        let actor = self.shared.registry.create_actor(stage_type, link.clone())?;
        Some(StageActor::new(link, actor))
    }

    fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).map_err(|_| StageError::Closed)
    }

    /// Hand an inbound mesh packet (not a reply) to the dispatcher
    pub fn post(&self, packet: RoutePacket) {
        if self.send(Command::Route(packet)).is_err() {
            debug!("Dispatcher closed, mesh packet dropped");
        }
    }

    pub async fn create_stage(&self, stage_id: &str, stage_type: &str, packet: Packet) -> Result<CreateStageReply> {
        self.create(stage_id, stage_type, packet, false).await
    }

    pub async fn get_or_create_stage(
        &self,
        stage_id: &str,
        stage_type: &str,
        packet: Packet,
    ) -> Result<CreateStageReply> {
        self.create(stage_id, stage_type, packet, true).await
    }

    async fn create(
        &self,
        stage_id: &str,
        stage_type: &str,
        packet: Packet,
        get_or_create: bool,
    ) -> Result<CreateStageReply> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::CreateStage {
            stage_id: stage_id.to_string(),
            stage_type: stage_type.to_string(),
            packet,
            get_or_create,
            responder: CreateResponder::Local(reply),
        })?;
        rx.await.map_err(|_| StageError::Closed)?
    }

    /// Destroy a stage; destroying an absent stage succeeds
    pub async fn destroy_stage(&self, stage_id: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::DestroyStage {
            stage_id: stage_id.to_string(),
            ack: Some(Ack::Local(reply)),
        })?;
        rx.await.map_err(|_| StageError::Closed)?
    }

    /// Deliver `packet` to a stage and wait until its handler finished.
    ///
    /// A non-zero `account_id` routes to `on_actor_dispatch` when that actor is
    /// in the stage.
    pub async fn dispatch(&self, stage_id: &str, account_id: AccountId, packet: Packet) -> Result<()> {
        let header = RouteHeader::new("", self.server_id())
            .with_stage(stage_id)
            .with_account(account_id);
        let (reply, rx) = oneshot::channel();
        self.send(Command::Dispatch {
            stage_id: stage_id.to_string(),
            packet: RoutePacket::from_packet(header, packet),
            ack: Some(Ack::Local(reply)),
        })?;
        rx.await.map_err(|_| StageError::Closed)?
    }

    /// Deliver a client frame to the actor's stage; replies go to `session`
    pub fn dispatch_from_client(
        &self,
        stage_id: &str,
        account_id: AccountId,
        msg_seq: u16,
        packet: Packet,
        session: Arc<dyn SessionSink>,
    ) -> Result<()> {
        self.send(Command::ClientDispatch {
            stage_id: stage_id.to_string(),
            account_id,
            msg_seq,
            packet,
            session,
        })
    }

    pub async fn join_stage(&self, stage_id: &str, actor: StageActor) -> Result<JoinStageReply> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::JoinStage {
            stage_id: stage_id.to_string(),
            actor,
            reply,
        })?;
        rx.await.map_err(|_| StageError::Closed)?
    }

    pub fn leave_stage(&self, stage_id: &str, account_id: AccountId) -> Result<()> {
        self.send(Command::LeaveStage {
            stage_id: stage_id.to_string(),
            account_id,
        })
    }

    /// Report that the session `sid` of a joined actor connected or went away
    pub fn connection_changed(&self, stage_id: &str, account_id: AccountId, sid: Sid, connected: bool) -> Result<()> {
        self.send(Command::ConnectionChanged {
            stage_id: stage_id.to_string(),
            account_id,
            sid,
            connected,
        })
    }

    /// Register a timer for `stage_id`. Ticks for a stage that does not exist
    /// when they fire cancel the timer.
    pub fn add_timer(&self, stage_id: &str, kind: TimerKind, callback: TimerCallback) -> Result<TimerId> {
        let timer_id = self.shared.port.next_timer_id();
        self.send(Command::AddTimer {
            timer_id,
            stage_id: stage_id.to_string(),
            kind,
            callback,
        })?;
        Ok(timer_id)
    }

    pub fn cancel_timer(&self, timer_id: TimerId) -> Result<()> {
        self.send(Command::CancelTimer { timer_id })
    }

    /// Counters as of the moment every previously sent command was processed
    pub async fn snapshot(&self) -> Result<DispatcherSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Inspect { reply })?;
        rx.await.map_err(|_| StageError::Closed)
    }

    /// `None` when no slot exists for `stage_id`
    pub async fn stage_info(&self, stage_id: &str) -> Result<Option<StageInfo>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::StageInfo {
            stage_id: stage_id.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| StageError::Closed)
    }

    pub fn stage_count(&self) -> usize {
        self.shared.stats.stages.load(Ordering::Acquire)
    }

    pub fn actor_count(&self) -> usize {
        self.shared.stats.actors.load(Ordering::Acquire)
    }

    pub fn active_timer_count(&self) -> usize {
        self.shared.stats.timers.load(Ordering::Acquire)
    }

    /// Destroy every stage, cancel every timer and stop the loop
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
        let task = self.shared.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}
