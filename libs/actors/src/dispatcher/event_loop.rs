//! The dispatcher task
//!
//! Owns the stage table, the per-stage mailboxes and the timer table. Nothing
//! here blocks: hooks run inside `running` and report back through
//! [`JobDone`].

use super::jobs::{JobDone, StageJob, Transition};
use super::{Ack, Command, CreateResponder, CreateStageReply, DispatcherSnapshot, Shared, StageInfo};
use crate::error::StageError;
use crate::link::StageLink;
use crate::stage::BaseStage;
use crate::timer::{TimerCallback, TimerId, TimerKind};
use codec::{Packet, RoutePacket};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use types::{msg_ids, CreateStageReq, ErrorCode, GetOrCreateStageReq};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum SlotState {
    #[default]
    NotCreated,
    Created,
}

/// Mailbox and instance of one stage id
#[derive(Default)]
struct StageSlot {
    /// `None` while a job holds the instance, or before the first create
    stage: Option<Box<BaseStage>>,
    stage_type: String,
    state: SlotState,
    queue: VecDeque<StageJob>,
    busy: bool,
    /// Actor count as of the last finished job
    actors: usize,
}

struct TimerEntry {
    stage_id: String,
    callback: TimerCallback,
    remaining: Option<u32>,
    task: JoinHandle<()>,
}

pub(crate) struct DispatcherLoop {
    shared: Arc<Shared>,
    slots: HashMap<String, StageSlot>,
    running: FuturesUnordered<BoxFuture<'static, JobDone>>,
    timers: HashMap<TimerId, TimerEntry>,
    shutdown: Vec<oneshot::Sender<()>>,
    closing: bool,
}

impl DispatcherLoop {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            slots: HashMap::new(),
            running: FuturesUnordered::new(),
            timers: HashMap::new(),
            shutdown: Vec::new(),
            closing: false,
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        info!(server_id = %self.shared.mesh.server_id(), "Stage dispatcher started");

        loop {
            if self.closing && self.slots.is_empty() && self.running.is_empty() {
                break;
            }
            tokio::select! {
                Some(done) = self.running.next(), if !self.running.is_empty() => {
                    // commands a job posted before it returned are applied ahead of its outcome
                    while let Ok(command) = rx.try_recv() {
                        self.handle(command);
                    }
                    self.finish_job(done)
                }
                command = rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
            }
        }

        for (_, entry) in self.timers.drain() {
            entry.task.abort();
        }
        let stats = &self.shared.stats;
        stats.timers.store(0, Ordering::Release);
        stats.stages.store(0, Ordering::Release);
        stats.actors.store(0, Ordering::Release);

        for waiter in self.shutdown.drain(..) {
            let _ = waiter.send(());
        }
        info!(server_id = %self.shared.mesh.server_id(), "Stage dispatcher stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Route(packet) => self.route(packet),
            Command::CreateStage {
                stage_id,
                stage_type,
                packet,
                get_or_create,
                responder,
            } => self.enqueue(
                &stage_id,
                StageJob::Create {
                    stage_type,
                    packet,
                    get_or_create,
                    responder,
                },
            ),
            Command::DestroyStage { stage_id, ack } => self.enqueue(&stage_id, StageJob::Destroy { ack }),
            Command::Dispatch { stage_id, packet, ack } => self.enqueue(&stage_id, StageJob::Dispatch { packet, ack }),
            Command::ClientDispatch {
                stage_id,
                account_id,
                msg_seq,
                packet,
                session,
            } => self.enqueue(
                &stage_id,
                StageJob::ClientDispatch {
                    account_id,
                    msg_seq,
                    packet,
                    session,
                },
            ),
            Command::JoinStage { stage_id, actor, reply } => self.enqueue(&stage_id, StageJob::Join { actor, reply }),
            Command::LeaveStage { stage_id, account_id } => self.enqueue(&stage_id, StageJob::Leave { account_id }),
            Command::ConnectionChanged {
                stage_id,
                account_id,
                sid,
                connected,
            } => self.enqueue(
                &stage_id,
                StageJob::ConnectionChanged {
                    account_id,
                    sid,
                    connected,
                },
            ),
            Command::AddTimer {
                timer_id,
                stage_id,
                kind,
                callback,
            } => self.add_timer(timer_id, stage_id, kind, callback),
            Command::CancelTimer { timer_id } => {
                self.cancel_timer(timer_id);
            }
            Command::TimerFired { timer_id } => self.timer_fired(timer_id),
            Command::Inspect { reply } => {
                let stats = &self.shared.stats;
                let _ = reply.send(DispatcherSnapshot {
                    stage_count: stats.stages.load(Ordering::Acquire),
                    actor_count: stats.actors.load(Ordering::Acquire),
                    timer_count: stats.timers.load(Ordering::Acquire),
                });
            }
            Command::StageInfo { stage_id, reply } => {
                let info = self.slots.get(&stage_id).map(|slot| StageInfo {
                    stage_id: stage_id.clone(),
                    stage_type: slot.stage_type.clone(),
                    created: slot.state == SlotState::Created,
                    actor_count: slot.actors,
                });
                let _ = reply.send(info);
            }
            Command::Shutdown { reply } => self.begin_shutdown(reply),
        }
    }

    /// Inbound mesh packet that is not a reply
    fn route(&mut self, packet: RoutePacket) {
        if packet.header.is_reply {
            warn!(msg_id = %packet.msg_id(), from = %packet.header.from, "Reply reached the dispatcher, dropped");
            return;
        }

        if packet.header.is_system {
            match packet.msg_id() {
                msg_ids::CREATE_STAGE_REQ => return self.route_create(packet, false),
                msg_ids::GET_OR_CREATE_STAGE_REQ => return self.route_create(packet, true),
                msg_ids::DESTROY_STAGE_REQ => {
                    let stage_id = packet.header.stage_id.clone();
                    return self.enqueue(
                        &stage_id,
                        StageJob::Destroy {
                            ack: Some(Ack::Mesh(packet.header)),
                        },
                    );
                }
                _ => {}
            }
        }

        if packet.header.stage_id.is_empty() {
            debug!(msg_id = %packet.msg_id(), from = %packet.header.from, "Mesh packet without a stage id");
            if packet.msg_seq() != 0 {
                self.shared
                    .mesh
                    .send_reply(&packet.header, Packet::empty(msg_ids::ERROR_RES), ErrorCode::StageNotFound);
            }
            return;
        }

        let stage_id = packet.header.stage_id.clone();
        self.enqueue(&stage_id, StageJob::Dispatch { packet, ack: None });
    }

    fn route_create(&mut self, packet: RoutePacket, get_or_create: bool) {
        let parsed = if get_or_create {
            packet
                .parse::<GetOrCreateStageReq>()
                .map(|req| (req.stage_type, req.payload_id, req.payload))
        } else {
            packet
                .parse::<CreateStageReq>()
                .map(|req| (req.stage_type, req.payload_id, req.payload))
        };
        let reply_id = if get_or_create {
            msg_ids::GET_OR_CREATE_STAGE_RES
        } else {
            msg_ids::CREATE_STAGE_RES
        };
        let header = packet.header;

        let (stage_type, payload_id, payload) = match parsed {
            Ok(parts) if !header.stage_id.is_empty() => parts,
            Ok(_) => {
                warn!(from = %header.from, msg_id = %header.msg_id, "Create request without a stage id");
                if header.seq() != 0 {
                    self.shared
                        .mesh
                        .send_reply(&header, Packet::empty(reply_id), ErrorCode::InvalidPayload);
                }
                return;
            }
            Err(e) => {
                warn!(from = %header.from, msg_id = %header.msg_id, error = %e, "Malformed create request");
                if header.seq() != 0 {
                    self.shared
                        .mesh
                        .send_reply(&header, Packet::empty(reply_id), ErrorCode::InvalidPayload);
                }
                return;
            }
        };

        let stage_id = header.stage_id.clone();
        self.enqueue(
            &stage_id,
            StageJob::Create {
                stage_type,
                packet: Packet::new(payload_id, payload),
                get_or_create,
                responder: CreateResponder::Mesh {
                    request: header,
                    get_or_create,
                },
            },
        );
    }

    /// Queue `job` behind whatever `stage_id` is already doing
    fn enqueue(&mut self, stage_id: &str, job: StageJob) {
        if stage_id.is_empty() {
            return self.reject(stage_id, job, StageError::not_found(stage_id));
        }
        if !self.slots.contains_key(stage_id) {
            if !matches!(job, StageJob::Create { .. }) {
                return self.reject(stage_id, job, StageError::not_found(stage_id));
            }
            self.slots.insert(stage_id.to_string(), StageSlot::default());
        }
        if let Some(slot) = self.slots.get_mut(stage_id) {
            slot.queue.push_back(job);
        }
        self.pump(stage_id);
    }

    /// Start queued jobs for `stage_id` until one is in flight
    fn pump(&mut self, stage_id: &str) {
        loop {
            let Some(slot) = self.slots.get_mut(stage_id) else {
                return;
            };
            if slot.busy {
                return;
            }
            let Some(job) = slot.queue.pop_front() else {
                if self.closing && slot.state == SlotState::Created {
                    slot.queue.push_back(StageJob::Destroy { ack: None });
                    continue;
                }
                if slot.state == SlotState::NotCreated && (slot.stage.is_none() || self.closing) {
                    self.slots.remove(stage_id);
                }
                return;
            };
            self.start_job(stage_id, job);
        }
    }

    fn start_job(&mut self, stage_id: &str, job: StageJob) {
        let shared = Arc::clone(&self.shared);
        let closing = self.closing;
        let Some(slot) = self.slots.get_mut(stage_id) else {
            return;
        };

        let job = match job {
            StageJob::Create {
                stage_type,
                packet,
                get_or_create,
                responder,
            } => {
                if slot.state == SlotState::Created {
                    let result = if get_or_create {
                        Ok(CreateStageReply {
                            is_created: false,
                            payload: None,
                        })
                    } else {
                        Err(StageError::AlreadyExists {
                            stage_id: stage_id.to_string(),
                        })
                    };
                    return responder.respond(result, &shared);
                }
                if closing {
                    return responder.respond(Err(StageError::Closed), &shared);
                }
                if slot.stage.as_ref().map_or(true, |stage| stage.stage_type != stage_type) {
                    let link = StageLink::new(stage_id, &stage_type, &shared.mesh, shared.port.clone());
                    match shared.registry.create_stage(&stage_type, link.clone()) {
                        Some(stage) => {
                            slot.stage = Some(Box::new(BaseStage::new(link, stage)));
                            slot.stage_type = stage_type.clone();
                        }
                        None => {
                            debug!(stage_id, stage_type = %stage_type, "Create for unregistered stage type");
                            return responder.respond(Err(StageError::UnknownType { stage_type }), &shared);
                        }
                    }
                }
                StageJob::Create {
                    stage_type,
                    packet,
                    get_or_create,
                    responder,
                }
            }
            StageJob::Destroy { ack } if slot.state == SlotState::NotCreated => {
                // rolled-back instance, never visible as created
                slot.stage = None;
                if let Some(ack) = ack {
                    ack.send(Ok(()), msg_ids::DESTROY_STAGE_RES, &shared);
                }
                return;
            }
            job if slot.state == SlotState::NotCreated => {
                return self.reject(stage_id, job, StageError::not_found(stage_id));
            }
            job => job,
        };

        let Some(stage) = slot.stage.take() else {
            warn!(stage_id, "Stage instance missing from idle slot");
            return self.reject(stage_id, job, StageError::not_found(stage_id));
        };
        slot.busy = true;
        self.running.push(job.run(stage, shared));
    }

    fn finish_job(&mut self, done: JobDone) {
        let JobDone {
            stage_id,
            stage,
            transition,
            finish,
        } = done;
        let stats = &self.shared.stats;

        let Some(slot) = self.slots.get_mut(&stage_id) else {
            if let Some(finish) = finish {
                finish();
            }
            return;
        };
        slot.busy = false;

        let actors = stage.as_ref().map_or(0, |stage| stage.actors.len());
        if actors > slot.actors {
            stats.actors.fetch_add(actors - slot.actors, Ordering::AcqRel);
        } else if actors < slot.actors {
            stats.actors.fetch_sub(slot.actors - actors, Ordering::AcqRel);
        }
        slot.actors = actors;
        slot.stage = stage;

        match transition {
            Transition::Created => {
                slot.state = SlotState::Created;
                stats.stages.fetch_add(1, Ordering::AcqRel);
            }
            Transition::Destroyed => {
                slot.state = SlotState::NotCreated;
                stats.stages.fetch_sub(1, Ordering::AcqRel);
                self.cancel_stage_timers(&stage_id);
            }
            Transition::RolledBack | Transition::Discarded => self.cancel_stage_timers(&stage_id),
            Transition::Unchanged => {}
        }

        if let Some(finish) = finish {
            finish();
        }
        self.pump(&stage_id);
    }

    /// Answer a job that cannot run because its stage is not there
    fn reject(&mut self, stage_id: &str, job: StageJob, error: StageError) {
        let shared = &self.shared;
        match job {
            StageJob::Create { responder, .. } => responder.respond(Err(error), shared),
            StageJob::Destroy { ack } => {
                if let Some(ack) = ack {
                    ack.send(Ok(()), msg_ids::DESTROY_STAGE_RES, shared);
                }
            }
            StageJob::Dispatch { packet, ack } => match ack {
                Some(ack) => ack.send(Err(error), msg_ids::ERROR_RES, shared),
                None => {
                    debug!(stage_id, msg_id = %packet.msg_id(), from = %packet.header.from, "Message for absent stage");
                    if packet.msg_seq() != 0 {
                        shared
                            .mesh
                            .send_reply(&packet.header, Packet::empty(msg_ids::ERROR_RES), error.error_code());
                    }
                }
            },
            StageJob::ClientDispatch {
                account_id,
                msg_seq,
                packet,
                session,
            } => {
                debug!(stage_id, account_id, msg_id = %packet.msg_id(), "Client message for absent stage");
                if msg_seq != 0 {
                    let _ = session.send_response(packet.msg_id(), msg_seq, stage_id, error.error_code().as_u16(), &[]);
                }
            }
            StageJob::Join { actor, reply } => {
                let _ = reply.send(Err(error));
                tokio::spawn(actor.destroy());
            }
            StageJob::Leave { account_id } => debug!(stage_id, account_id, "Leave for absent stage"),
            StageJob::ConnectionChanged { account_id, .. } => {
                debug!(stage_id, account_id, "Connection change for absent stage")
            }
            StageJob::Timer { timer_id, .. } => {
                debug!(stage_id, timer_id, "Timer fired for absent stage, cancelled");
                self.cancel_timer(timer_id);
            }
        }
    }

    fn add_timer(&mut self, timer_id: TimerId, stage_id: String, kind: TimerKind, callback: TimerCallback) {
        if self.closing || kind.ticks() == Some(0) {
            debug!(stage_id = %stage_id, timer_id, "Timer not scheduled");
            return;
        }

        let port = self.shared.port.clone();
        let start = Instant::now() + kind.initial_delay();
        let period = kind.period();
        let ticks = kind.ticks();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut left = ticks;
            loop {
                interval.tick().await;
                if !port.post(Command::TimerFired { timer_id }) {
                    break;
                }
                if let Some(left) = left.as_mut() {
                    *left -= 1;
                    if *left == 0 {
                        break;
                    }
                }
            }
        });

        debug!(stage_id = %stage_id, timer_id, ?kind, "Timer scheduled");
        self.timers.insert(
            timer_id,
            TimerEntry {
                stage_id,
                callback,
                remaining: ticks,
                task,
            },
        );
        self.shared.stats.timers.fetch_add(1, Ordering::AcqRel);
    }

    fn timer_fired(&mut self, timer_id: TimerId) {
        let Some(entry) = self.timers.get_mut(&timer_id) else {
            return;
        };
        let stage_id = entry.stage_id.clone();
        let callback = Arc::clone(&entry.callback);

        if let Some(remaining) = entry.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                self.timers.remove(&timer_id);
                self.shared.stats.timers.fetch_sub(1, Ordering::AcqRel);
            }
        }

        self.enqueue(&stage_id, StageJob::Timer { timer_id, callback });
    }

    fn cancel_timer(&mut self, timer_id: TimerId) -> bool {
        match self.timers.remove(&timer_id) {
            Some(entry) => {
                entry.task.abort();
                self.shared.stats.timers.fetch_sub(1, Ordering::AcqRel);
                true
            }
            None => false,
        }
    }

    fn cancel_stage_timers(&mut self, stage_id: &str) {
        let ids: Vec<TimerId> = self
            .timers
            .iter()
            .filter(|(_, entry)| entry.stage_id == stage_id)
            .map(|(id, _)| *id)
            .collect();
        if !ids.is_empty() {
            debug!(stage_id, count = ids.len(), "Cancelling stage timers");
        }
        for id in ids {
            self.cancel_timer(id);
        }
    }

    fn begin_shutdown(&mut self, reply: oneshot::Sender<()>) {
        self.shutdown.push(reply);
        if self.closing {
            return;
        }
        self.closing = true;
        info!(stages = self.slots.len(), timers = self.timers.len(), "Stage dispatcher shutting down");

        let timer_ids: Vec<TimerId> = self.timers.keys().copied().collect();
        for id in timer_ids {
            self.cancel_timer(id);
        }
        let stage_ids: Vec<String> = self.slots.keys().cloned().collect();
        for stage_id in stage_ids {
            self.pump(&stage_id);
        }
    }
}
