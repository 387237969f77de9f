//! Work items run inside a stage's mailbox
//!
//! Each job owns the stage instance for its duration and returns it in a
//! [`JobDone`], together with the state transition the loop should apply and
//! the reply to deliver once the transition is visible.

use super::{CreateStageReply, JoinStageReply, Shared};
use crate::actor::StageActor;
use crate::error::{Result, StageError};
use crate::link::ReplyTarget;
use crate::stage::BaseStage;
use crate::timer::{TimerCallback, TimerId};
use codec::{Packet, RoutePacket};
use futures::future::BoxFuture;
use futures::FutureExt;
use network::SessionSink;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use types::{msg_ids, AccountId, CreateStageRes, ErrorCode, GetOrCreateStageRes, RouteHeader, Sid};

pub(crate) type Finish = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    Unchanged,
    /// Both creation hooks succeeded
    Created,
    /// `on_post_create` failed; instance kept, state not-created
    RolledBack,
    /// `on_create` failed or declined; instance dropped
    Discarded,
    Destroyed,
}

pub(crate) struct JobDone {
    pub(crate) stage_id: String,
    pub(crate) stage: Option<Box<BaseStage>>,
    pub(crate) transition: Transition,
    pub(crate) finish: Option<Finish>,
}

impl JobDone {
    fn unchanged(stage: Box<BaseStage>, finish: Option<Finish>) -> Self {
        Self {
            stage_id: stage.stage_id.clone(),
            stage: Some(stage),
            transition: Transition::Unchanged,
            finish,
        }
    }
}

/// Where a create result goes
pub(crate) enum CreateResponder {
    Local(oneshot::Sender<Result<CreateStageReply>>),
    Mesh { request: RouteHeader, get_or_create: bool },
}

impl CreateResponder {
    pub(crate) fn respond(self, result: Result<CreateStageReply>, shared: &Shared) {
        let (request, get_or_create) = match self {
            CreateResponder::Local(tx) => {
                let _ = tx.send(result);
                return;
            }
            CreateResponder::Mesh { request, get_or_create } => (request, get_or_create),
        };
        if request.seq() == 0 {
            return;
        }

        let error = result.as_ref().err().map_or(ErrorCode::Success, StageError::error_code);
        let (ok, is_created, reply) = match result {
            Ok(reply) => (true, reply.is_created, reply.payload),
            Err(StageError::CreateDeclined { reply, .. }) => (false, false, reply),
            Err(_) => (false, false, None),
        };
        let (payload_id, payload) = reply
            .map(|packet| {
                let (msg_id, payload) = packet.into_parts();
                (msg_id, payload.as_slice().to_vec())
            })
            .unwrap_or_default();

        let packet = if get_or_create {
            Packet::from_message(
                msg_ids::GET_OR_CREATE_STAGE_RES,
                &GetOrCreateStageRes {
                    result: ok,
                    is_created,
                    payload_id,
                    payload,
                },
            )
        } else {
            Packet::from_message(
                msg_ids::CREATE_STAGE_RES,
                &CreateStageRes {
                    result: ok,
                    payload_id,
                    payload,
                },
            )
        };
        shared.mesh.send_reply(&request, packet, error);
    }
}

/// Completion signal for commands without a typed result
pub(crate) enum Ack {
    Local(oneshot::Sender<Result<()>>),
    Mesh(RouteHeader),
}

impl Ack {
    pub(crate) fn send(self, result: Result<()>, reply_msg_id: &str, shared: &Shared) {
        match self {
            Ack::Local(tx) => {
                let _ = tx.send(result);
            }
            Ack::Mesh(request) => {
                if request.seq() != 0 {
                    let error = result.as_ref().err().map_or(ErrorCode::Success, StageError::error_code);
                    shared.mesh.send_reply(&request, Packet::empty(reply_msg_id), error);
                }
            }
        }
    }
}

pub(crate) enum StageJob {
    Create {
        stage_type: String,
        packet: Packet,
        get_or_create: bool,
        responder: CreateResponder,
    },
    Destroy {
        ack: Option<Ack>,
    },
    Dispatch {
        packet: RoutePacket,
        ack: Option<Ack>,
    },
    ClientDispatch {
        account_id: AccountId,
        msg_seq: u16,
        packet: Packet,
        session: Arc<dyn SessionSink>,
    },
    Join {
        actor: StageActor,
        reply: oneshot::Sender<Result<JoinStageReply>>,
    },
    Leave {
        account_id: AccountId,
    },
    ConnectionChanged {
        account_id: AccountId,
        sid: Sid,
        connected: bool,
    },
    Timer {
        timer_id: TimerId,
        callback: TimerCallback,
    },
}

impl StageJob {
    pub(crate) fn run(self, stage: Box<BaseStage>, shared: Arc<Shared>) -> BoxFuture<'static, JobDone> {
        match self {
            StageJob::Create { packet, responder, .. } => create(stage, packet, responder, shared).boxed(),
            StageJob::Destroy { ack } => destroy(stage, ack, shared).boxed(),
            StageJob::Dispatch { packet, ack } => async move {
                let mut stage = stage;
                let result = dispatch(&mut stage, packet).await;
                let finish = ack.map(|ack| -> Finish { Box::new(move || ack.send(result, msg_ids::ERROR_RES, &shared)) });
                JobDone::unchanged(stage, finish)
            }
            .boxed(),
            StageJob::ClientDispatch {
                account_id,
                msg_seq,
                packet,
                session,
            } => async move {
                let mut stage = stage;
                client_dispatch(&mut stage, account_id, msg_seq, packet, session).await;
                JobDone::unchanged(stage, None)
            }
            .boxed(),
            StageJob::Join { actor, reply } => async move {
                let mut stage = stage;
                let result = join(&mut stage, actor).await;
                JobDone::unchanged(
                    stage,
                    Some(Box::new(move || {
                        let _ = reply.send(result);
                    })),
                )
            }
            .boxed(),
            StageJob::Leave { account_id } => async move {
                let mut stage = stage;
                leave(&mut stage, account_id).await;
                JobDone::unchanged(stage, None)
            }
            .boxed(),
            StageJob::ConnectionChanged {
                account_id,
                sid,
                connected,
            } => async move {
                let mut stage = stage;
                connection_changed(&mut stage, account_id, sid, connected).await;
                JobDone::unchanged(stage, None)
            }
            .boxed(),
            StageJob::Timer { timer_id, callback } => async move {
                debug!(stage_id = %stage.stage_id, timer_id, "Timer tick");
                callback().await;
                JobDone::unchanged(stage, None)
            }
            .boxed(),
        }
    }
}

async fn create(mut stage: Box<BaseStage>, packet: Packet, responder: CreateResponder, shared: Arc<Shared>) -> JobDone {
    let stage_id = stage.stage_id.clone();

    let (transition, result) = match stage.stage.on_create(packet).await {
        Err(e) => {
            warn!(stage_id = %stage_id, error = %e, "Stage on_create failed");
            (
                Transition::Discarded,
                Err(StageError::hook_failure(&stage_id, "on_create", e)),
            )
        }
        Ok((false, reply)) => {
            debug!(stage_id = %stage_id, "Stage declined creation");
            (
                Transition::Discarded,
                Err(StageError::CreateDeclined {
                    stage_id: stage_id.clone(),
                    reply,
                }),
            )
        }
        Ok((true, reply)) => match stage.stage.on_post_create().await {
            Ok(()) => {
                info!(stage_id = %stage_id, stage_type = %stage.stage_type, "Stage created");
                (
                    Transition::Created,
                    Ok(CreateStageReply {
                        is_created: true,
                        payload: reply,
                    }),
                )
            }
            Err(e) => {
                warn!(stage_id = %stage_id, error = %e, "Stage on_post_create failed, rolled back to not-created");
                (
                    Transition::RolledBack,
                    Err(StageError::hook_failure(&stage_id, "on_post_create", e)),
                )
            }
        },
    };

    if transition != Transition::Created {
        let cancelled = shared.mesh.request_cache().cancel_for_stage(&stage_id);
        if cancelled > 0 {
            debug!(stage_id = %stage_id, cancelled, "Cancelled requests of failed stage creation");
        }
    }

    JobDone {
        stage_id,
        stage: (transition != Transition::Discarded).then_some(stage),
        transition,
        finish: Some(Box::new(move || responder.respond(result, &shared))),
    }
}

async fn destroy(mut stage: Box<BaseStage>, ack: Option<Ack>, shared: Arc<Shared>) -> JobDone {
    let stage_id = stage.stage_id.clone();

    if let Err(e) = stage.stage.on_destroy().await {
        warn!(stage_id = %stage_id, error = %e, "Stage on_destroy failed");
    }
    let cancelled = shared.mesh.request_cache().cancel_for_stage(&stage_id);

    let actors: Vec<StageActor> = stage.actors.drain().map(|(_, actor)| actor).collect();
    let actor_count = actors.len();
    for actor in actors {
        actor.destroy().await;
    }
    info!(stage_id = %stage_id, cancelled, actors = actor_count, "Stage destroyed");

    JobDone {
        stage_id,
        stage: None,
        transition: Transition::Destroyed,
        finish: ack.map(|ack| -> Finish { Box::new(move || ack.send(Ok(()), msg_ids::DESTROY_STAGE_RES, &shared)) }),
    }
}

async fn dispatch(stage: &mut BaseStage, packet: RoutePacket) -> Result<()> {
    let BaseStage {
        stage_id,
        stage: hooks,
        actors,
        link,
        ..
    } = stage;

    let account_id = packet.header.account_id;
    let msg_id = packet.header.msg_id.clone();
    let target = (packet.header.seq() != 0).then(|| ReplyTarget::Mesh(packet.header.clone()));
    let packet = packet.into_packet();

    link.begin_request(target);
    let result = match actors.get_mut(&account_id).filter(|_| account_id != 0) {
        Some(actor) => hooks.on_actor_dispatch(actor, packet).await,
        None => hooks.on_dispatch(packet).await,
    };
    let unanswered = link.end_request();

    result.map_err(|e| {
        warn!(stage_id = %stage_id, msg_id = %msg_id, error = %e, "Stage dispatch failed");
        if let Some(target) = unanswered {
            target.send_error(link.mesh(), ErrorCode::HookFailure);
        }
        StageError::hook_failure(stage_id, "on_dispatch", e)
    })
}

async fn client_dispatch(
    stage: &mut BaseStage,
    account_id: AccountId,
    msg_seq: u16,
    packet: Packet,
    session: Arc<dyn SessionSink>,
) {
    let BaseStage {
        stage_id,
        stage: hooks,
        actors,
        link,
        ..
    } = stage;

    let Some(actor) = actors.get_mut(&account_id) else {
        debug!(stage_id = %stage_id, account_id, msg_id = %packet.msg_id(), "Client message for actor not in stage");
        if msg_seq != 0 {
            let _ = session.send_response(
                packet.msg_id(),
                msg_seq,
                stage_id,
                ErrorCode::NotAuthenticated.as_u16(),
                &[],
            );
        }
        return;
    };

    let msg_id = packet.msg_id().to_string();
    let target = (msg_seq != 0).then(|| ReplyTarget::Client {
        session: Arc::clone(&session),
        msg_id: msg_id.clone(),
        msg_seq,
        stage_id: stage_id.clone(),
    });

    link.begin_request(target);
    let result = hooks.on_actor_dispatch(actor, packet).await;
    let unanswered = link.end_request();

    if let Err(e) = result {
        warn!(stage_id = %stage_id, account_id, msg_id = %msg_id, error = %e, "Actor dispatch failed");
        if let Some(target) = unanswered {
            target.send_error(link.mesh(), ErrorCode::HookFailure);
        }
    }
}

async fn join(stage: &mut BaseStage, mut actor: StageActor) -> Result<JoinStageReply> {
    let BaseStage {
        stage_id,
        stage: hooks,
        actors,
        link,
        ..
    } = stage;
    let account_id = actor.account_id();

    if account_id == 0 {
        actor.destroy().await;
        return Err(StageError::Rejected {
            stage_id: stage_id.clone(),
            account_id,
        });
    }

    if let Some(existing) = actors.get_mut(&account_id) {
        existing.link().replace_session(actor.link().session());
        info!(stage_id = %stage_id, account_id, sid = existing.link().sid(), "Actor reconnected");
        if let Err(e) = hooks.on_connection_changed(existing, true).await {
            warn!(stage_id = %stage_id, account_id, error = %e, "on_connection_changed failed");
        }
        actor.destroy().await;
        return Ok(JoinStageReply { reconnected: true });
    }

    match hooks.on_join_stage(&mut actor).await {
        Ok(true) => {
            actor.link().bind_stage(link.clone());
            if let Err(e) = hooks.on_post_join_stage(&mut actor).await {
                warn!(stage_id = %stage_id, account_id, error = %e, "on_post_join_stage failed");
            }
            debug!(stage_id = %stage_id, account_id, "Actor joined stage");
            actors.insert(account_id, actor);
            Ok(JoinStageReply { reconnected: false })
        }
        Ok(false) => {
            actor.destroy().await;
            Err(StageError::Rejected {
                stage_id: stage_id.clone(),
                account_id,
            })
        }
        Err(e) => {
            actor.destroy().await;
            Err(StageError::hook_failure(stage_id, "on_join_stage", e))
        }
    }
}

async fn leave(stage: &mut BaseStage, account_id: AccountId) {
    match stage.actors.remove(&account_id) {
        Some(actor) => {
            actor.destroy().await;
            debug!(stage_id = %stage.stage_id, account_id, "Actor left stage");
        }
        None => debug!(stage_id = %stage.stage_id, account_id, "Leave for actor not in stage"),
    }
}

async fn connection_changed(stage: &mut BaseStage, account_id: AccountId, sid: Sid, connected: bool) {
    let BaseStage {
        stage_id,
        stage: hooks,
        actors,
        ..
    } = stage;

    let Some(actor) = actors.get_mut(&account_id) else {
        return;
    };
    // a stale disconnect from a replaced session
    if !connected && actor.link().sid() != sid {
        debug!(stage_id = %stage_id, account_id, sid, "Ignoring disconnect of replaced session");
        return;
    }
    if let Err(e) = hooks.on_connection_changed(actor, connected).await {
        warn!(stage_id = %stage_id, account_id, error = %e, "on_connection_changed failed");
    }
}
