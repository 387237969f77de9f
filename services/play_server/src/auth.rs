//! Authentication bridge between client sessions and the stage dispatcher
//!
//! The first frame of every session must be the authenticate message. It is
//! handed to an actor built by the default stage type's actor factory; the
//! actor decides the account and the stage. Once the actor has joined its
//! stage, every further frame of the session is routed to that stage as an
//! actor message with the client as reply target.

use async_trait::async_trait;
use codec::{ClientRequest, Packet};
use dashmap::DashMap;
use network::{ClientSession, SessionHandler, SessionSink};
use prost::Message;
use stage_actors::{ActorLink, PlayDispatcher, StageActor, StageError};
use std::sync::Arc;
use tracing::{debug, info, warn};
use types::{msg_ids, single_stage_id, AccountId, AuthenticateRes, ErrorCode, Sid, StageMode};

/// Session already bound to a stage
struct Binding {
    account_id: AccountId,
    stage_id: String,
    session: Arc<ClientSession>,
}

struct Authenticated {
    account_id: AccountId,
    stage_id: String,
    stage_type: String,
    reconnected: bool,
    reply: Option<Packet>,
}

/// Failure answered to the client before the session is closed
struct Rejection {
    error: ErrorCode,
    reply: Option<Packet>,
}

impl Rejection {
    fn new(error: ErrorCode) -> Self {
        Self { error, reply: None }
    }
}

impl From<StageError> for Rejection {
    fn from(error: StageError) -> Self {
        Self::new(error.error_code())
    }
}

pub struct AuthBridge {
    dispatcher: PlayDispatcher,
    authenticate_msg_id: String,
    default_stage_type: String,
    bindings: DashMap<Sid, Binding>,
}

impl AuthBridge {
    pub fn new(
        dispatcher: PlayDispatcher,
        authenticate_msg_id: impl Into<String>,
        default_stage_type: impl Into<String>,
    ) -> Self {
        Self {
            dispatcher,
            authenticate_msg_id: authenticate_msg_id.into(),
            default_stage_type: default_stage_type.into(),
            bindings: DashMap::new(),
        }
    }

    /// Sessions that completed authentication and are still open
    pub fn bound_sessions(&self) -> usize {
        self.bindings.len()
    }

    async fn authenticate(&self, session: &Arc<ClientSession>, request: ClientRequest) {
        let sid = session.sid();
        let msg_seq = request.msg_seq;
        let packet = Packet::new(request.msg_id, request.payload);

        match self.run_authentication(session, packet).await {
            Ok(done) => {
                if done.reconnected {
                    self.evict_previous(sid, done.account_id, &done.stage_id);
                }
                self.bindings.insert(
                    sid,
                    Binding {
                        account_id: done.account_id,
                        stage_id: done.stage_id.clone(),
                        session: Arc::clone(session),
                    },
                );

                let (payload_id, payload) = done
                    .reply
                    .map(|packet| {
                        let (msg_id, payload) = packet.into_parts();
                        (msg_id, payload.as_slice().to_vec())
                    })
                    .unwrap_or_default();
                let res = AuthenticateRes {
                    payload_id,
                    payload,
                    account_id: done.account_id,
                    stage_id: done.stage_id.clone(),
                    reconnected: done.reconnected,
                    stage_type: done.stage_type.clone(),
                };
                info!(
                    sid,
                    account_id = done.account_id,
                    stage_id = %done.stage_id,
                    stage_type = %done.stage_type,
                    reconnected = done.reconnected,
                    "Client authenticated"
                );
                if let Err(e) = session.send_response(
                    msg_ids::AUTHENTICATE_RES,
                    msg_seq,
                    &done.stage_id,
                    ErrorCode::Success.as_u16(),
                    &res.encode_to_vec(),
                ) {
                    debug!(sid, error = %e, "Authentication reply dropped");
                }
            }
            Err(rejection) => {
                warn!(sid, error_code = rejection.error.as_u16(), "Authentication failed, closing session");
                let payload = rejection.reply.map(|p| p.data().to_vec()).unwrap_or_default();
                let _ = session.send_response(
                    msg_ids::AUTHENTICATE_RES,
                    msg_seq,
                    "",
                    rejection.error.as_u16(),
                    &payload,
                );
                session.disconnect();
            }
        }
    }

    async fn run_authentication(
        &self,
        session: &Arc<ClientSession>,
        packet: Packet,
    ) -> Result<Authenticated, Rejection> {
        let sink = Arc::clone(session) as Arc<dyn SessionSink>;
        let Some(mut actor) = self.dispatcher.create_actor(&self.default_stage_type, sink) else {
            warn!(stage_type = %self.default_stage_type, "No actor factory for the default stage type");
            return Err(Rejection::new(ErrorCode::InvalidStageType));
        };

        if let Err(e) = actor.actor_mut().on_create().await {
            warn!(sid = session.sid(), error = %e, "Actor on_create failed");
            actor.destroy().await;
            return Err(Rejection::new(ErrorCode::HookFailure));
        }

        let reply = match actor.actor_mut().on_authenticate(packet).await {
            Ok((true, reply)) => reply,
            Ok((false, reply)) => {
                actor.destroy().await;
                return Err(Rejection {
                    error: ErrorCode::AuthenticationFailed,
                    reply,
                });
            }
            Err(e) => {
                warn!(sid = session.sid(), error = %e, "Actor on_authenticate failed");
                actor.destroy().await;
                return Err(Rejection::new(ErrorCode::AuthenticationFailed));
            }
        };

        match self.resolve_stage(actor.link()).await {
            Ok((stage_id, stage_type)) => self.join(actor, stage_id, stage_type, reply).await,
            Err(rejection) => {
                actor.destroy().await;
                Err(rejection)
            }
        }
    }

    /// Stage id and type chosen by the actor's authentication context
    async fn resolve_stage(&self, link: &ActorLink) -> Result<(String, String), Rejection> {
        let account_id = link.account_id();
        if account_id == 0 {
            debug!(sid = link.sid(), "Authentication context missing account id");
            return Err(Rejection::new(ErrorCode::AuthenticationFailed));
        }

        let stage_type = link.stage_type();
        if !stage_type.is_empty() {
            if self.dispatcher.registry().mode(&stage_type) != Some(StageMode::Single) {
                debug!(account_id, stage_type = %stage_type, "Stage type is not registered as single");
                return Err(Rejection::new(ErrorCode::InvalidStageType));
            }
            let stage_id = single_stage_id(&stage_type, account_id);
            self.dispatcher
                .get_or_create_stage(&stage_id, &stage_type, Packet::empty(msg_ids::GET_OR_CREATE_STAGE_REQ))
                .await?;
            return Ok((stage_id, stage_type));
        }

        let stage_id = link.stage_id();
        if stage_id.is_empty() {
            debug!(account_id, "Authentication context missing stage id");
            return Err(Rejection::new(ErrorCode::AuthenticationFailed));
        }
        let info = self
            .dispatcher
            .stage_info(&stage_id)
            .await?
            .filter(|info| info.created)
            .ok_or_else(|| Rejection::new(ErrorCode::StageNotFound))?;
        Ok((stage_id, info.stage_type))
    }

    async fn join(
        &self,
        mut actor: StageActor,
        stage_id: String,
        stage_type: String,
        reply: Option<Packet>,
    ) -> Result<Authenticated, Rejection> {
        let account_id = actor.account_id();
        if let Err(e) = actor.actor_mut().on_post_authenticate().await {
            warn!(account_id, error = %e, "Actor on_post_authenticate failed");
            actor.destroy().await;
            return Err(Rejection::new(ErrorCode::HookFailure));
        }

        let joined = self.dispatcher.join_stage(&stage_id, actor).await?;
        Ok(Authenticated {
            account_id,
            stage_id,
            stage_type,
            reconnected: joined.reconnected,
            reply,
        })
    }

    /// Close older sessions of an account whose stage actor was just taken over
    fn evict_previous(&self, sid: Sid, account_id: AccountId, stage_id: &str) {
        let stale: Vec<Sid> = self
            .bindings
            .iter()
            .filter(|b| *b.key() != sid && b.account_id == account_id && b.stage_id == stage_id)
            .map(|b| *b.key())
            .collect();
        for old_sid in stale {
            if let Some((_, binding)) = self.bindings.remove(&old_sid) {
                debug!(old_sid, sid, account_id, "Closing replaced session");
                binding.session.disconnect();
            }
        }
    }
}

#[async_trait]
impl SessionHandler for AuthBridge {
    async fn on_connect(&self, session: &Arc<ClientSession>) {
        debug!(sid = session.sid(), remote = %session.remote_addr(), "Client connected");
    }

    async fn on_message(&self, session: &Arc<ClientSession>, request: ClientRequest) {
        let sid = session.sid();
        let bound = self
            .bindings
            .get(&sid)
            .map(|b| (b.account_id, b.stage_id.clone()));

        match bound {
            Some((account_id, stage_id)) => {
                let msg_seq = request.msg_seq;
                let packet = Packet::new(request.msg_id, request.payload);
                let sink = Arc::clone(session) as Arc<dyn SessionSink>;
                if let Err(e) = self
                    .dispatcher
                    .dispatch_from_client(&stage_id, account_id, msg_seq, packet, sink)
                {
                    warn!(sid, error = %e, "Dispatcher unavailable, closing session");
                    session.disconnect();
                }
            }
            None if request.msg_id == self.authenticate_msg_id => self.authenticate(session, request).await,
            None => {
                debug!(sid, msg_id = %request.msg_id, "Message before authentication");
                let _ = session.send_response(
                    &request.msg_id,
                    request.msg_seq,
                    &request.stage_id,
                    ErrorCode::NotAuthenticated.as_u16(),
                    &[],
                );
                session.disconnect();
            }
        }
    }

    async fn on_disconnect(&self, session: &Arc<ClientSession>) {
        let sid = session.sid();
        let Some((_, binding)) = self.bindings.remove(&sid) else {
            debug!(sid, "Unauthenticated client disconnected");
            return;
        };
        debug!(sid, account_id = binding.account_id, stage_id = %binding.stage_id, "Client disconnected");
        if let Err(e) = self
            .dispatcher
            .connection_changed(&binding.stage_id, binding.account_id, sid, false)
        {
            debug!(sid, error = %e, "Disconnect not delivered");
        }
    }
}
