//! Handles given to stage and actor code
//!
//! - [`MeshLink`]: send and request over the mesh
//! - [`StageLink`]: a stage's view of the runtime (replies, timers, close)
//! - [`ActorLink`]: an actor's view (authentication context, client push,
//!   leave)
//!
//! Links are cheap to clone and never block. Anything that changes dispatcher
//! state is posted as a command and happens after the current hook returns.

use crate::dispatcher::{Command, CommandPort};
use crate::error::{Result, StageError};
use crate::timer::{TimerCallback, TimerId, TimerKind};
use codec::{Packet, RoutePacket};
use network::{PacketSender, RequestCache, SessionSink};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use types::{
    msg_ids, AccountId, CreateStageReq, CreateStageRes, DestroyStageReq, ErrorCode, GetOrCreateStageReq,
    GetOrCreateStageRes, RouteHeader, Sid,
};

/// Mesh operations shared by stages, actors and the node itself
#[derive(Clone)]
pub struct MeshLink {
    sender: Arc<dyn PacketSender>,
    cache: Arc<RequestCache>,
    /// Requests made through this link are cancelled when this stage goes away
    owner_stage: Option<String>,
    account_id: AccountId,
}

impl MeshLink {
    pub fn new(sender: Arc<dyn PacketSender>, cache: Arc<RequestCache>) -> Self {
        Self {
            sender,
            cache,
            owner_stage: None,
            account_id: 0,
        }
    }

    pub(crate) fn for_stage(&self, stage_id: &str) -> Self {
        Self {
            owner_stage: Some(stage_id.to_string()),
            ..self.clone()
        }
    }

    pub(crate) fn for_account(&self, account_id: AccountId) -> Self {
        Self {
            account_id,
            ..self.clone()
        }
    }

    pub fn server_id(&self) -> &str {
        self.sender.server_id()
    }

    pub fn request_cache(&self) -> &Arc<RequestCache> {
        &self.cache
    }

    fn header(&self, stage_id: &str) -> RouteHeader {
        RouteHeader::new("", self.sender.server_id())
            .with_stage(stage_id)
            .with_account(self.account_id)
    }

    pub fn send_to_server(&self, server_id: &str, packet: Packet) {
        self.sender
            .send(server_id, RoutePacket::from_packet(self.header(""), packet));
    }

    pub async fn request_to_server(&self, server_id: &str, packet: Packet) -> Result<Packet> {
        self.request(server_id, self.header(""), packet, None).await
    }

    pub fn send_to_stage(&self, server_id: &str, stage_id: &str, packet: Packet) {
        self.sender
            .send(server_id, RoutePacket::from_packet(self.header(stage_id), packet));
    }

    pub async fn request_to_stage(&self, server_id: &str, stage_id: &str, packet: Packet) -> Result<Packet> {
        self.request(server_id, self.header(stage_id), packet, None).await
    }

    /// Request with an explicit deadline instead of the cache default
    pub async fn request_with_timeout(
        &self,
        server_id: &str,
        stage_id: &str,
        packet: Packet,
        timeout: Duration,
    ) -> Result<Packet> {
        self.request(server_id, self.header(stage_id), packet, Some(timeout))
            .await
    }

    /// Ask `server_id` to create a stage
    pub async fn create_stage(
        &self,
        server_id: &str,
        stage_type: &str,
        stage_id: &str,
        packet: Packet,
    ) -> Result<CreateStageRes> {
        let (payload_id, payload) = packet.into_parts();
        let req = CreateStageReq {
            stage_type: stage_type.to_string(),
            payload_id,
            payload: payload.as_slice().to_vec(),
        };
        let header = self.header(stage_id).system();
        let reply = self
            .request(server_id, header, Packet::from_message(msg_ids::CREATE_STAGE_REQ, &req), None)
            .await?;
        reply.parse().map_err(|e| {
            warn!(error = %e, "Malformed CreateStageRes");
            StageError::ErrorReply {
                msg_id: msg_ids::CREATE_STAGE_RES.to_string(),
                error_code: ErrorCode::InvalidPayload.as_u16(),
            }
        })
    }

    pub async fn get_or_create_stage(
        &self,
        server_id: &str,
        stage_type: &str,
        stage_id: &str,
        packet: Packet,
    ) -> Result<GetOrCreateStageRes> {
        let (payload_id, payload) = packet.into_parts();
        let req = GetOrCreateStageReq {
            stage_type: stage_type.to_string(),
            payload_id,
            payload: payload.as_slice().to_vec(),
        };
        let header = self.header(stage_id).system();
        let reply = self
            .request(
                server_id,
                header,
                Packet::from_message(msg_ids::GET_OR_CREATE_STAGE_REQ, &req),
                None,
            )
            .await?;
        reply.parse().map_err(|e| {
            warn!(error = %e, "Malformed GetOrCreateStageRes");
            StageError::ErrorReply {
                msg_id: msg_ids::GET_OR_CREATE_STAGE_RES.to_string(),
                error_code: ErrorCode::InvalidPayload.as_u16(),
            }
        })
    }

    /// Fire-and-forget stage destruction on `server_id`
    pub fn destroy_stage(&self, server_id: &str, stage_id: &str, reason: &str) {
        let req = DestroyStageReq {
            reason: reason.to_string(),
        };
        let header = self.header(stage_id).system();
        self.sender.send(
            server_id,
            RoutePacket::from_packet(header, Packet::from_message(msg_ids::DESTROY_STAGE_REQ, &req)),
        );
    }

    /// Answer `request` with `packet`
    pub fn send_reply(&self, request: &RouteHeader, packet: Packet, error: ErrorCode) {
        let header = request.reply(packet.msg_id(), self.sender.server_id(), error);
        self.sender
            .send(&request.from, RoutePacket::from_packet(header, packet));
    }

    async fn request(
        &self,
        server_id: &str,
        header: RouteHeader,
        packet: Packet,
        timeout: Option<Duration>,
    ) -> Result<Packet> {
        let (seq, reply) = self
            .cache
            .register(packet.msg_id(), self.owner_stage.as_deref(), timeout)?;
        self.sender
            .send(server_id, RoutePacket::from_packet(header.with_seq(seq), packet));
        Ok(reply.await?.into_packet())
    }
}

/// Where the reply to the message currently being handled goes
pub(crate) enum ReplyTarget {
    Mesh(RouteHeader),
    Client {
        session: Arc<dyn SessionSink>,
        msg_id: String,
        msg_seq: u16,
        stage_id: String,
    },
}

impl ReplyTarget {
    pub(crate) fn send(self, mesh: &MeshLink, packet: Packet, error: ErrorCode) {
        match self {
            ReplyTarget::Mesh(request) => mesh.send_reply(&request, packet, error),
            ReplyTarget::Client {
                session,
                msg_seq,
                stage_id,
                ..
            } => {
                if let Err(e) = session.send_response(packet.msg_id(), msg_seq, &stage_id, error.as_u16(), packet.data())
                {
                    debug!(sid = session.sid(), error = %e, "Client reply dropped");
                }
            }
        }
    }

    pub(crate) fn send_error(self, mesh: &MeshLink, error: ErrorCode) {
        let msg_id = match &self {
            ReplyTarget::Mesh(_) => msg_ids::ERROR_RES.to_string(),
            ReplyTarget::Client { msg_id, .. } => msg_id.clone(),
        };
        self.send(mesh, Packet::empty(msg_id), error);
    }
}

struct StageLinkInner {
    stage_id: String,
    stage_type: String,
    mesh: MeshLink,
    port: CommandPort,
    reply: Mutex<Option<ReplyTarget>>,
}

/// A stage's handle to the runtime
#[derive(Clone)]
pub struct StageLink {
    inner: Arc<StageLinkInner>,
}

impl StageLink {
    pub(crate) fn new(stage_id: &str, stage_type: &str, mesh: &MeshLink, port: CommandPort) -> Self {
        Self {
            inner: Arc::new(StageLinkInner {
                stage_id: stage_id.to_string(),
                stage_type: stage_type.to_string(),
                mesh: mesh.for_stage(stage_id),
                port,
                reply: Mutex::new(None),
            }),
        }
    }

    pub fn stage_id(&self) -> &str {
        &self.inner.stage_id
    }

    pub fn stage_type(&self) -> &str {
        &self.inner.stage_type
    }

    /// Mesh operations owned by this stage
    pub fn mesh(&self) -> &MeshLink {
        &self.inner.mesh
    }

    /// True while handling a message that expects a reply
    pub fn is_request(&self) -> bool {
        self.inner.reply.lock().is_some()
    }

    /// Reply to the message currently being handled
    pub fn reply(&self, packet: Packet) {
        match self.inner.reply.lock().take() {
            Some(target) => target.send(&self.inner.mesh, packet, ErrorCode::Success),
            None => warn!(
                stage_id = %self.inner.stage_id,
                msg_id = %packet.msg_id(),
                "Reply without a pending request dropped"
            ),
        }
    }

    pub fn reply_error(&self, error: ErrorCode) {
        if let Some(target) = self.inner.reply.lock().take() {
            target.send_error(&self.inner.mesh, error);
        }
    }

    pub(crate) fn begin_request(&self, target: Option<ReplyTarget>) {
        *self.inner.reply.lock() = target;
    }

    /// Clear the reply slot, returning the target if nobody replied
    pub(crate) fn end_request(&self) -> Option<ReplyTarget> {
        self.inner.reply.lock().take()
    }

    pub fn send_to_server(&self, server_id: &str, packet: Packet) {
        self.inner.mesh.send_to_server(server_id, packet);
    }

    pub async fn request_to_server(&self, server_id: &str, packet: Packet) -> Result<Packet> {
        self.inner.mesh.request_to_server(server_id, packet).await
    }

    pub fn send_to_stage(&self, server_id: &str, stage_id: &str, packet: Packet) {
        self.inner.mesh.send_to_stage(server_id, stage_id, packet);
    }

    pub async fn request_to_stage(&self, server_id: &str, stage_id: &str, packet: Packet) -> Result<Packet> {
        self.inner.mesh.request_to_stage(server_id, stage_id, packet).await
    }

    pub fn add_repeat_timer(&self, initial_delay: Duration, period: Duration, callback: TimerCallback) -> TimerId {
        self.add_timer(TimerKind::Repeat { initial_delay, period }, callback)
    }

    pub fn add_count_timer(
        &self,
        initial_delay: Duration,
        period: Duration,
        count: u32,
        callback: TimerCallback,
    ) -> TimerId {
        self.add_timer(
            TimerKind::Count {
                initial_delay,
                period,
                count,
            },
            callback,
        )
    }

    pub fn add_once_timer(&self, delay: Duration, callback: TimerCallback) -> TimerId {
        self.add_timer(TimerKind::once(delay), callback)
    }

    fn add_timer(&self, kind: TimerKind, callback: TimerCallback) -> TimerId {
        let timer_id = self.inner.port.next_timer_id();
        self.inner.port.post(Command::AddTimer {
            timer_id,
            stage_id: self.inner.stage_id.clone(),
            kind,
            callback,
        });
        timer_id
    }

    pub fn cancel_timer(&self, timer_id: TimerId) {
        self.inner.port.post(Command::CancelTimer { timer_id });
    }

    /// Destroy this stage once the current hook returns
    pub fn close_stage(&self) {
        self.inner.port.post(Command::DestroyStage {
            stage_id: self.inner.stage_id.clone(),
            ack: None,
        });
    }
}

struct ActorLinkInner {
    account_id: AtomicI64,
    stage_id: Mutex<String>,
    stage_type: Mutex<String>,
    session: Mutex<Arc<dyn SessionSink>>,
    mesh: MeshLink,
    stage: Mutex<Option<StageLink>>,
    port: CommandPort,
}

/// An actor's handle to its client session and stage
#[derive(Clone)]
pub struct ActorLink {
    inner: Arc<ActorLinkInner>,
}

impl ActorLink {
    pub(crate) fn new(session: Arc<dyn SessionSink>, mesh: MeshLink, port: CommandPort) -> Self {
        Self {
            inner: Arc::new(ActorLinkInner {
                account_id: AtomicI64::new(0),
                stage_id: Mutex::new(String::new()),
                stage_type: Mutex::new(String::new()),
                session: Mutex::new(session),
                mesh,
                stage: Mutex::new(None),
                port,
            }),
        }
    }

    pub fn account_id(&self) -> AccountId {
        self.inner.account_id.load(Ordering::Acquire)
    }

    pub fn stage_id(&self) -> String {
        self.inner.stage_id.lock().clone()
    }

    pub fn stage_type(&self) -> String {
        self.inner.stage_type.lock().clone()
    }

    pub fn sid(&self) -> Sid {
        self.inner.session.lock().sid()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.session.lock().is_connected()
    }

    /// Authenticate into an explicitly named stage
    pub fn set_auth_context(&self, account_id: AccountId, stage_id: impl Into<String>) {
        self.inner.account_id.store(account_id, Ordering::Release);
        *self.inner.stage_id.lock() = stage_id.into();
        self.inner.stage_type.lock().clear();
    }

    /// Authenticate into the per-account stage of `stage_type`
    pub fn set_auth_single_context(&self, account_id: AccountId, stage_type: impl Into<String>) {
        self.inner.account_id.store(account_id, Ordering::Release);
        *self.inner.stage_type.lock() = stage_type.into();
        self.inner.stage_id.lock().clear();
    }

    /// Push a message to the client (`msg_seq` 0)
    pub fn send_to_client(&self, packet: Packet) {
        let session = Arc::clone(&self.inner.session.lock());
        if !session.is_connected() {
            debug!(
                account_id = self.account_id(),
                msg_id = %packet.msg_id(),
                "Client disconnected, push skipped"
            );
            return;
        }
        let stage_id = self.stage_id();
        if let Err(e) = session.send_response(packet.msg_id(), 0, &stage_id, 0, packet.data()) {
            debug!(account_id = self.account_id(), error = %e, "Client push failed");
        }
    }

    /// Leave the bound stage once the current hook returns; the connection stays open
    pub fn leave_stage(&self) {
        let Some(stage) = self.inner.stage.lock().clone() else {
            debug!(account_id = self.account_id(), "Leave requested while not in a stage");
            return;
        };
        self.inner.port.post(Command::LeaveStage {
            stage_id: stage.stage_id().to_string(),
            account_id: self.account_id(),
        });
    }

    /// Reply to the message the bound stage is currently handling
    pub fn reply(&self, packet: Packet) {
        match self.inner.stage.lock().as_ref() {
            Some(stage) => stage.reply(packet),
            None => warn!(account_id = self.account_id(), "Reply while not in a stage dropped"),
        }
    }

    pub fn reply_error(&self, error: ErrorCode) {
        if let Some(stage) = self.inner.stage.lock().as_ref() {
            stage.reply_error(error);
        }
    }

    /// Mesh operations tagged with this actor's account
    pub fn mesh(&self) -> MeshLink {
        self.inner.mesh.for_account(self.account_id())
    }

    pub(crate) fn session(&self) -> Arc<dyn SessionSink> {
        Arc::clone(&self.inner.session.lock())
    }

    pub(crate) fn replace_session(&self, session: Arc<dyn SessionSink>) {
        *self.inner.session.lock() = session;
    }

    pub(crate) fn bind_stage(&self, stage: StageLink) {
        *self.inner.stage.lock() = Some(stage);
    }

    pub(crate) fn unbind_stage(&self) {
        self.inner.stage.lock().take();
    }

    pub fn is_in_stage(&self) -> bool {
        self.inner.stage.lock().is_some()
    }
}
