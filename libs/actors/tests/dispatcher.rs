//! Stage dispatcher behaviour: lifecycle, mailboxes, actors and timers

use async_trait::async_trait;
use codec::{Packet, RoutePacket};
use network::{PacketSender, RequestCache, SessionSink, TransportError};
use parking_lot::Mutex;
use stage_actors::{
    timer_callback, Actor, ActorLink, PlayDispatcher, Stage, StageActor, StageError, StageLink, StageRegistry,
    TimerKind,
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_test::{assert_err, assert_ok};
use types::{msg_ids, CreateStageReq, CreateStageRes, ErrorCode, RouteHeader, Sid, StageMode};

const STAGE_TYPE: &str = "TestStage";

/// Counters shared by every `TestStage` instance of one dispatcher
#[derive(Default)]
struct Hooks {
    on_create: AtomicU32,
    on_post_create: AtomicU32,
    on_destroy: AtomicU32,
    on_join: AtomicU32,
    on_post_join: AtomicU32,
    on_dispatch: AtomicU32,
    connection_changes: AtomicU32,
    timer_ticks: AtomicU32,
    fail_post_create_once: AtomicBool,
    leak_then_fail_post_create: AtomicBool,
    reject_join: AtomicBool,
    links: Mutex<Vec<StageLink>>,
    remote_results: Mutex<Vec<stage_actors::Result<Packet>>>,
    /// (stage_id, msg_id) in the order `on_dispatch` was entered
    entered: Mutex<Vec<(String, String)>>,
    gate: Notify,
}

impl Hooks {
    fn count(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::SeqCst)
    }
}

struct TestStage {
    link: StageLink,
    hooks: Arc<Hooks>,
}

#[async_trait]
impl Stage for TestStage {
    async fn on_create(&mut self, _packet: Packet) -> anyhow::Result<(bool, Option<Packet>)> {
        self.hooks.on_create.fetch_add(1, Ordering::SeqCst);
        Ok((true, Some(Packet::new("Created", b"ok".to_vec()))))
    }

    async fn on_post_create(&mut self) -> anyhow::Result<()> {
        self.hooks.on_post_create.fetch_add(1, Ordering::SeqCst);
        if self.hooks.fail_post_create_once.swap(false, Ordering::SeqCst) {
            anyhow::bail!("warm-up failed");
        }
        if self.hooks.leak_then_fail_post_create.swap(false, Ordering::SeqCst) {
            self.link.add_repeat_timer(
                Duration::from_secs(5),
                Duration::from_secs(5),
                timer_callback(|| async {}),
            );
            let cache = Arc::clone(self.link.mesh().request_cache());
            let before = cache.pending_count();
            self.ask_remote();
            while cache.pending_count() == before {
                tokio::task::yield_now().await;
            }
            anyhow::bail!("warm-up failed after scheduling work");
        }
        self.hooks.links.lock().push(self.link.clone());
        Ok(())
    }

    async fn on_destroy(&mut self) -> anyhow::Result<()> {
        self.hooks.on_destroy.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_join_stage(&mut self, _actor: &mut StageActor) -> anyhow::Result<bool> {
        self.hooks.on_join.fetch_add(1, Ordering::SeqCst);
        Ok(!self.hooks.reject_join.load(Ordering::SeqCst))
    }

    async fn on_post_join_stage(&mut self, _actor: &mut StageActor) -> anyhow::Result<()> {
        self.hooks.on_post_join.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_connection_changed(&mut self, _actor: &mut StageActor, _connected: bool) -> anyhow::Result<()> {
        self.hooks.connection_changes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_actor_dispatch(&mut self, actor: &mut StageActor, packet: Packet) -> anyhow::Result<()> {
        self.hooks.on_dispatch.fetch_add(1, Ordering::SeqCst);
        if packet.msg_id() == "Echo" {
            actor.link().reply(packet);
        }
        Ok(())
    }

    async fn on_dispatch(&mut self, packet: Packet) -> anyhow::Result<()> {
        self.hooks.on_dispatch.fetch_add(1, Ordering::SeqCst);
        self.hooks
            .entered
            .lock()
            .push((self.link.stage_id().to_string(), packet.msg_id().to_string()));
        match packet.msg_id() {
            "Echo" => self.link.reply(packet),
            "Fail" => anyhow::bail!("handler failed"),
            "AskRemote" => self.ask_remote(),
            "Park" => self.hooks.gate.notified().await,
            _ => {}
        }
        Ok(())
    }
}

impl TestStage {
    fn ask_remote(&self) {
        let mesh = self.link.mesh().clone();
        let hooks = Arc::clone(&self.hooks);
        tokio::spawn(async move {
            let result = mesh.request_to_stage("play-2", "remote", Packet::empty("Ping")).await;
            hooks.remote_results.lock().push(result);
        });
    }
}

struct TestActor;

#[async_trait]
impl Actor for TestActor {
    async fn on_authenticate(&mut self, _packet: Packet) -> anyhow::Result<(bool, Option<Packet>)> {
        Ok((true, None))
    }
}

#[derive(Default)]
struct RecordingSender {
    sent: Mutex<Vec<(String, RoutePacket)>>,
}

impl RecordingSender {
    fn count(&self) -> usize {
        self.sent.lock().len()
    }
}

impl PacketSender for RecordingSender {
    fn server_id(&self) -> &str {
        "play-1"
    }

    fn send(&self, target: &str, packet: RoutePacket) {
        self.sent.lock().push((target.to_string(), packet));
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Response {
    msg_id: String,
    msg_seq: u16,
    stage_id: String,
    error_code: u16,
    payload: Vec<u8>,
}

struct RecordingSession {
    sid: Sid,
    connected: AtomicBool,
    responses: Mutex<Vec<Response>>,
}

impl RecordingSession {
    fn new(sid: Sid) -> Arc<Self> {
        Arc::new(Self {
            sid,
            connected: AtomicBool::new(true),
            responses: Mutex::new(Vec::new()),
        })
    }
}

impl SessionSink for RecordingSession {
    fn sid(&self) -> Sid {
        self.sid
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send_response(
        &self,
        msg_id: &str,
        msg_seq: u16,
        stage_id: &str,
        error_code: u16,
        payload: &[u8],
    ) -> network::Result<()> {
        if !self.is_connected() {
            return Err(TransportError::closed("session"));
        }
        self.responses.lock().push(Response {
            msg_id: msg_id.to_string(),
            msg_seq,
            stage_id: stage_id.to_string(),
            error_code,
            payload: payload.to_vec(),
        });
        Ok(())
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

struct Harness {
    dispatcher: PlayDispatcher,
    hooks: Arc<Hooks>,
    sender: Arc<RecordingSender>,
    cache: Arc<RequestCache>,
}

fn harness() -> Harness {
    let hooks = Arc::new(Hooks::default());
    let stage_hooks = Arc::clone(&hooks);

    let mut registry = StageRegistry::new();
    registry.register(
        STAGE_TYPE,
        StageMode::Multi,
        move |link: StageLink| -> Box<dyn Stage> {
            Box::new(TestStage {
                link,
                hooks: Arc::clone(&stage_hooks),
            })
        },
        |_link: ActorLink| -> Box<dyn Actor> { Box::new(TestActor) },
    );

    let sender = Arc::new(RecordingSender::default());
    let cache = Arc::new(RequestCache::new(Duration::from_secs(30)));
    let dispatcher = PlayDispatcher::start(
        Arc::new(registry),
        Arc::clone(&sender) as Arc<dyn PacketSender>,
        Arc::clone(&cache),
    );

    Harness {
        dispatcher,
        hooks,
        sender,
        cache,
    }
}

/// Poll `condition` until it holds or two seconds pass
async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 2s");
}

fn joining_actor(h: &Harness, account_id: i64, stage_id: &str, sid: Sid) -> (StageActor, Arc<RecordingSession>) {
    let session = RecordingSession::new(sid);
    let actor = h
        .dispatcher
        .create_actor(STAGE_TYPE, Arc::clone(&session) as Arc<dyn SessionSink>)
        .expect("registered type");
    actor.link().set_auth_context(account_id, stage_id);
    (actor, session)
}

#[tokio::test]
async fn test_counts_start_at_zero() {
    let h = harness();
    let snapshot = h.dispatcher.snapshot().await.unwrap();
    assert_eq!(snapshot.stage_count, 0);
    assert_eq!(snapshot.actor_count, 0);
    assert_eq!(snapshot.timer_count, 0);
    assert_eq!(h.dispatcher.stage_count(), 0);
}

#[tokio::test]
async fn test_create_runs_each_hook_once() {
    let h = harness();
    let reply = h
        .dispatcher
        .create_stage("room-1", STAGE_TYPE, Packet::empty("Init"))
        .await
        .unwrap();

    assert!(reply.is_created);
    assert_eq!(reply.payload.unwrap().msg_id(), "Created");
    assert_eq!(Hooks::count(&h.hooks.on_create), 1);
    assert_eq!(Hooks::count(&h.hooks.on_post_create), 1);
    assert_eq!(h.dispatcher.stage_count(), 1);
}

#[tokio::test]
async fn test_duplicate_create_is_rejected() {
    let h = harness();
    assert_ok!(h.dispatcher.create_stage("room-1", STAGE_TYPE, Packet::empty("Init")).await);

    let err = h
        .dispatcher
        .create_stage("room-1", STAGE_TYPE, Packet::empty("Init"))
        .await
        .unwrap_err();
    assert!(matches!(err, StageError::AlreadyExists { .. }));
    assert_eq!(err.error_code(), ErrorCode::StageAlreadyExists);
    assert_eq!(Hooks::count(&h.hooks.on_create), 1);
    assert_eq!(h.dispatcher.stage_count(), 1);
}

#[tokio::test]
async fn test_unknown_stage_type() {
    let h = harness();
    let err = h
        .dispatcher
        .create_stage("room-1", "NoSuchType", Packet::empty("Init"))
        .await
        .unwrap_err();
    assert!(matches!(err, StageError::UnknownType { .. }));
    assert_eq!(h.dispatcher.stage_count(), 0);
}

#[tokio::test]
async fn test_dispatch_to_missing_stage() {
    let h = harness();
    let err = h
        .dispatcher
        .dispatch("ghost", 0, Packet::empty("Ping"))
        .await
        .unwrap_err();
    assert!(matches!(err, StageError::StageNotFound { .. }));

    let header = RouteHeader::new("Ping", "play-2").with_stage("ghost").with_seq(7);
    h.dispatcher.post(RoutePacket::new(header, Vec::new()));
    eventually(|| h.sender.count() == 1).await;

    let sent = h.sender.sent.lock();
    let (target, reply) = &sent[0];
    assert_eq!(target, "play-2");
    assert!(reply.is_reply());
    assert_eq!(reply.msg_seq(), 7);
    assert_eq!(reply.msg_id(), msg_ids::ERROR_RES);
    assert_eq!(reply.header.error(), ErrorCode::StageNotFound.as_u16());
}

#[tokio::test]
async fn test_destroy_then_dispatch_is_not_found() {
    let h = harness();
    assert_ok!(h.dispatcher.create_stage("room-1", STAGE_TYPE, Packet::empty("Init")).await);
    assert_ok!(h.dispatcher.destroy_stage("room-1").await);

    assert_eq!(Hooks::count(&h.hooks.on_destroy), 1);
    assert_eq!(h.dispatcher.stage_count(), 0);
    assert_err!(h.dispatcher.dispatch("room-1", 0, Packet::empty("Ping")).await);

    // destroying an absent stage is not an error
    assert_ok!(h.dispatcher.destroy_stage("room-1").await);
    assert_eq!(Hooks::count(&h.hooks.on_destroy), 1);
}

#[tokio::test]
async fn test_mesh_create_request_is_answered() {
    let h = harness();
    let req = CreateStageReq {
        stage_type: STAGE_TYPE.to_string(),
        payload_id: "Init".to_string(),
        payload: Vec::new(),
    };
    let header = RouteHeader::new("", "play-2").with_stage("room-9").with_seq(3).system();
    h.dispatcher.post(RoutePacket::from_packet(
        header,
        Packet::from_message(msg_ids::CREATE_STAGE_REQ, &req),
    ));
    eventually(|| h.sender.count() == 1).await;

    let sent = h.sender.sent.lock();
    let (target, reply) = &sent[0];
    assert_eq!(target, "play-2");
    assert_eq!(reply.msg_id(), msg_ids::CREATE_STAGE_RES);
    assert_eq!(reply.msg_seq(), 3);
    assert_eq!(reply.header.error(), 0);
    let res: CreateStageRes = reply.parse().unwrap();
    assert!(res.result);
    assert_eq!(res.payload_id, "Created");
    assert_eq!(res.payload, b"ok");
    assert_eq!(h.dispatcher.stage_count(), 1);
}

#[tokio::test]
async fn test_failed_mesh_dispatch_replies_hook_failure() {
    let h = harness();
    assert_ok!(h.dispatcher.create_stage("room-1", STAGE_TYPE, Packet::empty("Init")).await);

    let header = RouteHeader::new("Fail", "play-2").with_stage("room-1").with_seq(9);
    h.dispatcher.post(RoutePacket::new(header, Vec::new()));
    eventually(|| h.sender.count() == 1).await;

    let sent = h.sender.sent.lock();
    assert_eq!(sent[0].1.msg_id(), msg_ids::ERROR_RES);
    assert_eq!(sent[0].1.header.error(), ErrorCode::HookFailure.as_u16());
}

#[tokio::test]
async fn test_timer_without_stage_is_removed_after_firing() {
    let h = harness();
    let fired = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&fired);
    let callback = timer_callback(move || {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    h.dispatcher
        .add_timer("nowhere", TimerKind::once(Duration::from_millis(20)), callback)
        .unwrap();
    assert_eq!(h.dispatcher.snapshot().await.unwrap().timer_count, 1);

    eventually(|| h.dispatcher.active_timer_count() == 0).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_shutdown_destroys_everything() {
    let h = harness();
    assert_ok!(h.dispatcher.create_stage("room-1", STAGE_TYPE, Packet::empty("Init")).await);
    assert_ok!(h.dispatcher.create_stage("room-2", STAGE_TYPE, Packet::empty("Init")).await);
    let (actor, _session) = joining_actor(&h, 1001, "room-1", 1);
    assert_ok!(h.dispatcher.join_stage("room-1", actor).await);
    h.dispatcher
        .add_timer(
            "room-1",
            TimerKind::Repeat {
                initial_delay: Duration::from_secs(5),
                period: Duration::from_secs(5),
            },
            timer_callback(|| async {}),
        )
        .unwrap();

    h.dispatcher.shutdown().await;

    assert_eq!(Hooks::count(&h.hooks.on_destroy), 2);
    assert_eq!(h.dispatcher.stage_count(), 0);
    assert_eq!(h.dispatcher.actor_count(), 0);
    assert_eq!(h.dispatcher.active_timer_count(), 0);

    let err = h
        .dispatcher
        .create_stage("room-3", STAGE_TYPE, Packet::empty("Init"))
        .await
        .unwrap_err();
    assert!(matches!(err, StageError::Closed));
}

#[tokio::test]
async fn test_get_or_create_is_idempotent() {
    let h = harness();
    let first = h
        .dispatcher
        .get_or_create_stage("room-1", STAGE_TYPE, Packet::empty("Init"))
        .await
        .unwrap();
    let second = h
        .dispatcher
        .get_or_create_stage("room-1", STAGE_TYPE, Packet::empty("Init"))
        .await
        .unwrap();

    assert!(first.is_created);
    assert!(!second.is_created);
    assert_eq!(Hooks::count(&h.hooks.on_create), 1);
    assert_eq!(h.dispatcher.stage_count(), 1);
}

#[tokio::test]
async fn test_post_create_failure_rolls_back() {
    let h = harness();
    h.hooks.fail_post_create_once.store(true, Ordering::SeqCst);

    let err = h
        .dispatcher
        .create_stage("room-1", STAGE_TYPE, Packet::empty("Init"))
        .await
        .unwrap_err();
    assert!(matches!(err, StageError::HookFailure { hook: "on_post_create", .. }));
    assert_eq!(h.dispatcher.stage_count(), 0);
    assert_err!(h.dispatcher.dispatch("room-1", 0, Packet::empty("Ping")).await);

    let reply = h
        .dispatcher
        .create_stage("room-1", STAGE_TYPE, Packet::empty("Init"))
        .await
        .unwrap();
    assert!(reply.is_created);
    assert_eq!(Hooks::count(&h.hooks.on_create), 2);
    assert_eq!(Hooks::count(&h.hooks.on_post_create), 2);
    assert_eq!(h.dispatcher.stage_count(), 1);
}

#[tokio::test]
async fn test_independent_stages() {
    let h = harness();
    let ids: Vec<String> = (0..5).map(|i| format!("room-{i}")).collect();

    let creates = ids
        .iter()
        .map(|id| h.dispatcher.create_stage(id, STAGE_TYPE, Packet::empty("Init")));
    for result in futures::future::join_all(creates).await {
        assert!(result.unwrap().is_created);
    }
    assert_eq!(h.dispatcher.stage_count(), 5);

    for id in &ids {
        assert_ok!(h.dispatcher.dispatch(id, 0, Packet::empty("Ping")).await);
    }
    assert_eq!(Hooks::count(&h.hooks.on_dispatch), 5);
}

#[tokio::test]
async fn test_concurrent_get_or_create_creates_once() {
    let h = harness();
    let calls = (0..10).map(|_| {
        h.dispatcher
            .get_or_create_stage("room-1", STAGE_TYPE, Packet::empty("Init"))
    });
    let replies = futures::future::join_all(calls).await;

    let created = replies
        .into_iter()
        .map(|r| r.unwrap())
        .filter(|r| r.is_created)
        .count();
    assert_eq!(created, 1);
    assert_eq!(Hooks::count(&h.hooks.on_create), 1);
    assert_eq!(Hooks::count(&h.hooks.on_post_create), 1);
    assert_eq!(h.dispatcher.stage_count(), 1);
}

#[tokio::test]
async fn test_destroy_cancels_stage_requests() {
    let h = harness();
    assert_ok!(h.dispatcher.create_stage("room-1", STAGE_TYPE, Packet::empty("Init")).await);
    for _ in 0..4 {
        assert_ok!(h.dispatcher.dispatch("room-1", 0, Packet::empty("AskRemote")).await);
    }
    eventually(|| h.cache.pending_count() == 4).await;

    assert_ok!(h.dispatcher.destroy_stage("room-1").await);
    eventually(|| h.hooks.remote_results.lock().len() == 4).await;

    let results = h.hooks.remote_results.lock();
    assert!(results
        .iter()
        .all(|r| matches!(r, Err(StageError::Cancelled { .. }))));
    assert_eq!(h.cache.pending_count(), 0);
}

#[tokio::test]
async fn test_failed_creation_releases_requests_and_timers() {
    let h = harness();
    h.hooks.leak_then_fail_post_create.store(true, Ordering::SeqCst);

    let err = h
        .dispatcher
        .create_stage("room-1", STAGE_TYPE, Packet::empty("Init"))
        .await
        .unwrap_err();
    assert!(matches!(err, StageError::HookFailure { hook: "on_post_create", .. }));

    eventually(|| h.hooks.remote_results.lock().len() == 1).await;
    assert!(matches!(
        h.hooks.remote_results.lock()[0],
        Err(StageError::Cancelled { .. })
    ));
    assert_eq!(h.cache.pending_count(), 0);
    assert_eq!(h.dispatcher.active_timer_count(), 0);
    assert_eq!(h.dispatcher.snapshot().await.unwrap().timer_count, 0);
}

#[tokio::test]
async fn test_parked_stage_does_not_block_others() {
    let h = harness();
    assert_ok!(h.dispatcher.create_stage("room-a", STAGE_TYPE, Packet::empty("Init")).await);
    assert_ok!(h.dispatcher.create_stage("room-b", STAGE_TYPE, Packet::empty("Init")).await);

    let dispatcher = h.dispatcher.clone();
    let parked = tokio::spawn(async move { dispatcher.dispatch("room-a", 0, Packet::empty("Park")).await });
    eventually(|| h.hooks.entered.lock().len() == 1).await;

    let dispatcher = h.dispatcher.clone();
    let queued = tokio::spawn(async move { dispatcher.dispatch("room-a", 0, Packet::empty("Ping")).await });

    // room-b is served while room-a is parked
    tokio::time::timeout(
        Duration::from_secs(1),
        h.dispatcher.dispatch("room-b", 0, Packet::empty("Ping")),
    )
    .await
    .expect("room-b dispatch finished")
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        *h.hooks.entered.lock(),
        vec![
            ("room-a".to_string(), "Park".to_string()),
            ("room-b".to_string(), "Ping".to_string()),
        ]
    );
    assert!(!parked.is_finished());
    assert!(!queued.is_finished());

    h.hooks.gate.notify_one();
    assert_ok!(parked.await.unwrap());
    assert_ok!(queued.await.unwrap());
    assert_eq!(
        h.hooks.entered.lock().last(),
        Some(&("room-a".to_string(), "Ping".to_string()))
    );
    assert_eq!(h.hooks.entered.lock().len(), 3);
}

#[tokio::test]
async fn test_join_reconnect_and_leave() {
    let h = harness();
    assert_ok!(h.dispatcher.create_stage("room-1", STAGE_TYPE, Packet::empty("Init")).await);

    let (actor, _first) = joining_actor(&h, 1001, "room-1", 1);
    let joined = h.dispatcher.join_stage("room-1", actor).await.unwrap();
    assert!(!joined.reconnected);
    assert_eq!(h.dispatcher.actor_count(), 1);
    assert_eq!(Hooks::count(&h.hooks.on_join), 1);
    assert_eq!(Hooks::count(&h.hooks.on_post_join), 1);

    let (again, _second) = joining_actor(&h, 1001, "room-1", 2);
    let rejoined = h.dispatcher.join_stage("room-1", again).await.unwrap();
    assert!(rejoined.reconnected);
    assert_eq!(h.dispatcher.actor_count(), 1);
    assert_eq!(Hooks::count(&h.hooks.on_join), 1);
    assert_eq!(Hooks::count(&h.hooks.connection_changes), 1);

    // the replaced session going away is not a disconnect
    h.dispatcher.connection_changed("room-1", 1001, 1, false).unwrap();
    assert_ok!(h.dispatcher.dispatch("room-1", 0, Packet::empty("Ping")).await);
    assert_eq!(Hooks::count(&h.hooks.connection_changes), 1);

    h.dispatcher.connection_changed("room-1", 1001, 2, false).unwrap();
    assert_ok!(h.dispatcher.dispatch("room-1", 0, Packet::empty("Ping")).await);
    assert_eq!(Hooks::count(&h.hooks.connection_changes), 2);

    h.dispatcher.leave_stage("room-1", 1001).unwrap();
    eventually(|| h.dispatcher.actor_count() == 0).await;
    assert_eq!(h.dispatcher.stage_count(), 1);
}

#[tokio::test]
async fn test_join_rejections() {
    let h = harness();
    let (actor, _session) = joining_actor(&h, 1001, "missing", 1);
    let err = h.dispatcher.join_stage("missing", actor).await.unwrap_err();
    assert!(matches!(err, StageError::StageNotFound { .. }));

    assert_ok!(h.dispatcher.create_stage("room-1", STAGE_TYPE, Packet::empty("Init")).await);
    h.hooks.reject_join.store(true, Ordering::SeqCst);
    let (actor, _session) = joining_actor(&h, 1002, "room-1", 2);
    let err = h.dispatcher.join_stage("room-1", actor).await.unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::JoinStageRejected);
    assert_eq!(h.dispatcher.actor_count(), 0);
}

#[tokio::test]
async fn test_client_request_reply_goes_to_session() {
    let h = harness();
    assert_ok!(h.dispatcher.create_stage("room-1", STAGE_TYPE, Packet::empty("Init")).await);
    let (actor, session) = joining_actor(&h, 1001, "room-1", 1);
    assert_ok!(h.dispatcher.join_stage("room-1", actor).await);

    h.dispatcher
        .dispatch_from_client(
            "room-1",
            1001,
            4,
            Packet::new("Echo", b"hi".to_vec()),
            Arc::clone(&session) as Arc<dyn SessionSink>,
        )
        .unwrap();
    eventually(|| session.responses.lock().len() == 1).await;

    let responses = session.responses.lock();
    assert_eq!(
        responses[0],
        Response {
            msg_id: "Echo".into(),
            msg_seq: 4,
            stage_id: "room-1".into(),
            error_code: 0,
            payload: b"hi".to_vec(),
        }
    );
}

#[tokio::test]
async fn test_stage_timer_runs_counted_ticks() {
    let h = harness();
    assert_ok!(h.dispatcher.create_stage("room-1", STAGE_TYPE, Packet::empty("Init")).await);
    let link = h.hooks.links.lock()[0].clone();

    let hooks = Arc::clone(&h.hooks);
    link.add_count_timer(
        Duration::from_millis(10),
        Duration::from_millis(10),
        3,
        timer_callback(move || {
            let hooks = Arc::clone(&hooks);
            async move {
                hooks.timer_ticks.fetch_add(1, Ordering::SeqCst);
            }
        }),
    );

    eventually(|| Hooks::count(&h.hooks.timer_ticks) == 3).await;
    eventually(|| h.dispatcher.active_timer_count() == 0).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(Hooks::count(&h.hooks.timer_ticks), 3);
}

#[tokio::test]
async fn test_destroy_cancels_stage_timers() {
    let h = harness();
    assert_ok!(h.dispatcher.create_stage("room-1", STAGE_TYPE, Packet::empty("Init")).await);
    let link = h.hooks.links.lock()[0].clone();
    link.add_repeat_timer(
        Duration::from_secs(5),
        Duration::from_secs(5),
        timer_callback(|| async {}),
    );
    assert_eq!(h.dispatcher.snapshot().await.unwrap().timer_count, 1);

    assert_ok!(h.dispatcher.destroy_stage("room-1").await);
    assert_eq!(h.dispatcher.active_timer_count(), 0);
}

#[tokio::test]
async fn test_stage_info_tracks_lifecycle() {
    let h = harness();
    assert_eq!(h.dispatcher.stage_info("room-1").await.unwrap(), None);

    h.hooks.fail_post_create_once.store(true, Ordering::SeqCst);
    assert_err!(h.dispatcher.create_stage("room-1", STAGE_TYPE, Packet::empty("Init")).await);
    let info = h.dispatcher.stage_info("room-1").await.unwrap().unwrap();
    assert!(!info.created);
    assert_eq!(info.stage_type, STAGE_TYPE);

    assert_ok!(h.dispatcher.create_stage("room-1", STAGE_TYPE, Packet::empty("Init")).await);
    let (actor, _session) = joining_actor(&h, 1001, "room-1", 1);
    assert_ok!(h.dispatcher.join_stage("room-1", actor).await);
    let info = h.dispatcher.stage_info("room-1").await.unwrap().unwrap();
    assert!(info.created);
    assert_eq!(info.actor_count, 1);
}
