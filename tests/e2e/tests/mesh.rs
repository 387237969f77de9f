//! Two play nodes talking over the mesh

use codec::Packet;
use e2e_tests::{peer_of, start_node, test_config, wait_until, HookCounters, TEST_STAGE_TYPE};
use play_server::PlayServer;
use stage_actors::StageError;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use types::ErrorCode;

struct Pair {
    a: PlayServer,
    b: PlayServer,
    hooks_b: Arc<HookCounters>,
}

/// Node `play-a` dials `play-b`; both sides become ready over one connection
async fn connected_pair() -> Pair {
    let hooks_a = Arc::new(HookCounters::default());
    let hooks_b = Arc::new(HookCounters::default());
    let b = assert_ok!(start_node(test_config("play-b"), &hooks_b).await);

    let mut config_a = test_config("play-a");
    config_a.peers.push(peer_of(&b));
    let a = assert_ok!(start_node(config_a, &hooks_a).await);

    let ready = wait_until(Duration::from_secs(5), || {
        a.is_peer_ready("play-b") && b.is_peer_ready("play-a")
    })
    .await;
    assert!(ready, "mesh peers never became ready");
    Pair { a, b, hooks_b }
}

impl Pair {
    async fn stop(self) {
        self.a.stop().await;
        self.b.stop().await;
    }
}

#[tokio::test]
async fn test_remote_create_then_request_to_stage() {
    let pair = connected_pair().await;
    let mesh = pair.a.dispatcher().mesh();

    let created = assert_ok!(
        mesh.create_stage("play-b", TEST_STAGE_TYPE, "room-1", Packet::empty("Init"))
            .await
    );
    assert!(created.result);
    assert_eq!(created.payload, b"room-1".to_vec());
    assert_eq!(pair.b.dispatcher().stage_count(), 1);
    assert_eq!(HookCounters::get(&pair.hooks_b.stage_create), 1);

    let echo = assert_ok!(
        mesh.request_to_stage("play-b", "room-1", Packet::new("Echo", b"ping".to_vec()))
            .await
    );
    assert_eq!(echo.msg_id(), "Echo");
    assert_eq!(echo.data(), b"ping");
    assert_eq!(pair.a.request_cache().pending_count(), 0);

    pair.stop().await;
}

#[tokio::test]
async fn test_remote_get_or_create_is_idempotent() {
    let pair = connected_pair().await;
    let mesh = pair.a.dispatcher().mesh();

    let first = assert_ok!(
        mesh.get_or_create_stage("play-b", TEST_STAGE_TYPE, "room-2", Packet::empty("Init"))
            .await
    );
    let second = assert_ok!(
        mesh.get_or_create_stage("play-b", TEST_STAGE_TYPE, "room-2", Packet::empty("Init"))
            .await
    );
    assert!(first.result && second.result);
    assert!(first.is_created);
    assert!(!second.is_created);
    assert_eq!(HookCounters::get(&pair.hooks_b.stage_create), 1);

    pair.stop().await;
}

#[tokio::test]
async fn test_remote_create_of_existing_stage_reports_failure() {
    let pair = connected_pair().await;
    let mesh = pair.a.dispatcher().mesh();

    assert_ok!(
        mesh.create_stage("play-b", TEST_STAGE_TYPE, "room-3", Packet::empty("Init"))
            .await
    );
    let again = mesh
        .create_stage("play-b", TEST_STAGE_TYPE, "room-3", Packet::empty("Init"))
        .await;
    match again {
        Ok(res) => assert!(!res.result),
        Err(StageError::ErrorReply { error_code, .. }) => {
            assert_eq!(error_code, ErrorCode::StageAlreadyExists.as_u16())
        }
        Err(other) => panic!("unexpected error {other}"),
    }
    assert_eq!(HookCounters::get(&pair.hooks_b.stage_create), 1);

    pair.stop().await;
}

#[tokio::test]
async fn test_request_to_missing_remote_stage_returns_error_code() {
    let pair = connected_pair().await;

    let result = pair
        .a
        .dispatcher()
        .mesh()
        .request_to_stage("play-b", "nowhere", Packet::empty("Echo"))
        .await;
    match assert_err!(result) {
        StageError::ErrorReply { error_code, .. } => assert_eq!(error_code, ErrorCode::StageNotFound.as_u16()),
        other => panic!("unexpected error {other}"),
    }

    pair.stop().await;
}

#[tokio::test]
async fn test_remote_destroy_stage() {
    let pair = connected_pair().await;
    let mesh = pair.a.dispatcher().mesh();

    assert_ok!(
        mesh.create_stage("play-b", TEST_STAGE_TYPE, "room-4", Packet::empty("Init"))
            .await
    );
    mesh.destroy_stage("play-b", "room-4", "match over");

    let destroyed = wait_until(Duration::from_secs(2), || {
        pair.b.dispatcher().stage_count() == 0
    })
    .await;
    assert!(destroyed);
    assert_eq!(HookCounters::get(&pair.hooks_b.stage_destroy), 1);

    pair.stop().await;
}

#[tokio::test]
async fn test_request_to_unknown_peer_times_out() {
    let hooks = Arc::new(HookCounters::default());
    let mut config = test_config("play-solo");
    config.request.timeout_ms = 100;
    let server = assert_ok!(start_node(config, &hooks).await);

    let result = server
        .dispatcher()
        .mesh()
        .request_to_server("play-ghost", Packet::empty("Ping"))
        .await;
    assert!(matches!(assert_err!(result), StageError::Timeout { .. }));
    assert_eq!(server.request_cache().pending_count(), 0);

    let explicit = server
        .dispatcher()
        .mesh()
        .request_with_timeout("play-ghost", "room", Packet::empty("Ping"), Duration::from_millis(50))
        .await;
    assert!(matches!(assert_err!(explicit), StageError::Timeout { .. }));

    server.stop().await;
}

#[tokio::test]
async fn test_stop_cancels_pending_requests() {
    let hooks = Arc::new(HookCounters::default());
    let mut config = test_config("play-solo");
    config.request.timeout_ms = 30_000;
    let server = Arc::new(assert_ok!(start_node(config, &hooks).await));

    let mesh = server.dispatcher().mesh().clone();
    let pending = tokio::spawn(async move { mesh.request_to_server("play-ghost", Packet::empty("Ping")).await });
    let registered = wait_until(Duration::from_secs(2), || {
        server.request_cache().pending_count() == 1
    })
    .await;
    assert!(registered);

    server.stop().await;
    let result = assert_ok!(pending.await);
    assert!(matches!(assert_err!(result), StageError::Cancelled { .. }));
}
