//! Client authentication against a single play node

use codec::Packet;
use e2e_tests::{start_node, test_config, wait_until, HookCounters, TestClient, TEST_STAGE_TYPE};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;
use types::{single_stage_id, ErrorCode};

const AUTH: &str = "Auth";

#[tokio::test]
async fn test_single_mode_authentication_creates_stage_once() {
    let hooks = Arc::new(HookCounters::default());
    let server = assert_ok!(start_node(test_config("play-1"), &hooks).await);

    let mut client = assert_ok!(TestClient::connect(server.session_addr()).await);
    let reply = assert_ok!(client.authenticate(AUTH, b"1001").await);

    assert!(reply.is_success(), "error code {}", reply.error_code);
    assert_eq!(reply.stage_id, single_stage_id(TEST_STAGE_TYPE, 1001));
    assert_eq!(reply.stage_type.as_deref(), Some(TEST_STAGE_TYPE));
    let res = reply.res.expect("decoded reply");
    assert_eq!(res.account_id, 1001);
    assert_eq!(res.stage_type, TEST_STAGE_TYPE);
    assert!(!res.reconnected);

    assert_eq!(HookCounters::get(&hooks.actor_create), 1);
    assert_eq!(HookCounters::get(&hooks.actor_authenticate), 1);
    assert_eq!(HookCounters::get(&hooks.actor_post_authenticate), 1);
    assert_eq!(HookCounters::get(&hooks.stage_create), 1);
    assert_eq!(HookCounters::get(&hooks.stage_post_create), 1);
    assert_eq!(HookCounters::get(&hooks.stage_join), 1);
    assert_eq!(HookCounters::get(&hooks.stage_post_join), 1);
    assert_eq!(server.dispatcher().stage_count(), 1);
    assert_eq!(server.dispatcher().actor_count(), 1);
    assert_eq!(server.authenticated_sessions(), 1);

    server.stop().await;
}

#[tokio::test]
async fn test_authenticated_client_requests_reach_its_stage() {
    let hooks = Arc::new(HookCounters::default());
    let server = assert_ok!(start_node(test_config("play-1"), &hooks).await);
    let mut client = assert_ok!(TestClient::connect(server.session_addr()).await);
    let auth = assert_ok!(client.authenticate(AUTH, b"42").await);
    assert!(auth.is_success());

    let echo = assert_ok!(client.request("Echo", &auth.stage_id, b"hello").await);
    assert_eq!(echo.msg_id, "Echo");
    assert_eq!(echo.error_code, ErrorCode::Success.as_u16());
    assert_eq!(echo.payload.as_slice(), b"hello");

    let who = assert_ok!(client.request("WhoAmI", &auth.stage_id, b"").await);
    assert_eq!(who.payload.as_slice(), b"42");

    // A push has no sequence; the stage answers with an unsolicited frame
    assert_ok!(client.send_with_seq("Push", 0, &auth.stage_id, b"note").await);
    let pushed = assert_ok!(client.recv().await).expect("pushed frame");
    assert_eq!(pushed.msg_id, "Push");
    assert_eq!(pushed.msg_seq, 0);
    assert_eq!(pushed.payload.as_slice(), b"note");

    server.stop().await;
}

#[tokio::test]
async fn test_same_account_reconnects_to_same_stage() {
    let hooks = Arc::new(HookCounters::default());
    let server = assert_ok!(start_node(test_config("play-1"), &hooks).await);

    let mut first = assert_ok!(TestClient::connect(server.session_addr()).await);
    let one = assert_ok!(first.authenticate(AUTH, b"7").await);
    let mut second = assert_ok!(TestClient::connect(server.session_addr()).await);
    let two = assert_ok!(second.authenticate(AUTH, b"7").await);

    assert!(one.is_success() && two.is_success());
    assert_eq!(one.stage_id, two.stage_id);
    assert!(two.res.expect("decoded reply").reconnected);
    assert_eq!(HookCounters::get(&hooks.stage_create), 1);
    assert_eq!(HookCounters::get(&hooks.stage_join), 1);
    assert_eq!(server.dispatcher().actor_count(), 1);

    // The replaced session is closed by the server
    assert!(first.is_closed().await);
    let echo = assert_ok!(second.request("Echo", &two.stage_id, b"still here").await);
    assert_eq!(echo.payload.as_slice(), b"still here");

    server.stop().await;
}

#[tokio::test]
async fn test_different_accounts_get_different_stages() {
    let hooks = Arc::new(HookCounters::default());
    let server = assert_ok!(start_node(test_config("play-1"), &hooks).await);

    let mut a = assert_ok!(TestClient::connect(server.session_addr()).await);
    let mut b = assert_ok!(TestClient::connect(server.session_addr()).await);
    let reply_a = assert_ok!(a.authenticate(AUTH, b"1").await);
    let reply_b = assert_ok!(b.authenticate(AUTH, b"2").await);

    assert_ne!(reply_a.stage_id, reply_b.stage_id);
    assert_eq!(HookCounters::get(&hooks.stage_create), 2);
    assert_eq!(server.dispatcher().stage_count(), 2);
    assert_eq!(server.dispatcher().actor_count(), 2);

    server.stop().await;
}

#[tokio::test]
async fn test_rejected_authentication_closes_session() {
    let hooks = Arc::new(HookCounters::default());
    let server = assert_ok!(start_node(test_config("play-1"), &hooks).await);

    let mut client = assert_ok!(TestClient::connect(server.session_addr()).await);
    let reply = assert_ok!(client.authenticate(AUTH, b"not-a-number").await);

    assert_eq!(reply.error_code, ErrorCode::AuthenticationFailed.as_u16());
    assert!(reply.res.is_none());
    assert!(client.is_closed().await);
    assert_eq!(HookCounters::get(&hooks.actor_destroy), 1);
    assert_eq!(HookCounters::get(&hooks.stage_create), 0);
    assert_eq!(server.authenticated_sessions(), 0);

    server.stop().await;
}

#[tokio::test]
async fn test_message_before_authentication_is_refused() {
    let hooks = Arc::new(HookCounters::default());
    let server = assert_ok!(start_node(test_config("play-1"), &hooks).await);

    let mut client = assert_ok!(TestClient::connect(server.session_addr()).await);
    let response = assert_ok!(client.request("Echo", "", b"too early").await);

    assert_eq!(response.error_code, ErrorCode::NotAuthenticated.as_u16());
    assert!(client.is_closed().await);
    assert_eq!(HookCounters::get(&hooks.actor_create), 0);

    server.stop().await;
}

#[tokio::test]
async fn test_disconnect_notifies_stage_and_unbinds_session() {
    let hooks = Arc::new(HookCounters::default());
    let server = assert_ok!(start_node(test_config("play-1"), &hooks).await);

    let mut client = assert_ok!(TestClient::connect(server.session_addr()).await);
    assert!(assert_ok!(client.authenticate(AUTH, b"99").await).is_success());
    drop(client);

    let notified = wait_until(Duration::from_secs(2), || {
        HookCounters::get(&hooks.connection_changes) == 1 && server.authenticated_sessions() == 0
    })
    .await;
    assert!(notified);
    // The actor stays in its stage until it leaves
    assert_eq!(server.dispatcher().actor_count(), 1);

    server.stop().await;
}

#[tokio::test]
async fn test_stop_destroys_stages_created_by_clients() {
    let hooks = Arc::new(HookCounters::default());
    let server = assert_ok!(start_node(test_config("play-1"), &hooks).await);

    for account in ["11", "12", "13"] {
        let mut client = assert_ok!(TestClient::connect(server.session_addr()).await);
        assert!(assert_ok!(client.authenticate(AUTH, account.as_bytes()).await).is_success());
    }
    assert_eq!(server.dispatcher().stage_count(), 3);

    server.stop().await;
    assert_eq!(HookCounters::get(&hooks.stage_destroy), 3);
    assert_eq!(server.dispatcher().stage_count(), 0);

    let late = server
        .dispatcher()
        .create_stage("late", TEST_STAGE_TYPE, Packet::empty("Init"))
        .await;
    assert!(late.is_err());
}
