//! Session lifecycle: resume within the grace window, invalidation, and
//! reaping.

mod support;

use std::time::Duration;

use support::{RawClient, build_call, hello_service, start_server, start_server_with};
use tether_wire::Value;
use tether_ws::ServerConfig;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reconnect_within_window_resumes_the_same_session() {
    let (_server, handle) = start_server(hello_service()).await;

    let mut first = RawClient::connect(&handle.url(), "").await;
    let hs = first.handshake().await;
    let reply = first
        .call(hs.sequence as u32, 7, "$.user:sayHello", 0, &[Value::from("one")])
        .await;
    assert!(reply.success);
    first.close().await;

    // Reconnect with the saved pair: same session record, and the
    // sequence picks up where the last accepted callback id left it.
    let mut second = RawClient::connect(&handle.url(), &hs.conn_token()).await;
    let resumed = second.handshake().await;
    assert_eq!(resumed.session_id, hs.session_id);
    assert_eq!(resumed.security, hs.security);
    assert_eq!(resumed.sequence, 7);

    let reply = second
        .call(7, 8, "$.user:sayHello", 0, &[Value::from("two")])
        .await;
    assert!(reply.success);
    assert_eq!(reply.value(), Value::from("hello two"));

    second.close().await;
    handle.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_sessions_are_independent() {
    let (_server, handle) = start_server(hello_service()).await;

    let mut a = RawClient::connect(&handle.url(), "").await;
    let mut b = RawClient::connect(&handle.url(), "").await;
    let hs_a = a.handshake().await;
    let hs_b = b.handshake().await;
    assert_ne!(hs_a.session_id, hs_b.session_id);
    assert_ne!(hs_a.security, hs_b.security);

    // Crash one socket; the other keeps working.
    a.close().await;
    let reply = b
        .call(hs_b.sequence as u32, 3, "$.user:sayHello", 0, &[Value::from("b")])
        .await;
    assert!(reply.success);

    // And the crashed one resumes under its own id.
    let mut a2 = RawClient::connect(&handle.url(), &hs_a.conn_token()).await;
    let resumed = a2.handshake().await;
    assert_eq!(resumed.session_id, hs_a.session_id);

    a2.close().await;
    b.close().await;
    handle.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wrong_security_token_gets_a_fresh_session() {
    let (_server, handle) = start_server(hello_service()).await;

    let mut first = RawClient::connect(&handle.url(), "").await;
    let hs = first.handshake().await;
    first.close().await;

    let bogus = format!("{}-WRONGwrongWRONGwrongWRONGwrong0", hs.session_id);
    let mut second = RawClient::connect(&handle.url(), &bogus).await;
    let fresh = second.handshake().await;
    assert_ne!(fresh.session_id, hs.session_id);

    second.close().await;
    handle.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn expired_sessions_are_reaped() {
    let mut cfg = ServerConfig::default();
    cfg.bind = "127.0.0.1:0".to_owned();
    cfg.resume_window = Duration::from_millis(200);
    let (_server, handle) = start_server_with(cfg, hello_service()).await;

    let mut first = RawClient::connect(&handle.url(), "").await;
    let hs = first.handshake().await;
    first.close().await;

    // Wait past the grace window plus a reaper tick.
    tokio::time::sleep(Duration::from_millis(1200)).await;

    let mut second = RawClient::connect(&handle.url(), &hs.conn_token()).await;
    let fresh = second.handshake().await;
    assert_ne!(fresh.session_id, hs.session_id);

    second.close().await;
    handle.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn huge_sequence_forces_a_fresh_handshake() {
    let (_server, handle) = start_server(hello_service()).await;

    let mut client = RawClient::connect(&handle.url(), "").await;
    let hs = client.handshake().await;

    // A sequence past the force-handshake threshold invalidates the
    // session; the frame itself is rejected by the sequence check.
    let stream = build_call(4_000_000_001, 5, "$.user:sayHello", 0, &[Value::from("x")]);
    client.send_stream(&stream).await;
    stream.recycle();
    assert!(client.expect_close().await);

    // The old pair no longer resumes.
    let mut second = RawClient::connect(&handle.url(), &hs.conn_token()).await;
    let fresh = second.handshake().await;
    assert_ne!(fresh.session_id, hs.session_id);

    second.close().await;
    handle.stop().await;
}
