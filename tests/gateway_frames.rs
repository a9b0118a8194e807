//! Frame-level behavior of the gateway: decode failures, unknown kinds,
//! ack correlation and rate-limit error frames.

mod common;

use std::time::Duration;

use common::*;
use roomcast::gateway;
use serde_json::json;

#[tokio::test]
async fn gateway_frame_semantics() {
    setup().await;

    bad_frames_do_not_disconnect().await;
    unknown_frame_kind_is_bad_frame().await;
    acks_echo_the_inbound_id().await;
    frames_without_id_get_no_ack().await;
    contract_failures_surface_stable_codes().await;
    rate_limited_frames_carry_retry_after().await;
}

/// An undecodable frame yields an error frame but the socket keeps
/// working.
async fn bad_frames_do_not_disconnect() {
    let (session, mut rx) = connect("gf1-u", "alice").await;

    gateway::handle_frame(&session, "not json at all").await;
    let error = wait_for_event(&mut rx, "error").await;
    assert_eq!(error["code"], "BAD_FRAME");

    // Same socket, next frame is fine
    gateway::handle_frame(&session, r#"{"event":"heartbeat","id":1}"#).await;
    let ack = wait_for_frame(&mut rx, "ack").await;
    assert_eq!(ack.id, Some(1));

    disconnect(&session).await;
}

async fn unknown_frame_kind_is_bad_frame() {
    let (session, mut rx) = connect("gf2-u", "bob").await;

    gateway::handle_frame(&session, r#"{"event":"room:paint","id":9}"#).await;
    let error = wait_for_frame(&mut rx, "error").await;
    assert_eq!(error.id, Some(9));
    assert_eq!(error.data["code"], "BAD_FRAME");

    disconnect(&session).await;
}

async fn acks_echo_the_inbound_id() {
    let (session, mut rx) = connect("gf3-u", "carol").await;

    gateway::handle_frame(&session, r#"{"event":"heartbeat","id":42}"#).await;
    let ack = wait_for_frame(&mut rx, "ack").await;
    assert_eq!(ack.id, Some(42));
    assert!(ack.data["timestamp"].as_u64().is_some());

    disconnect(&session).await;
}

async fn frames_without_id_get_no_ack() {
    let (session, mut rx) = connect("gf4-u", "dave").await;

    gateway::handle_frame(&session, r#"{"event":"heartbeat"}"#).await;
    assert_no_event(&mut rx, "ack", Duration::from_millis(200)).await;

    disconnect(&session).await;
}

/// Failures from the persistence contracts map to the stable wire codes.
async fn contract_failures_surface_stable_codes() {
    seed_user("gf5-u", "erin");
    let (session, mut rx) = connect("gf5-u", "erin").await;

    // Room does not exist
    gateway::handle_frame(
        &session,
        r#"{"event":"message:send","data":{"roomId":"gf5-none","content":"hi"},"id":3}"#,
    )
    .await;
    let error = wait_for_frame(&mut rx, "error").await;
    assert_eq!(error.id, Some(3));
    assert_eq!(error.data["code"], "NOT_FOUND");

    // Oversized content never reaches the persister
    let long = "x".repeat(4001);
    let frame = json!({
        "event": "message:send",
        "data": { "roomId": "gf5-none", "content": long },
        "id": 4,
    });
    gateway::handle_frame(&session, &frame.to_string()).await;
    let error = wait_for_frame(&mut rx, "error").await;
    assert_eq!(error.data["code"], "SEND_FAILED");

    disconnect(&session).await;
}

/// The 31st presence:status inside a minute is rejected with a
/// retry-after hint.
async fn rate_limited_frames_carry_retry_after() {
    let (session, mut rx) = connect("gf6-u", "frank").await;

    for i in 0..30u64 {
        gateway::handle_frame(
            &session,
            &json!({
                "event": "presence:status",
                "data": { "status": "AWAY" },
                "id": i,
            })
            .to_string(),
        )
        .await;
        let ack = wait_for_frame(&mut rx, "ack").await;
        assert_eq!(ack.id, Some(i));
    }

    gateway::handle_frame(
        &session,
        r#"{"event":"presence:status","data":{"status":"AWAY"},"id":99}"#,
    )
    .await;
    let error = wait_for_frame(&mut rx, "error").await;
    assert_eq!(error.id, Some(99));
    assert_eq!(error.data["code"], "RATE_LIMITED");
    let retry_after = error.data["retryAfter"].as_u64().unwrap();
    assert!((1..=60).contains(&retry_after));

    disconnect(&session).await;
}
