//! The end-to-end scenarios, run as one sequential suite so every
//! background task lives on the suite runtime.

mod common;

use std::time::Duration;

use common::*;
use roomcast::{
    gateway,
    service::presence::{Data as PresenceData, PresenceStatus, RoomPresenceEntry},
    service::rooms::Data as RoomsData,
    services, Error, ErrorCode,
};
use serde_json::json;
use tokio::time::sleep;

#[tokio::test]
async fn end_to_end_scenarios() {
    setup().await;

    two_sessions_one_user().await;
    token_refresh_family_revocation().await;
    typing_fan_out_and_ttl_expiry().await;
    read_receipt_privacy().await;
    message_send_rate_limit().await;
    presence_status_derivation().await;
    deactivated_user_cannot_connect().await;
    shadow_banned_sender_reaches_nobody().await;
    muted_member_cannot_send().await;
}

/// Scenario 1: a user with two sessions only goes offline once the last
/// one has been gone past the grace period.
async fn two_sessions_one_user() {
    seed_user("sc1-u", "alice");

    let (s1, _rx1) = connect("sc1-u", "alice").await;
    let (s2, _rx2) = connect("sc1-u", "alice").await;

    disconnect(&s1).await;
    sleep(Duration::from_millis(600)).await;

    let record = services()
        .presence
        .db
        .get_presence("sc1-u")
        .await
        .unwrap()
        .expect("presence record exists");
    assert_ne!(record.status, PresenceStatus::Offline, "s2 is still alive");

    disconnect(&s2).await;
    sleep(Duration::from_millis(600)).await;

    let record = services()
        .presence
        .db
        .get_presence("sc1-u")
        .await
        .unwrap()
        .expect("presence record exists");
    assert_eq!(record.status, PresenceStatus::Offline);
}

/// Scenario 2: refresh rotation; reusing a rotated token revokes the
/// whole family.
async fn token_refresh_family_revocation() {
    seed_user("sc2-u", "bob");
    let pair = persistence().issue_tokens("sc2-u", Some("d1"));

    let (session, mut rx) = connect("sc2-u", "bob").await;

    let ack = dispatch(
        &session,
        "auth:refresh",
        json!({ "refreshToken": pair.refresh_token }),
    )
    .await
    .expect("first refresh succeeds");

    let rotated = ack["refreshToken"].as_str().unwrap().to_owned();
    assert!(ack["accessToken"].as_str().is_some());

    // The same-socket auth:refreshed event
    let refreshed = wait_for_event(&mut rx, "auth:refreshed").await;
    assert_eq!(refreshed["refreshToken"], ack["refreshToken"]);

    // Reusing the old token fails and revokes the family
    let reuse = dispatch(
        &session,
        "auth:refresh",
        json!({ "refreshToken": pair.refresh_token }),
    )
    .await;
    assert!(matches!(
        reuse,
        Err(Error::BadRequest(ErrorCode::Unauthorized, _))
    ));

    // Even the legitimately rotated token is dead now
    let after_revocation = dispatch(
        &session,
        "auth:refresh",
        json!({ "refreshToken": rotated }),
    )
    .await;
    assert!(matches!(
        after_revocation,
        Err(Error::BadRequest(ErrorCode::Unauthorized, _))
    ));

    disconnect(&session).await;
}

/// Scenario 3: typing updates fan out to room members and empty out by
/// TTL without an explicit stop.
async fn typing_fan_out_and_ttl_expiry() {
    seed_user("sc3-u1", "carol");
    seed_user("sc3-u2", "dave");
    seed_room("sc3-r", "typing room");
    seed_member("sc3-r", "sc3-u1");
    seed_member("sc3-r", "sc3-u2");

    let (u1, _u1rx) = connect("sc3-u1", "carol").await;
    let (u2, mut u2rx) = connect("sc3-u2", "dave").await;

    dispatch(&u1, "room:join", json!({ "roomId": "sc3-r" }))
        .await
        .unwrap();
    dispatch(&u2, "room:join", json!({ "roomId": "sc3-r" }))
        .await
        .unwrap();
    drain(&mut u2rx);

    let ack = dispatch(&u1, "typing:start", json!({ "roomId": "sc3-r" }))
        .await
        .unwrap();
    assert_eq!(ack["typingUsers"][0]["userId"], "sc3-u1");

    let update = wait_for_event(&mut u2rx, "typing:update").await;
    assert_eq!(update["roomId"], "sc3-r");
    assert_eq!(update["typingUsers"][0]["userId"], "sc3-u1");
    assert_eq!(update["typingUsers"][0]["username"], "carol");

    // No further start: the TTL empties the list and the expiry task
    // re-publishes it
    let empty = wait_for_event(&mut u2rx, "typing:update").await;
    assert_eq!(
        empty["typingUsers"].as_array().map(Vec::len),
        Some(0),
        "typing list empties out by TTL"
    );

    disconnect(&u1).await;
    disconnect(&u2).await;
}

/// Scenario 4: read receipts reach the sender only, and only when the
/// reader has them enabled.
async fn read_receipt_privacy() {
    seed_user("sc4-u1", "erin");
    seed_user("sc4-u2", "frank");
    seed_user("sc4-u3", "grace");
    seed_room("sc4-r", "receipts room");
    seed_member("sc4-r", "sc4-u1");
    seed_member("sc4-r", "sc4-u2");
    seed_member("sc4-r", "sc4-u3");

    let (u1, mut u1rx) = connect("sc4-u1", "erin").await;
    let (u2, _u2rx) = connect("sc4-u2", "frank").await;
    let (u3, mut u3rx) = connect("sc4-u3", "grace").await;

    for session in [&u1, &u2, &u3] {
        dispatch(session, "room:join", json!({ "roomId": "sc4-r" }))
            .await
            .unwrap();
    }
    drain(&mut u1rx);
    drain(&mut u3rx);

    let message = dispatch(
        &u1,
        "message:send",
        json!({ "roomId": "sc4-r", "content": "who read this?" }),
    )
    .await
    .unwrap();
    let message_id = message["id"].as_str().unwrap().to_owned();

    dispatch(
        &u2,
        "message:read",
        json!({ "roomId": "sc4-r", "messageId": message_id }),
    )
    .await
    .unwrap();

    let receipt = wait_for_event(&mut u1rx, "message:read").await;
    assert_eq!(receipt["userId"], "sc4-u2");
    assert_eq!(receipt["messageId"], message_id);

    // u3 is a member but not the sender; nothing reaches them
    assert_no_event(&mut u3rx, "message:read", Duration::from_millis(300)).await;

    // A reader with receipts disabled leaves no trace
    persistence().set_read_receipts_enabled("sc4-u3", false);
    drain(&mut u1rx);
    dispatch(
        &u3,
        "message:read",
        json!({ "roomId": "sc4-r", "messageId": message_id }),
    )
    .await
    .unwrap();
    assert_no_event(&mut u1rx, "message:read", Duration::from_millis(300)).await;

    disconnect(&u1).await;
    disconnect(&u2).await;
    disconnect(&u3).await;
}

/// Scenario 5: sixty sends pass, the sixty-first is rejected with a
/// usable retry-after.
async fn message_send_rate_limit() {
    seed_user("sc5-u", "heidi");
    seed_room("sc5-r", "busy room");
    seed_member("sc5-r", "sc5-u");

    let (session, _rx) = connect("sc5-u", "heidi").await;
    dispatch(&session, "room:join", json!({ "roomId": "sc5-r" }))
        .await
        .unwrap();

    for i in 0..60 {
        dispatch(
            &session,
            "message:send",
            json!({ "roomId": "sc5-r", "content": format!("message {i}") }),
        )
        .await
        .unwrap_or_else(|error| panic!("send {i} should pass: {error}"));
    }

    let rejected = dispatch(
        &session,
        "message:send",
        json!({ "roomId": "sc5-r", "content": "one too many" }),
    )
    .await;

    match rejected {
        Err(Error::RateLimited { retry_after_secs }) => {
            assert!((1..=60).contains(&retry_after_secs));
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }

    disconnect(&session).await;
}

/// Scenario 6: status is derived from lastSeenAt on read — six minutes
/// idle reads as IDLE, sixteen minutes as OFFLINE.
async fn presence_status_derivation() {
    seed_user("sc6-viewer", "ivan");
    seed_room("sc6-r", "derivation room");
    seed_member("sc6-r", "sc6-viewer");

    let (viewer, _rx) = connect("sc6-viewer", "ivan").await;
    dispatch(&viewer, "room:join", json!({ "roomId": "sc6-r" }))
        .await
        .unwrap();

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64;

    // Stored ONLINE six minutes ago
    services()
        .presence
        .db
        .set_room_presence(
            "sc6-r",
            "sc6-idle",
            &RoomPresenceEntry {
                status: PresenceStatus::Online,
                last_seen_at: now - 6 * 60 * 1000,
            },
            Duration::from_secs(900),
        )
        .await
        .unwrap();

    // Stored ONLINE sixteen minutes ago, still a cached room member
    services()
        .rooms
        .db
        .add_user_to_room("sc6-stale", "sc6-r")
        .await
        .unwrap();
    services()
        .presence
        .db
        .set_room_presence(
            "sc6-r",
            "sc6-stale",
            &RoomPresenceEntry {
                status: PresenceStatus::Online,
                last_seen_at: now - 16 * 60 * 1000,
            },
            Duration::from_secs(900),
        )
        .await
        .unwrap();

    let ack = dispatch(&viewer, "presence:room", json!({ "roomId": "sc6-r" }))
        .await
        .unwrap();

    let status_of = |user: &str| {
        ack["members"]
            .as_array()
            .unwrap()
            .iter()
            .find(|member| member["userId"] == user)
            .unwrap_or_else(|| panic!("{user} missing from members"))["status"]
            .clone()
    };

    assert_eq!(status_of("sc6-idle"), "IDLE");
    assert_eq!(status_of("sc6-stale"), "OFFLINE");
    assert!(ack["totalIdle"].as_u64().unwrap() >= 1);
    assert!(ack["totalOffline"].as_u64().unwrap() >= 1);

    disconnect(&viewer).await;
}

/// A deactivated account passes token verification but is refused at
/// the handshake.
async fn deactivated_user_cannot_connect() {
    seed_user("sc7-ok", "judy");
    seed_user("sc7-gone", "kevin");
    let ok_pair = persistence().issue_tokens("sc7-ok", None);
    let gone_pair = persistence().issue_tokens("sc7-gone", None);

    persistence().deactivate_user("sc7-gone");

    let admitted = gateway::authenticate(Some(ok_pair.access_token))
        .await
        .expect("active account connects");
    assert_eq!(admitted.user_id, "sc7-ok");

    let refused = gateway::authenticate(Some(gone_pair.access_token)).await;
    assert!(matches!(
        refused,
        Err(Error::BadRequest(ErrorCode::Unauthorized, _))
    ));
}

/// A shadow-banned sender gets a normal ack, but the message fans out
/// to nobody.
async fn shadow_banned_sender_reaches_nobody() {
    seed_user("sc8-u1", "mallory");
    seed_user("sc8-u2", "niaj");
    seed_room("sc8-r", "quiet room");
    seed_member("sc8-r", "sc8-u1");
    seed_member("sc8-r", "sc8-u2");

    let (banned, _banned_rx) = connect("sc8-u1", "mallory").await;
    let (watcher, mut watcher_rx) = connect("sc8-u2", "niaj").await;
    dispatch(&banned, "room:join", json!({ "roomId": "sc8-r" }))
        .await
        .unwrap();
    dispatch(&watcher, "room:join", json!({ "roomId": "sc8-r" }))
        .await
        .unwrap();
    drain(&mut watcher_rx);

    persistence().shadow_ban_user("sc8-u1");

    let ack = dispatch(
        &banned,
        "message:send",
        json!({ "roomId": "sc8-r", "content": "can anyone hear me?" }),
    )
    .await
    .expect("the sender sees a normal ack");
    assert!(ack["id"].as_str().is_some());
    assert_eq!(ack["content"], "can anyone hear me?");

    assert_no_event(&mut watcher_rx, "message:new", Duration::from_millis(300)).await;

    disconnect(&banned).await;
    disconnect(&watcher).await;
}

/// A muted room member is rejected by the persister.
async fn muted_member_cannot_send() {
    seed_user("sc9-u", "oscar");
    seed_room("sc9-r", "moderated room");
    seed_member("sc9-r", "sc9-u");
    persistence().mute_room_member("sc9-r", "sc9-u");

    let (session, _rx) = connect("sc9-u", "oscar").await;
    dispatch(&session, "room:join", json!({ "roomId": "sc9-r" }))
        .await
        .unwrap();

    let rejected = dispatch(
        &session,
        "message:send",
        json!({ "roomId": "sc9-r", "content": "let me speak" }),
    )
    .await;
    assert!(matches!(
        rejected,
        Err(Error::BadRequest(ErrorCode::Forbidden, _))
    ));

    disconnect(&session).await;
}
