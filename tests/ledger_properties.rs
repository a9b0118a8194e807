//! Ledger invariants and idempotence properties, run as one sequential
//! suite on a single runtime.

mod common;

use std::time::Duration;

use common::*;
use roomcast::{
    service::presence::{Data as PresenceData, PresenceRecord, PresenceStatus, RoomPresenceEntry},
    service::rate_limit::FailPolicy,
    service::rooms::Data as RoomsData,
    services,
};
use serde_json::json;
use tokio::time::sleep;

#[tokio::test]
async fn ledger_properties() {
    setup().await;

    online_index_follows_status().await;
    set_offline_clears_every_room().await;
    typing_round_trip_restores_the_set().await;
    heartbeat_is_idempotent().await;
    repeated_read_broadcasts_once().await;
    sliding_window_bounds_admissions().await;
    remote_reconnect_cancels_local_grace().await;
    sweep_persists_offline_transitions().await;
}

/// A user is indexed in the online sorted set iff their record is not
/// OFFLINE, and the room intersection follows it.
async fn online_index_follows_status() {
    seed_user("lp1-u", "alice");
    seed_room("lp1-r", "index room");
    seed_member("lp1-r", "lp1-u");
    services()
        .rooms
        .db
        .add_user_to_room("lp1-u", "lp1-r")
        .await
        .unwrap();

    services()
        .presence
        .set_online("lp1-u", PresenceStatus::Online, None)
        .await
        .unwrap();
    let scores = services()
        .rooms
        .db
        .online_scores(&["lp1-u".to_owned()])
        .await
        .unwrap();
    assert!(scores[0].is_some());
    assert_eq!(
        services()
            .rooms
            .online_users_in_room("lp1-r")
            .await
            .unwrap(),
        vec!["lp1-u".to_owned()]
    );

    services().presence.set_offline("lp1-u").await.unwrap();
    let scores = services()
        .rooms
        .db
        .online_scores(&["lp1-u".to_owned()])
        .await
        .unwrap();
    assert!(scores[0].is_none());
    assert!(services()
        .rooms
        .online_users_in_room("lp1-r")
        .await
        .unwrap()
        .is_empty());
}

/// After set_offline the user is absent from every room presence set
/// reachable through the user→rooms index.
async fn set_offline_clears_every_room() {
    seed_user("lp2-u", "bob");
    for room in ["lp2-r1", "lp2-r2"] {
        seed_room(room, room);
        seed_member(room, "lp2-u");
        services()
            .rooms
            .db
            .add_user_to_room("lp2-u", room)
            .await
            .unwrap();
        services()
            .presence
            .set_presence_in_room("lp2-u", room, PresenceStatus::Online)
            .await
            .unwrap();
    }

    services().presence.set_offline("lp2-u").await.unwrap();

    for room in ["lp2-r1", "lp2-r2"] {
        let page = services()
            .presence
            .db
            .room_presence_page(room, 0, 100)
            .await
            .unwrap();
        assert!(
            page.iter().all(|(user, _)| user != "lp2-u"),
            "lp2-u still present in {room}"
        );
    }
}

/// typing:start followed by typing:stop restores the exact set of typing
/// users.
async fn typing_round_trip_restores_the_set() {
    seed_user("lp3-u1", "carol");
    seed_user("lp3-u2", "dave");
    seed_room("lp3-r", "typing");
    seed_member("lp3-r", "lp3-u1");
    seed_member("lp3-r", "lp3-u2");

    let before = services()
        .typing
        .start("lp3-u1", "lp3-r", "carol")
        .await
        .unwrap();

    services()
        .typing
        .start("lp3-u2", "lp3-r", "dave")
        .await
        .unwrap();
    let after = services().typing.stop("lp3-u2", "lp3-r").await.unwrap();

    let ids = |users: &[roomcast::service::typing::TypingUser]| {
        let mut ids: Vec<_> = users.iter().map(|u| u.user_id.clone()).collect();
        ids.sort();
        ids
    };
    assert_eq!(ids(&before), ids(&after));
}

/// Heartbeats only advance lastSeenAt; the only status transition they
/// make is OFFLINE→ONLINE, once.
async fn heartbeat_is_idempotent() {
    seed_user("lp4-u", "erin");

    services()
        .presence
        .set_online("lp4-u", PresenceStatus::Away, None)
        .await
        .unwrap();

    let first = services().presence.heartbeat("lp4-u").await.unwrap();
    assert_eq!(first, PresenceStatus::Away, "user intent survives heartbeats");

    let seen_before = services()
        .presence
        .db
        .get_presence("lp4-u")
        .await
        .unwrap()
        .unwrap()
        .last_seen_at;
    sleep(Duration::from_millis(20)).await;

    let second = services().presence.heartbeat("lp4-u").await.unwrap();
    assert_eq!(second, PresenceStatus::Away);

    let seen_after = services()
        .presence
        .db
        .get_presence("lp4-u")
        .await
        .unwrap()
        .unwrap()
        .last_seen_at;
    assert!(seen_after > seen_before);

    services().presence.set_offline("lp4-u").await.unwrap();
    let promoted = services().presence.heartbeat("lp4-u").await.unwrap();
    assert_eq!(promoted, PresenceStatus::Online);
}

/// Repeated message:read produces one receipt entry and at most one
/// broadcast to the sender.
async fn repeated_read_broadcasts_once() {
    seed_user("lp5-u1", "frank");
    seed_user("lp5-u2", "grace");
    seed_room("lp5-r", "reads");
    seed_member("lp5-r", "lp5-u1");
    seed_member("lp5-r", "lp5-u2");

    let (sender, mut sender_rx) = connect("lp5-u1", "frank").await;
    let (reader, _reader_rx) = connect("lp5-u2", "grace").await;
    dispatch(&sender, "room:join", json!({ "roomId": "lp5-r" }))
        .await
        .unwrap();
    dispatch(&reader, "room:join", json!({ "roomId": "lp5-r" }))
        .await
        .unwrap();
    drain(&mut sender_rx);

    let message = dispatch(
        &sender,
        "message:send",
        json!({ "roomId": "lp5-r", "content": "read me twice" }),
    )
    .await
    .unwrap();
    let message_id = message["id"].as_str().unwrap().to_owned();

    for _ in 0..2 {
        dispatch(
            &reader,
            "message:read",
            json!({ "roomId": "lp5-r", "messageId": message_id }),
        )
        .await
        .unwrap();
    }

    let receipt = wait_for_event(&mut sender_rx, "message:read").await;
    assert_eq!(receipt["userId"], "lp5-u2");
    assert_no_event(&mut sender_rx, "message:read", Duration::from_millis(300)).await;

    let receipts = dispatch(
        &sender,
        "read_receipts:get",
        json!({ "roomId": "lp5-r", "messageId": message_id }),
    )
    .await
    .unwrap();
    assert_eq!(receipts["readers"].as_array().map(Vec::len), Some(1));

    disconnect(&sender).await;
    disconnect(&reader).await;
}

/// Within any window of W seconds at most L checks pass.
async fn sliding_window_bounds_admissions() {
    let limiter = &services().rate_limit;

    let mut allowed = 0;
    for _ in 0..8 {
        let outcome = limiter
            .check_scope("lp6-probe", 5, Duration::from_secs(1), FailPolicy::Open)
            .await
            .unwrap();
        if outcome.allowed {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 5);

    // A fresh window admits again
    sleep(Duration::from_millis(1100)).await;
    let outcome = limiter
        .check_scope("lp6-probe", 5, Duration::from_secs(1), FailPolicy::Open)
        .await
        .unwrap();
    assert!(outcome.allowed);
}

/// A user-status event from another instance cancels the local grace
/// timer before it can offline the user.
async fn remote_reconnect_cancels_local_grace() {
    seed_user("lp7-u", "heidi");

    let (session, _rx) = connect("lp7-u", "heidi").await;
    disconnect(&session).await;

    // "Instance B" admits the user: it cancels the marker and announces
    // the status
    services()
        .presence
        .cancel_disconnect_grace("lp7-u")
        .await
        .unwrap();
    services()
        .presence
        .set_online("lp7-u", PresenceStatus::Online, None)
        .await
        .unwrap();

    // Give the local timer (200 ms in this suite) room to fire
    sleep(Duration::from_millis(600)).await;

    let record = services()
        .presence
        .db
        .get_presence("lp7-u")
        .await
        .unwrap()
        .expect("presence record exists");
    assert_eq!(
        record.status,
        PresenceStatus::Online,
        "remote reconnect kept the user online"
    );
}

/// The sweep drops users idle past the offline cutoff from the online
/// and room sorted sets and persists the transition through the
/// connector.
async fn sweep_persists_offline_transitions() {
    seed_user("lp8-u", "ivan");
    seed_room("lp8-r", "sweep room");
    seed_member("lp8-r", "lp8-u");
    services()
        .rooms
        .db
        .add_user_to_room("lp8-u", "lp8-r")
        .await
        .unwrap();

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64;
    let stale_at = now - 16 * 60 * 1000;

    // A record whose last activity predates the offline cutoff
    services()
        .presence
        .db
        .set_presence(
            &PresenceRecord {
                user_id: "lp8-u".to_owned(),
                status: PresenceStatus::Online,
                last_seen_at: stale_at,
                device_id: None,
                rooms: vec!["lp8-r".to_owned()],
            },
            Duration::from_secs(900),
        )
        .await
        .unwrap();
    services()
        .presence
        .db
        .set_room_presence(
            "lp8-r",
            "lp8-u",
            &RoomPresenceEntry {
                status: PresenceStatus::Online,
                last_seen_at: stale_at,
            },
            Duration::from_secs(900),
        )
        .await
        .unwrap();

    assert!(!persistence().user_marked_offline("lp8-u"));

    services().presence.sweep_stale().await.unwrap();

    assert!(
        persistence().user_marked_offline("lp8-u"),
        "the sweep persists OFFLINE through the connector"
    );

    let scores = services()
        .rooms
        .db
        .online_scores(&["lp8-u".to_owned()])
        .await
        .unwrap();
    assert!(scores[0].is_none(), "swept out of the online index");

    let page = services()
        .presence
        .db
        .room_presence_page("lp8-r", 0, 100)
        .await
        .unwrap();
    assert!(
        page.iter().all(|(user, _)| user != "lp8-u"),
        "swept out of the room presence set"
    );
}
