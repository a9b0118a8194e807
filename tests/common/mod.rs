//! Shared harness for the integration suites: boots the services once on
//! the suite runtime against the memory keyspace engine and the seedable
//! in-process connector, and fakes socket attachment the way the gateway
//! does it.

// Each suite binary uses a different subset of the harness
#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use serde_json::{json, Value as JsonValue};
use tokio::sync::{mpsc, OnceCell};

use roomcast::{
    gateway::{
        self,
        frames::{InboundEnvelope, SocketMessage},
    },
    service::{connectors::memory::MemoryConnector, sessions::Session},
    services, Config, KeyspaceAdapter,
};

static INIT: OnceCell<()> = OnceCell::const_new();

pub async fn setup() {
    INIT.get_or_init(|| async {
        let config: Config = serde_json::from_value(json!({
            "keyspace_backend": "memory",
            "reconnect_grace_ms": 200,
            "typing_ttl_s": 1,
        }))
        .expect("test config is valid");

        KeyspaceAdapter::load_or_create(config)
            .await
            .expect("services boot");
    })
    .await;
}

pub fn persistence() -> &'static MemoryConnector {
    services()
        .connectors
        .memory()
        .expect("memory connector is configured")
}

pub fn seed_user(user_id: &str, username: &str) {
    persistence().add_user(user_id, username);
}

pub fn seed_room(room_id: &str, name: &str) {
    persistence().add_room(room_id, name, true, 100);
}

pub fn seed_member(room_id: &str, user_id: &str) {
    persistence().add_room_member(room_id, user_id);
}

/// Attaches a session the way the gateway handshake does, minus the
/// actual websocket.
pub async fn connect(
    user_id: &str,
    username: &str,
) -> (Arc<Session>, mpsc::UnboundedReceiver<SocketMessage>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let session = Arc::new(Session::new(
        user_id.to_owned(),
        username.to_owned(),
        None,
        sender,
    ));

    services().sessions.register(Arc::clone(&session));
    services()
        .presence
        .handle_reconnection(user_id, None)
        .await
        .expect("reconnection succeeds");

    (session, receiver)
}

pub async fn disconnect(session: &Arc<Session>) {
    services().sessions.unregister(&session.socket_id).await;
}

pub async fn dispatch(
    session: &Arc<Session>,
    event: &str,
    data: JsonValue,
) -> roomcast::Result<JsonValue> {
    let envelope = InboundEnvelope {
        event: event.to_owned(),
        data,
        id: Some(1),
    };

    gateway::handlers::dispatch(session, &envelope).await
}

/// Waits for a frame with the given event name, discarding everything
/// else that arrives before it. Returns the whole envelope.
pub async fn wait_for_frame(
    receiver: &mut mpsc::UnboundedReceiver<SocketMessage>,
    event: &str,
) -> gateway::frames::OutboundEnvelope {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match receiver.recv().await {
                Some(SocketMessage::Frame(frame)) if frame.event == event => return frame,
                Some(_) => continue,
                None => panic!("socket queue closed while waiting for {event}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {event}"))
}

/// Like [`wait_for_frame`], but returns only the payload.
pub async fn wait_for_event(
    receiver: &mut mpsc::UnboundedReceiver<SocketMessage>,
    event: &str,
) -> JsonValue {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match receiver.recv().await {
                Some(SocketMessage::Frame(frame)) if frame.event == event => return frame.data,
                Some(_) => continue,
                None => panic!("socket queue closed while waiting for {event}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {event}"))
}

/// Asserts that no frame with the given event name shows up within the
/// window.
pub async fn assert_no_event(
    receiver: &mut mpsc::UnboundedReceiver<SocketMessage>,
    event: &str,
    within: Duration,
) {
    tokio::time::sleep(within).await;

    while let Ok(message) = receiver.try_recv() {
        if let SocketMessage::Frame(frame) = message {
            assert_ne!(frame.event, event, "unexpected {event} frame: {:?}", frame.data);
        }
    }
}

pub fn drain(receiver: &mut mpsc::UnboundedReceiver<SocketMessage>) {
    while receiver.try_recv().is_ok() {}
}
