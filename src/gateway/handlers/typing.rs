use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::warn;

use super::ack;
use crate::{
    gateway::frames::{TypingAck, TypingPayload, TypingRoomPayload},
    service::{sessions::Session, typing::TypingUser},
    services, Result,
};

/// # `typing:start`
///
/// Marks the user as typing in the room. The update reaches every
/// instance through the typing-update channel; there is no direct local
/// broadcast.
pub async fn start(session: &Arc<Session>, payload: TypingRoomPayload) -> Result<JsonValue> {
    services()
        .connectors
        .room_access(&session.user_id, &payload.room_id)
        .await?;

    let typing_users = best_effort(
        services()
            .typing
            .start(&session.user_id, &payload.room_id, &session.username)
            .await,
        &payload.room_id,
    )?;

    ack(TypingAck {
        room_id: payload.room_id,
        typing_users,
    })
}

/// # `typing:stop`
pub async fn stop(session: &Arc<Session>, payload: TypingRoomPayload) -> Result<JsonValue> {
    services()
        .connectors
        .room_access(&session.user_id, &payload.room_id)
        .await?;

    let typing_users = best_effort(
        services()
            .typing
            .stop(&session.user_id, &payload.room_id)
            .await,
        &payload.room_id,
    )?;

    ack(TypingAck {
        room_id: payload.room_id,
        typing_users,
    })
}

/// # `typing` (deprecated)
///
/// The combined frame maps onto start/stop.
pub async fn legacy(session: &Arc<Session>, payload: TypingPayload) -> Result<JsonValue> {
    let room = TypingRoomPayload {
        room_id: payload.room_id,
    };

    if payload.is_typing {
        start(session, room).await
    } else {
        stop(session, room).await
    }
}

/// Typing is best-effort: a keyspace hiccup degrades to an empty list
/// instead of an error frame.
fn best_effort(
    result: Result<Vec<TypingUser>>,
    room_id: &str,
) -> Result<Vec<TypingUser>> {
    match result {
        Ok(users) => Ok(users),
        Err(error) if error.is_transient() => {
            warn!(%error, room_id, "Typing update dropped");
            Ok(Vec::new())
        }
        Err(error) => Err(error),
    }
}
