use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::warn;

use super::ack;
use crate::{
    gateway::frames::{RoomJoinAck, RoomJoinPayload, RoomLeaveAck, RoomLeavePayload},
    service::{presence::PresenceStatus, sessions::Session},
    services, Result,
};

/// # `room:join`
///
/// Joins the socket to a room.
///
/// - Access goes through the persistence service, which may auto-join
///   public rooms up to capacity
/// - Membership lands in the room cache, presence is asserted in the room
///   and the `user:joined` announcement travels the room-event channel
pub async fn join(session: &Arc<Session>, payload: RoomJoinPayload) -> Result<JsonValue> {
    let access = services()
        .connectors
        .room_access(&session.user_id, &payload.room_id)
        .await?;

    services()
        .rooms
        .add_user_to_room(&session.user_id, &payload.room_id, &session.username)
        .await?;
    session.join_room(&payload.room_id);

    services()
        .presence
        .set_presence_in_room(&session.user_id, &payload.room_id, PresenceStatus::Online)
        .await?;

    let online_users = services()
        .presence
        .get_room_presence(
            &payload.room_id,
            services().globals.presence_offline_timeout_ms(),
            services().globals.room_presence_limit(),
        )
        .await?
        .into_iter()
        .filter(|member| member.status != PresenceStatus::Offline)
        .collect();

    ack(RoomJoinAck {
        room_id: payload.room_id,
        room_name: access.name,
        member_count: access.member_count,
        online_users,
    })
}

/// # `room:leave`
///
/// Leaves a room: membership cache, room presence and any typing state.
/// Cleanup mirrors the disconnect path.
pub async fn leave(session: &Arc<Session>, payload: RoomLeavePayload) -> Result<JsonValue> {
    session.leave_room(&payload.room_id);

    services()
        .rooms
        .remove_user_from_room(&session.user_id, &payload.room_id, &session.username)
        .await?;

    if let Err(error) = services()
        .presence
        .clear_room_presence(&session.user_id, &payload.room_id)
        .await
    {
        warn!(%error, room_id = payload.room_id, "Could not clear room presence on leave");
    }

    if let Err(error) = services()
        .typing
        .stop(&session.user_id, &payload.room_id)
        .await
    {
        warn!(%error, room_id = payload.room_id, "Could not stop typing on leave");
    }

    ack(RoomLeaveAck {
        room_id: payload.room_id,
        success: true,
    })
}
