use std::{collections::HashSet, sync::Arc};

use serde_json::Value as JsonValue;

use super::ack;
use crate::{
    gateway::frames::{
        HeartbeatAck, PresenceRoomAck, PresenceRoomPayload, PresenceStatusPayload, SuccessAck,
    },
    service::{
        presence::{PresenceStatus, RoomPresenceMember},
        rate_limit::Restriction,
        sessions::Session,
    },
    services, utils, Error, ErrorCode, Result,
};

/// # `heartbeat`
///
/// Refreshes the session and the global presence record, promoting an
/// OFFLINE user back to ONLINE. Status never changes otherwise.
pub async fn heartbeat(session: &Arc<Session>) -> Result<JsonValue> {
    services()
        .rate_limit
        .check(Restriction::Heartbeat, &session.user_id)
        .await?;

    services().presence.heartbeat(&session.user_id).await?;

    ack(HeartbeatAck {
        timestamp: utils::millis_since_unix_epoch(),
    })
}

/// # `presence:status`
///
/// Sets the user's explicit intent. AWAY and BUSY persist until changed
/// or disconnected; OFFLINE is not a settable intent.
pub async fn set_status(
    session: &Arc<Session>,
    payload: PresenceStatusPayload,
) -> Result<JsonValue> {
    if payload.status == PresenceStatus::Offline {
        return Err(Error::BadRequest(
            ErrorCode::BadFrame,
            "OFFLINE cannot be set explicitly.",
        ));
    }

    services()
        .rate_limit
        .check(Restriction::PresenceStatus, &session.user_id)
        .await?;

    services()
        .presence
        .set_online(&session.user_id, payload.status, session.device_id.clone())
        .await?;

    ack(SuccessAck { success: true })
}

/// # `presence:room`
///
/// All members of a room with their derived status and per-status
/// totals. Members without a recent presence entry count as OFFLINE.
pub async fn room(session: &Arc<Session>, payload: PresenceRoomPayload) -> Result<JsonValue> {
    services()
        .rate_limit
        .check(Restriction::PresenceRoom, &session.user_id)
        .await?;

    let mut members = services()
        .presence
        .get_room_presence(
            &payload.room_id,
            services().globals.presence_offline_timeout_ms(),
            services().globals.room_presence_limit(),
        )
        .await?;

    let seen: HashSet<String> = members
        .iter()
        .map(|member| member.user_id.clone())
        .collect();

    // Connected room members that fell out of the presence window
    for user_id in services().rooms.room_users(&payload.room_id).await? {
        if !seen.contains(&user_id) {
            members.push(RoomPresenceMember {
                user_id,
                status: PresenceStatus::Offline,
                last_seen_at: 0,
            });
        }
    }

    let count = |status: PresenceStatus| -> u64 {
        members
            .iter()
            .filter(|member| member.status == status)
            .count() as u64
    };

    let ack_payload = PresenceRoomAck {
        total_online: count(PresenceStatus::Online),
        total_idle: count(PresenceStatus::Idle),
        total_away: count(PresenceStatus::Away),
        total_busy: count(PresenceStatus::Busy),
        total_offline: count(PresenceStatus::Offline),
        room_id: payload.room_id,
        members,
    };

    ack(ack_payload)
}
