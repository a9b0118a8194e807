//! Wire frame surface. One frame is one JSON envelope over the socket
//! transport; acks echo the inbound `id`.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::service::presence::PresenceStatus;

/// Envelope of every client → server frame.
#[derive(Debug, Deserialize)]
pub struct InboundEnvelope {
    pub event: String,
    #[serde(default)]
    pub data: JsonValue,
    #[serde(default)]
    pub id: Option<u64>,
}

/// Envelope of every server → client frame.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundEnvelope {
    pub event: String,
    pub data: JsonValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl OutboundEnvelope {
    pub fn event(event: &str, data: impl Serialize) -> Self {
        Self {
            event: event.to_owned(),
            data: serde_json::to_value(data).expect("outbound frame payloads are serializable"),
            id: None,
        }
    }

    pub fn ack(id: u64, data: impl Serialize) -> Self {
        Self {
            event: "ack".to_owned(),
            data: serde_json::to_value(data).expect("outbound frame payloads are serializable"),
            id: Some(id),
        }
    }
}

/// What the gateway pushes into a socket's outbound queue.
#[derive(Debug, Clone)]
pub enum SocketMessage {
    Frame(OutboundEnvelope),
    /// Ask the socket task to close the connection.
    Close,
}

// Client → server payloads

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomJoinPayload {
    pub room_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomLeavePayload {
    pub room_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSendPayload {
    pub room_id: String,
    pub content: String,
    #[serde(default)]
    pub reply_to_id: Option<String>,
}

/// Deprecated combined typing frame.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub room_id: String,
    pub is_typing: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingRoomPayload {
    pub room_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceStatusPayload {
    pub status: PresenceStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRoomPayload {
    pub room_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReadPayload {
    pub room_id: String,
    pub message_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceiptsGetPayload {
    pub room_id: String,
    pub message_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRefreshPayload {
    pub refresh_token: String,
}

// Server → client payloads

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSuccess {
    pub user_id: String,
    pub username: String,
    pub socket_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomJoinAck {
    pub room_id: String,
    pub room_name: String,
    pub member_count: u64,
    pub online_users: Vec<crate::service::presence::RoomPresenceMember>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomLeaveAck {
    pub room_id: String,
    pub success: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingAck {
    pub room_id: String,
    pub typing_users: Vec<crate::service::typing::TypingUser>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatAck {
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRoomAck {
    pub room_id: String,
    pub members: Vec<crate::service::presence::RoomPresenceMember>,
    pub total_online: u64,
    pub total_idle: u64,
    pub total_away: u64,
    pub total_busy: u64,
    pub total_offline: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessAck {
    pub success: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceiptsAck {
    pub room_id: String,
    pub message_id: String,
    pub readers: Vec<crate::service::connectors::ReadReceipt>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRefreshAck {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMemberChange {
    pub user_id: String,
    pub username: String,
    pub room_id: String,
    pub action: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_envelope_accepts_missing_data() {
        let envelope: InboundEnvelope = serde_json::from_str(r#"{"event":"heartbeat"}"#).unwrap();
        assert_eq!(envelope.event, "heartbeat");
        assert!(envelope.data.is_null());
        assert_eq!(envelope.id, None);
    }

    #[test]
    fn ack_echoes_the_inbound_id() {
        let ack = OutboundEnvelope::ack(7, HeartbeatAck { timestamp: 1 });
        let json = serde_json::to_value(&ack).unwrap();
        assert_eq!(json["event"], "ack");
        assert_eq!(json["id"], 7);
        assert_eq!(json["data"]["timestamp"], 1);
    }

    #[test]
    fn payload_field_names_are_camel_case() {
        let payload: MessageSendPayload =
            serde_json::from_str(r#"{"roomId":"r1","content":"hi","replyToId":"m9"}"#).unwrap();
        assert_eq!(payload.room_id, "r1");
        assert_eq!(payload.reply_to_id.as_deref(), Some("m9"));
    }
}
