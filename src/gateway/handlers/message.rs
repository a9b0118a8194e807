use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::warn;

use super::ack;
use crate::{
    gateway::frames::{
        MessageReadPayload, MessageSendPayload, ReadReceiptsAck, ReadReceiptsGetPayload,
        SuccessAck,
    },
    service::{
        bus::{ReadReceiptEvent, ReadReceiptUpdate},
        rate_limit::Restriction,
        sessions::Session,
    },
    services, Error, ErrorCode, Result,
};

const MAX_CONTENT_LENGTH: usize = 4000;

/// # `message:send`
///
/// Persists a message and broadcasts `message:new` to the whole room.
///
/// - Content must be 1–4000 characters; a reply must target a message of
///   the same room (the persister verifies that)
/// - The persister also enforces sender membership and non-muted
/// - A shadow-banned sender gets a normal ack but no fan-out
pub async fn send(session: &Arc<Session>, payload: MessageSendPayload) -> Result<JsonValue> {
    if payload.content.is_empty() || payload.content.chars().count() > MAX_CONTENT_LENGTH {
        return Err(Error::BadRequest(
            ErrorCode::SendFailed,
            "Message content must be 1-4000 characters.",
        ));
    }

    services()
        .rate_limit
        .check(Restriction::MessageSend, &session.user_id)
        .await?;
    services()
        .rate_limit
        .check(Restriction::MessageSendRoom, &payload.room_id)
        .await?;

    let message = services()
        .connectors
        .send_message(
            &session.user_id,
            &payload.room_id,
            &payload.content,
            payload.reply_to_id.as_deref(),
        )
        .await?;

    let shadow_banned = services()
        .connectors
        .validate_user(&session.user_id)
        .await
        .map(|validation| validation.shadow_banned)
        .unwrap_or(false);

    if !shadow_banned {
        services()
            .rooms
            .publish_message(&payload.room_id, message.clone())
            .await?;
    }

    ack(message)
}

/// # `message:read`
///
/// Persists a read receipt and routes it to the message sender only.
///
/// - A reader with receipts disabled succeeds silently
/// - Reading your own message never broadcasts
/// - Re-reading the same message keeps one receipt and owes no broadcast
pub async fn mark_read(session: &Arc<Session>, payload: MessageReadPayload) -> Result<JsonValue> {
    services()
        .rate_limit
        .check(Restriction::MessageRead, &session.user_id)
        .await?;

    if !services()
        .connectors
        .read_receipts_enabled(&session.user_id)
        .await?
    {
        return ack(SuccessAck { success: true });
    }

    let result = services()
        .connectors
        .mark_message_as_read(&session.user_id, &payload.room_id, &payload.message_id)
        .await?;

    if result.sender_id != session.user_id && !result.duplicate {
        let update = ReadReceiptUpdate {
            target_user_id: result.sender_id,
            event: ReadReceiptEvent {
                room_id: payload.room_id,
                message_id: payload.message_id,
                user_id: session.user_id.clone(),
                username: session.username.clone(),
                read_at: result.read_at,
            },
        };

        if let Err(error) = services().bus.publish_read_receipt(&update).await {
            // Receipt is persisted; delivery is best-effort
            warn!(%error, "Could not publish read receipt");
        }
    }

    ack(SuccessAck { success: true })
}

/// # `read_receipts:get`
///
/// Readers of a message, excluding users who disabled receipts. A user
/// without the setting counts as enabled.
pub async fn read_receipts(
    session: &Arc<Session>,
    payload: ReadReceiptsGetPayload,
) -> Result<JsonValue> {
    services()
        .rate_limit
        .check(Restriction::ReadReceiptsGet, &session.user_id)
        .await?;

    let readers = services()
        .connectors
        .get_read_receipts(&session.user_id, &payload.room_id, &payload.message_id)
        .await?;

    ack(ReadReceiptsAck {
        room_id: payload.room_id,
        message_id: payload.message_id,
        readers,
    })
}
