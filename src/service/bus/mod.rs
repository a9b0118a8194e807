mod data;

pub use data::Data;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    gateway::frames::{OutboundEnvelope, RoomMemberChange},
    keyspace::abstraction::ChannelMessage,
    service::{
        presence::{PresenceStatus, PresenceUpdateEvent, UserStatusEvent},
        rooms::RoomEvent,
        typing::TypingUpdateEvent,
    },
    services, Result,
};

pub const CHANNEL_USER_STATUS: &str = "user-status";
pub const CHANNEL_PRESENCE_UPDATE: &str = "presence-update";
pub const CHANNEL_TYPING_UPDATE: &str = "typing-update";
pub const CHANNEL_READ_RECEIPT_UPDATE: &str = "read-receipt-update";
pub const CHANNEL_ROOM_EVENT: &str = "room-event";

/// One read receipt, routed to the message sender only.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceiptEvent {
    pub room_id: String,
    pub message_id: String,
    pub user_id: String,
    pub username: String,
    pub read_at: u64,
}

/// Payload of the `read-receipt-update` channel.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceiptUpdate {
    pub target_user_id: String,
    pub event: ReadReceiptEvent,
}

pub struct Service {
    pub db: &'static dyn Data,
}

impl Service {
    /// Subscribes to all cross-instance channels and starts the
    /// dispatcher delivering events to locally attached sockets.
    pub fn start(&self) {
        let mut receiver = self.db.subscribe(vec![
            CHANNEL_USER_STATUS.to_owned(),
            CHANNEL_PRESENCE_UPDATE.to_owned(),
            CHANNEL_TYPING_UPDATE.to_owned(),
            CHANNEL_READ_RECEIPT_UPDATE.to_owned(),
            CHANNEL_ROOM_EVENT.to_owned(),
        ]);

        tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                dispatch(message);
            }
            debug!("Bus dispatcher stopped");
        });
    }

    pub async fn publish_read_receipt(&self, event: &ReadReceiptUpdate) -> Result<()> {
        self.db.publish_read_receipt(event).await
    }
}

fn dispatch(message: ChannelMessage) {
    match message.channel.as_str() {
        CHANNEL_USER_STATUS => with_payload::<UserStatusEvent>(&message, |event| {
            // Another instance admitted the user; our grace timer is moot
            if event.status != PresenceStatus::Offline
                && services().sessions.cancel_grace(&event.user_id)
            {
                debug!(user_id = event.user_id, "Cancelled local grace timer");
            }
        }),
        CHANNEL_PRESENCE_UPDATE => with_payload::<PresenceUpdateEvent>(&message, |event| {
            services().sessions.emit_to_room(
                &event.room_id,
                &OutboundEnvelope::event("presence:update", &event),
            );
        }),
        CHANNEL_TYPING_UPDATE => with_payload::<TypingUpdateEvent>(&message, |event| {
            services().sessions.emit_to_room(
                &event.room_id,
                &OutboundEnvelope::event("typing:update", &event),
            );
        }),
        CHANNEL_READ_RECEIPT_UPDATE => with_payload::<ReadReceiptUpdate>(&message, |update| {
            // Only the sender's own sockets see the receipt
            services().sessions.emit_to_user(
                &update.target_user_id,
                &OutboundEnvelope::event("message:read", &update.event),
            );
        }),
        CHANNEL_ROOM_EVENT => with_payload::<RoomEvent>(&message, dispatch_room_event),
        channel => warn!(channel, "Event on unexpected channel"),
    }
}

fn dispatch_room_event(event: RoomEvent) {
    let room_id = event.room_id().to_owned();

    let frame = match event {
        RoomEvent::UserJoined {
            user_id,
            username,
            room_id,
            ..
        } => OutboundEnvelope::event(
            "user:joined",
            RoomMemberChange {
                user_id,
                username,
                room_id,
                action: "joined".to_owned(),
            },
        ),
        RoomEvent::UserLeft {
            user_id,
            username,
            room_id,
            ..
        } => OutboundEnvelope::event(
            "user:left",
            RoomMemberChange {
                user_id,
                username,
                room_id,
                action: "left".to_owned(),
            },
        ),
        RoomEvent::MessageNew { message, .. } => OutboundEnvelope::event("message:new", message),
    };

    services().sessions.emit_to_room(&room_id, &frame);
}

fn with_payload<T: serde::de::DeserializeOwned>(message: &ChannelMessage, handle: impl FnOnce(T)) {
    match serde_json::from_str(&message.payload) {
        Ok(event) => handle(event),
        Err(error) => {
            // Dropped, not fatal: the sweep reconciles state later
            warn!(%error, channel = message.channel, "Dropping undecodable bus payload");
        }
    }
}
