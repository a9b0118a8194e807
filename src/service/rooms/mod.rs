mod data;

pub use data::Data;
use serde::{Deserialize, Serialize};

use crate::{service::connectors::SavedMessage, services, utils, Result};

/// Payload of the `room-event` channel. Every room broadcast travels this
/// channel and is fanned out by the bus, so each event has exactly one
/// delivery path per instance.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum RoomEvent {
    #[serde(rename = "user:joined", rename_all = "camelCase")]
    UserJoined {
        room_id: String,
        user_id: String,
        username: String,
        timestamp: u64,
    },
    #[serde(rename = "user:left", rename_all = "camelCase")]
    UserLeft {
        room_id: String,
        user_id: String,
        username: String,
        timestamp: u64,
    },
    #[serde(rename = "message:new", rename_all = "camelCase")]
    MessageNew {
        room_id: String,
        message: SavedMessage,
    },
}

impl RoomEvent {
    pub fn room_id(&self) -> &str {
        match self {
            Self::UserJoined { room_id, .. }
            | Self::UserLeft { room_id, .. }
            | Self::MessageNew { room_id, .. } => room_id,
        }
    }
}

pub struct Service {
    pub db: &'static dyn Data,
}

impl Service {
    #[tracing::instrument(skip(self))]
    pub async fn add_user_to_room(
        &self,
        user_id: &str,
        room_id: &str,
        username: &str,
    ) -> Result<()> {
        self.db.add_user_to_room(user_id, room_id).await?;
        self.db
            .publish_room_event(&RoomEvent::UserJoined {
                room_id: room_id.to_owned(),
                user_id: user_id.to_owned(),
                username: username.to_owned(),
                timestamp: utils::millis_since_unix_epoch(),
            })
            .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn remove_user_from_room(
        &self,
        user_id: &str,
        room_id: &str,
        username: &str,
    ) -> Result<()> {
        self.db.remove_user_from_room(user_id, room_id).await?;
        self.db
            .publish_room_event(&RoomEvent::UserLeft {
                room_id: room_id.to_owned(),
                user_id: user_id.to_owned(),
                username: username.to_owned(),
                timestamp: utils::millis_since_unix_epoch(),
            })
            .await
    }

    pub async fn publish_message(&self, room_id: &str, message: SavedMessage) -> Result<()> {
        self.db
            .publish_room_event(&RoomEvent::MessageNew {
                room_id: room_id.to_owned(),
                message,
            })
            .await
    }

    pub async fn room_users(&self, room_id: &str) -> Result<Vec<String>> {
        self.db.room_users(room_id).await
    }

    pub async fn user_rooms(&self, user_id: &str) -> Result<Vec<String>> {
        self.db.user_rooms(user_id).await
    }

    /// Connected users of the room that are also indexed in the global
    /// online sorted set with a recent enough score.
    pub async fn online_users_in_room(&self, room_id: &str) -> Result<Vec<String>> {
        let members = self.db.room_users(room_id).await?;
        if members.is_empty() {
            return Ok(Vec::new());
        }

        let cutoff = utils::millis_since_unix_epoch()
            .saturating_sub(services().globals.presence_offline_timeout_ms());
        let scores = self.db.online_scores(&members).await?;

        Ok(members
            .into_iter()
            .zip(scores)
            .filter(|(_, score)| score.is_some_and(|score| score >= cutoff))
            .map(|(user, _)| user)
            .collect())
    }
}
