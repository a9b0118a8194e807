mod data;

use std::time::Duration;

pub use data::Data;
use futures_util::{stream::FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, time::sleep};
use tracing::warn;

use crate::{services, utils, Error, Result};

/// Grace on top of the TTL before the expiry re-publish fires, so the
/// keyspace has definitely dropped the keys by the time we read them.
const EXPIRY_SLACK: Duration = Duration::from_millis(300);

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingUser {
    pub user_id: String,
    pub username: String,
}

/// Payload of the `typing-update` channel. Each publish carries the full
/// current list, so consumers may coalesce by room.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingUpdateEvent {
    pub room_id: String,
    pub typing_users: Vec<TypingUser>,
    pub timestamp: u64,
}

pub struct Service {
    pub db: &'static dyn Data,

    // Expiry re-publish timers
    timer_sender: mpsc::UnboundedSender<String>,
}

impl Service {
    /// Builds the service and starts the expiry re-publish task.
    pub fn build(db: &'static dyn Data) -> Result<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let service = Self {
            db,
            timer_sender: sender,
        };

        service.typing_maintain(receiver);

        Ok(service)
    }

    /// Marks the user as typing and announces the new list. Returns the
    /// users typing after the call.
    pub async fn start(
        &self,
        user_id: &str,
        room_id: &str,
        username: &str,
    ) -> Result<Vec<TypingUser>> {
        let typing_users = self
            .db
            .start_typing(room_id, user_id, username, services().globals.typing_ttl())
            .await?;

        self.publish(room_id, typing_users.clone()).await?;
        self.spawn_timer(room_id)?;

        Ok(typing_users)
    }

    pub async fn stop(&self, user_id: &str, room_id: &str) -> Result<Vec<TypingUser>> {
        self.db.stop_typing(room_id, user_id).await?;

        let typing_users = self.db.typing_users(room_id).await?;
        self.publish(room_id, typing_users.clone()).await?;

        Ok(typing_users)
    }

    pub async fn get_typing_users(&self, room_id: &str) -> Result<Vec<TypingUser>> {
        self.db.typing_users(room_id).await
    }

    /// Used on the offline transition. Typing is best-effort, so each
    /// failing room is logged and skipped.
    pub async fn remove_from_all_rooms(&self, user_id: &str) -> Result<()> {
        for room_id in services().rooms.user_rooms(user_id).await? {
            if let Err(error) = self.stop(user_id, &room_id).await {
                warn!(%error, room_id, "Could not stop typing during offline transition");
            }
        }

        Ok(())
    }

    async fn publish(&self, room_id: &str, typing_users: Vec<TypingUser>) -> Result<()> {
        self.db
            .publish_typing_update(&TypingUpdateEvent {
                room_id: room_id.to_owned(),
                typing_users,
                timestamp: utils::millis_since_unix_epoch(),
            })
            .await
    }

    /// Spawns the task that re-publishes a room's typing list once the
    /// TTL has passed, so watchers see lists empty out without an
    /// explicit stop.
    fn typing_maintain(&self, mut timer_receiver: mpsc::UnboundedReceiver<String>) {
        tokio::spawn(async move {
            let mut timers = FuturesUnordered::new();

            loop {
                tokio::select! {
                    Some(room_id) = timers.next() => {
                        let room_id: String = room_id;
                        let typing = &services().typing;
                        let typing_users = match typing.db.typing_users(&room_id).await {
                            Ok(users) => users,
                            Err(error) => {
                                warn!(%error, room_id, "Could not read typing users after expiry");
                                continue;
                            }
                        };

                        if let Err(error) = typing.publish(&room_id, typing_users).await {
                            warn!(%error, room_id, "Could not publish typing expiry update");
                        }
                    }
                    room_id = timer_receiver.recv() => {
                        let Some(room_id) = room_id else { return; };
                        let delay = services().globals.typing_ttl() + EXPIRY_SLACK;
                        timers.push(create_typing_timer(delay, room_id));
                    }
                }
            }
        });
    }

    fn spawn_timer(&self, room_id: &str) -> Result<()> {
        self.timer_sender
            .send(room_id.to_owned())
            .map_err(|_| Error::bad_keyspace("Typing timer channel closed"))?;

        Ok(())
    }
}

async fn create_typing_timer(duration: Duration, room_id: String) -> String {
    sleep(duration).await;

    room_id
}
