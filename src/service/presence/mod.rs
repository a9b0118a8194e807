mod data;

use std::time::Duration;

pub use data::Data;
use serde::{Deserialize, Serialize};
use tokio::time::interval;
use tracing::{debug, error, warn};

use crate::{services, utils, Result};

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PresenceStatus {
    Online,
    Idle,
    Away,
    Busy,
    Offline,
}

/// Global presence record stored under `presence:{userId}`.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: String,
    pub status: PresenceStatus,
    pub last_seen_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rooms: Vec<String>,
}

/// Per-(room, user) presence detail stored under
/// `room_presence:{roomId}:{userId}`.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomPresenceEntry {
    pub status: PresenceStatus,
    pub last_seen_at: u64,
}

/// One member row of a `presence:room` response.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomPresenceMember {
    pub user_id: String,
    pub status: PresenceStatus,
    pub last_seen_at: u64,
}

/// Payload of the `user-status` channel.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatusEvent {
    pub user_id: String,
    pub status: PresenceStatus,
    pub timestamp: u64,
}

/// Payload of the `presence-update` channel.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdateEvent {
    pub room_id: String,
    pub user_id: String,
    pub status: PresenceStatus,
    pub timestamp: u64,
}

pub struct Service {
    pub db: &'static dyn Data,
}

impl Service {
    pub fn build(db: &'static dyn Data) -> Result<Self> {
        Ok(Self { db })
    }

    /// Writes the presence record with a fresh `last_seen_at`, indexes the
    /// user in the online sorted set and announces the status.
    #[tracing::instrument(skip(self))]
    pub async fn set_online(
        &self,
        user_id: &str,
        status: PresenceStatus,
        device_id: Option<String>,
    ) -> Result<()> {
        let now = utils::millis_since_unix_epoch();
        let rooms = services().rooms.user_rooms(user_id).await.unwrap_or_else(|error| {
            warn!(%error, "Could not read room index while going online");
            Vec::new()
        });

        let record = PresenceRecord {
            user_id: user_id.to_owned(),
            status,
            last_seen_at: now,
            device_id,
            rooms,
        };

        // The keyspace write happens before the publish; consumers treat
        // the event as a hint and re-read when exact state matters
        self.db
            .set_presence(&record, services().globals.presence_ttl())
            .await?;
        self.db
            .publish_user_status(&UserStatusEvent {
                user_id: user_id.to_owned(),
                status,
                timestamp: now,
            })
            .await?;

        Ok(())
    }

    /// Flips the user OFFLINE everywhere: record, online sorted set and
    /// every room found through the user→rooms index.
    #[tracing::instrument(skip(self))]
    pub async fn set_offline(&self, user_id: &str) -> Result<()> {
        let now = utils::millis_since_unix_epoch();

        let mut record = self
            .db
            .get_presence(user_id)
            .await?
            .unwrap_or_else(|| PresenceRecord {
                user_id: user_id.to_owned(),
                status: PresenceStatus::Offline,
                last_seen_at: now,
                device_id: None,
                rooms: Vec::new(),
            });
        record.status = PresenceStatus::Offline;
        record.last_seen_at = now;

        self.db
            .set_presence(&record, services().globals.presence_ttl())
            .await?;

        for room_id in services().rooms.user_rooms(user_id).await? {
            // One broken room must not keep the user half-online elsewhere
            if let Err(error) = self.db.remove_room_presence(&room_id, user_id).await {
                warn!(%error, room_id, "Could not clear room presence");
            }
        }

        self.db
            .publish_user_status(&UserStatusEvent {
                user_id: user_id.to_owned(),
                status: PresenceStatus::Offline,
                timestamp: now,
            })
            .await?;

        Ok(())
    }

    /// Refreshes `last_seen_at`, promoting OFFLINE users back to ONLINE.
    /// Returns the status in effect afterwards.
    pub async fn heartbeat(&self, user_id: &str) -> Result<PresenceStatus> {
        let now = utils::millis_since_unix_epoch();

        let mut record = self
            .db
            .get_presence(user_id)
            .await?
            .unwrap_or_else(|| PresenceRecord {
                user_id: user_id.to_owned(),
                status: PresenceStatus::Online,
                last_seen_at: now,
                device_id: None,
                rooms: Vec::new(),
            });

        let promoted = record.status == PresenceStatus::Offline;
        if promoted {
            record.status = PresenceStatus::Online;
        }
        record.last_seen_at = now;

        self.db
            .set_presence(&record, services().globals.presence_ttl())
            .await?;

        if promoted {
            self.db
                .publish_user_status(&UserStatusEvent {
                    user_id: user_id.to_owned(),
                    status: PresenceStatus::Online,
                    timestamp: now,
                })
                .await?;
        }

        Ok(record.status)
    }

    #[tracing::instrument(skip(self))]
    pub async fn set_presence_in_room(
        &self,
        user_id: &str,
        room_id: &str,
        status: PresenceStatus,
    ) -> Result<()> {
        let now = utils::millis_since_unix_epoch();
        let entry = RoomPresenceEntry {
            status,
            last_seen_at: now,
        };

        self.db
            .set_room_presence(room_id, user_id, &entry, services().globals.presence_ttl())
            .await?;
        self.db
            .publish_presence_update(&PresenceUpdateEvent {
                room_id: room_id.to_owned(),
                user_id: user_id.to_owned(),
                status,
                timestamp: now,
            })
            .await?;

        Ok(())
    }

    /// Members of one room seen within `threshold_ms`, with their status
    /// re-derived from `last_seen_at`. A member whose detail row already
    /// expired counts as ONLINE right now.
    pub async fn get_room_presence(
        &self,
        room_id: &str,
        threshold_ms: u64,
        limit: usize,
    ) -> Result<Vec<RoomPresenceMember>> {
        let now = utils::millis_since_unix_epoch();
        let min_score = now.saturating_sub(threshold_ms);
        let safe_limit = std::cmp::min(limit, services().globals.room_presence_limit());

        let rows = self
            .db
            .room_presence_page(room_id, min_score, safe_limit)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(user_id, entry)| match entry {
                Some(entry) => RoomPresenceMember {
                    user_id,
                    status: self.derived_status(entry.status, entry.last_seen_at, now),
                    last_seen_at: entry.last_seen_at,
                },
                None => RoomPresenceMember {
                    user_id,
                    status: PresenceStatus::Online,
                    last_seen_at: now,
                },
            })
            .collect())
    }

    /// Applies the status lattice: ONLINE decays to IDLE and anything
    /// decays to OFFLINE as `last_seen_at` ages. AWAY and BUSY are user
    /// intent and survive until the offline cutoff.
    pub fn derived_status(
        &self,
        stored: PresenceStatus,
        last_seen_at: u64,
        now: u64,
    ) -> PresenceStatus {
        let ago = now.saturating_sub(last_seen_at);
        let globals = &services().globals;

        if stored == PresenceStatus::Offline || ago >= globals.presence_offline_timeout_ms() {
            PresenceStatus::Offline
        } else if stored == PresenceStatus::Online && ago >= globals.presence_idle_timeout_ms() {
            PresenceStatus::Idle
        } else {
            stored
        }
    }

    /// Drops the per-(room, user) presence entry, used by explicit
    /// `room:leave`.
    pub async fn clear_room_presence(&self, user_id: &str, room_id: &str) -> Result<()> {
        self.db.remove_room_presence(room_id, user_id).await
    }

    pub async fn start_disconnect_grace(&self, user_id: &str, grace: Duration) -> Result<()> {
        // Whole seconds, rounded up, never below one
        let ttl = Duration::from_secs(std::cmp::max(
            1,
            (grace.as_millis() as u64).div_ceil(1000),
        ));
        self.db.set_grace_marker(user_id, ttl).await
    }

    /// Returns true iff the marker still existed, i.e. the caller claimed
    /// the pending offline transition.
    pub async fn cancel_disconnect_grace(&self, user_id: &str) -> Result<bool> {
        self.db.clear_grace_marker(user_id).await
    }

    /// Cancels any pending offlining and re-asserts the user everywhere:
    /// global ONLINE plus per-room presence for every indexed room. One
    /// failing room does not stop the others.
    #[tracing::instrument(skip(self))]
    pub async fn handle_reconnection(&self, user_id: &str, device_id: Option<String>) -> Result<()> {
        self.cancel_disconnect_grace(user_id).await?;
        self.set_online(user_id, PresenceStatus::Online, device_id)
            .await?;

        for room_id in services().rooms.user_rooms(user_id).await? {
            if let Err(error) = self
                .set_presence_in_room(user_id, &room_id, PresenceStatus::Online)
                .await
            {
                error!(%error, room_id, "Could not re-assert room presence");
            }
        }

        Ok(())
    }

    /// Spawns the periodic sweep that drops users idle past the offline
    /// cutoff from the online and room sorted sets and tells the
    /// persistence service about them.
    pub fn start_sweep_task(&self) {
        let timer_interval =
            Duration::from_secs(services().globals.config.cleanup_second_interval as u64);

        tokio::spawn(async move {
            let mut i = interval(timer_interval);

            loop {
                i.tick().await;
                debug!("presence sweep: Timer ticked");

                if let Err(error) = services().presence.sweep_stale().await {
                    error!(%error, "presence sweep: Errored");
                }
            }
        });
    }

    /// One sweep pass over the online sorted set. A user whose score
    /// predates the offline cutoff is dropped from the online and room
    /// sets and the OFFLINE transition is persisted.
    pub async fn sweep_stale(&self) -> Result<()> {
        let now = utils::millis_since_unix_epoch();
        let cutoff = now.saturating_sub(services().globals.presence_offline_timeout_ms());

        for user_id in self.db.stale_online_users(cutoff).await? {
            debug!(user_id, "presence sweep: Dropping stale user");

            for room_id in services().rooms.user_rooms(&user_id).await? {
                if let Err(error) = self.db.prune_room_presence(&room_id, cutoff).await {
                    warn!(%error, room_id, "presence sweep: Could not prune room set");
                }
                if let Err(error) = self.db.remove_room_presence(&room_id, &user_id).await {
                    warn!(%error, room_id, "presence sweep: Could not clear room presence");
                }
            }

            self.db.remove_from_online(&user_id).await?;

            if let Err(error) = services().connectors.set_user_offline(&user_id).await {
                warn!(%error, user_id, "presence sweep: Could not persist OFFLINE");
            }
        }

        let sessions = &services().sessions;
        debug!(
            sockets = sessions.socket_count(),
            users = sessions.local_user_count(),
            "presence sweep: Local connection stats"
        );

        Ok(())
    }
}
