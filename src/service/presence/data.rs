use std::time::Duration;

use async_trait::async_trait;

use super::{PresenceRecord, PresenceUpdateEvent, RoomPresenceEntry, UserStatusEvent};
use crate::Result;

#[async_trait]
pub trait Data: Send + Sync {
    /// Writes the presence record and keeps the online sorted set
    /// consistent with it: OFFLINE records are removed from the set,
    /// everything else is (re-)indexed at `last_seen_at`.
    async fn set_presence(&self, record: &PresenceRecord, ttl: Duration) -> Result<()>;

    async fn get_presence(&self, user_id: &str) -> Result<Option<PresenceRecord>>;

    /// Users in the online sorted set whose score is at or below `cutoff_ms`.
    async fn stale_online_users(&self, cutoff_ms: u64) -> Result<Vec<String>>;

    async fn remove_from_online(&self, user_id: &str) -> Result<()>;

    async fn set_room_presence(
        &self,
        room_id: &str,
        user_id: &str,
        entry: &RoomPresenceEntry,
        ttl: Duration,
    ) -> Result<()>;

    /// Members of the room presence sorted set scoring at least
    /// `min_score`, each with their detail row. The detail GETs run in one
    /// pipeline; a missing row yields `None`.
    async fn room_presence_page(
        &self,
        room_id: &str,
        min_score: u64,
        limit: usize,
    ) -> Result<Vec<(String, Option<RoomPresenceEntry>)>>;

    async fn remove_room_presence(&self, room_id: &str, user_id: &str) -> Result<()>;

    /// Drops sorted-set entries older than `cutoff_ms` from one room.
    async fn prune_room_presence(&self, room_id: &str, cutoff_ms: u64) -> Result<u64>;

    async fn set_grace_marker(&self, user_id: &str, ttl: Duration) -> Result<()>;

    /// Deletes the marker, reporting whether it still existed. The caller
    /// that sees `true` owns the offline transition.
    async fn clear_grace_marker(&self, user_id: &str) -> Result<bool>;

    async fn publish_user_status(&self, event: &UserStatusEvent) -> Result<()>;

    async fn publish_presence_update(&self, event: &PresenceUpdateEvent) -> Result<()>;
}
