use async_trait::async_trait;

use super::RoomEvent;
use crate::Result;

#[async_trait]
pub trait Data: Send + Sync {
    /// Inserts into both directions of the membership cache
    /// (room→users and user→rooms).
    async fn add_user_to_room(&self, user_id: &str, room_id: &str) -> Result<()>;

    async fn remove_user_from_room(&self, user_id: &str, room_id: &str) -> Result<()>;

    async fn room_users(&self, room_id: &str) -> Result<Vec<String>>;

    async fn user_rooms(&self, user_id: &str) -> Result<Vec<String>>;

    /// Scores of `users` in the online sorted set, in one pipeline.
    /// `None` means the user is not indexed as online.
    async fn online_scores(&self, users: &[String]) -> Result<Vec<Option<u64>>>;

    async fn publish_room_event(&self, event: &RoomEvent) -> Result<()>;
}
