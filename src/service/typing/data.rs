use std::time::Duration;

use async_trait::async_trait;

use super::{TypingUpdateEvent, TypingUser};
use crate::Result;

#[async_trait]
pub trait Data: Send + Sync {
    /// Writes the per-user typing key, adds the user to the room typing
    /// set and refreshes the set's TTL so the aggregate cannot outlive
    /// its newest member. Returns the users currently typing.
    async fn start_typing(
        &self,
        room_id: &str,
        user_id: &str,
        username: &str,
        ttl: Duration,
    ) -> Result<Vec<TypingUser>>;

    async fn stop_typing(&self, room_id: &str, user_id: &str) -> Result<()>;

    /// Users in the room typing set whose detail key is still alive.
    /// Members with an expired detail key are removed from the set on the
    /// way out.
    async fn typing_users(&self, room_id: &str) -> Result<Vec<TypingUser>>;

    async fn publish_typing_update(&self, event: &TypingUpdateEvent) -> Result<()>;
}
