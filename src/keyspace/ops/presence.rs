use std::time::Duration;

use async_trait::async_trait;

use super::{
    grace_key, presence_key, room_presence_key, room_presence_set_key, ONLINE_KEY,
};
use crate::{
    keyspace::{
        abstraction::{Op, Value},
        KeyspaceAdapter,
    },
    service::{
        bus::{CHANNEL_PRESENCE_UPDATE, CHANNEL_USER_STATUS},
        presence::{
            PresenceRecord, PresenceStatus, PresenceUpdateEvent, RoomPresenceEntry,
            UserStatusEvent,
        },
    },
    Result,
};

#[async_trait]
impl crate::service::presence::Data for KeyspaceAdapter {
    async fn set_presence(&self, record: &PresenceRecord, ttl: Duration) -> Result<()> {
        let index_op = if record.status == PresenceStatus::Offline {
            Op::ZRem {
                key: ONLINE_KEY.to_owned(),
                member: record.user_id.clone(),
            }
        } else {
            Op::ZAdd {
                key: ONLINE_KEY.to_owned(),
                member: record.user_id.clone(),
                score: record.last_seen_at,
            }
        };

        self.engine()
            .pipeline(vec![
                Op::Set {
                    key: presence_key(&record.user_id),
                    value: Self::encode_json(record)?,
                    ttl: Some(ttl),
                },
                index_op,
            ])
            .await?;

        Ok(())
    }

    async fn get_presence(&self, user_id: &str) -> Result<Option<PresenceRecord>> {
        self.get_json(&presence_key(user_id)).await
    }

    async fn stale_online_users(&self, cutoff_ms: u64) -> Result<Vec<String>> {
        self.engine()
            .zrangebyscore(ONLINE_KEY, 0, Some(cutoff_ms), None)
            .await
    }

    async fn remove_from_online(&self, user_id: &str) -> Result<()> {
        self.engine().zrem(ONLINE_KEY, user_id).await?;
        Ok(())
    }

    async fn set_room_presence(
        &self,
        room_id: &str,
        user_id: &str,
        entry: &RoomPresenceEntry,
        ttl: Duration,
    ) -> Result<()> {
        let set_key = room_presence_set_key(room_id);

        self.engine()
            .pipeline(vec![
                Op::Set {
                    key: room_presence_key(room_id, user_id),
                    value: Self::encode_json(entry)?,
                    ttl: Some(ttl),
                },
                Op::ZAdd {
                    key: set_key.clone(),
                    member: user_id.to_owned(),
                    score: entry.last_seen_at,
                },
                // Keep the aggregate alive exactly as long as its members
                Op::Expire { key: set_key, ttl },
            ])
            .await?;

        Ok(())
    }

    async fn room_presence_page(
        &self,
        room_id: &str,
        min_score: u64,
        limit: usize,
    ) -> Result<Vec<(String, Option<RoomPresenceEntry>)>> {
        let members = self
            .engine()
            .zrangebyscore(&room_presence_set_key(room_id), min_score, None, Some(limit))
            .await?;

        if members.is_empty() {
            return Ok(Vec::new());
        }

        let gets = members
            .iter()
            .map(|user_id| Op::Get {
                key: room_presence_key(room_id, user_id),
            })
            .collect();
        let details = self.engine().pipeline(gets).await?;

        Ok(members
            .into_iter()
            .zip(details)
            .map(|(user_id, value)| {
                let entry = match value {
                    Value::Text(raw) => serde_json::from_str(&raw).ok(),
                    _ => None,
                };
                (user_id, entry)
            })
            .collect())
    }

    async fn remove_room_presence(&self, room_id: &str, user_id: &str) -> Result<()> {
        self.engine()
            .pipeline(vec![
                Op::Del {
                    key: room_presence_key(room_id, user_id),
                },
                Op::ZRem {
                    key: room_presence_set_key(room_id),
                    member: user_id.to_owned(),
                },
            ])
            .await?;

        Ok(())
    }

    async fn prune_room_presence(&self, room_id: &str, cutoff_ms: u64) -> Result<u64> {
        self.engine()
            .zremrangebyscore(&room_presence_set_key(room_id), 0, cutoff_ms)
            .await
    }

    async fn set_grace_marker(&self, user_id: &str, ttl: Duration) -> Result<()> {
        self.engine().set(&grace_key(user_id), "1", Some(ttl)).await
    }

    async fn clear_grace_marker(&self, user_id: &str) -> Result<bool> {
        self.engine().del(&grace_key(user_id)).await
    }

    async fn publish_user_status(&self, event: &UserStatusEvent) -> Result<()> {
        self.publish_json(CHANNEL_USER_STATUS, event).await
    }

    async fn publish_presence_update(&self, event: &PresenceUpdateEvent) -> Result<()> {
        self.publish_json(CHANNEL_PRESENCE_UPDATE, event).await
    }
}
