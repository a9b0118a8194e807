use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{typing_key, typing_set_key};
use crate::{
    keyspace::{
        abstraction::{Op, Value},
        KeyspaceAdapter,
    },
    service::{
        bus::CHANNEL_TYPING_UPDATE,
        typing::{TypingUpdateEvent, TypingUser},
    },
    utils, Result,
};

/// Value of the per-user typing key.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct TypingRecord {
    username: String,
    timestamp: u64,
}

#[async_trait]
impl crate::service::typing::Data for KeyspaceAdapter {
    async fn start_typing(
        &self,
        room_id: &str,
        user_id: &str,
        username: &str,
        ttl: Duration,
    ) -> Result<Vec<TypingUser>> {
        let set_key = typing_set_key(room_id);
        let record = TypingRecord {
            username: username.to_owned(),
            timestamp: utils::millis_since_unix_epoch(),
        };

        self.engine()
            .pipeline(vec![
                Op::Set {
                    key: typing_key(room_id, user_id),
                    value: Self::encode_json(&record)?,
                    ttl: Some(ttl),
                },
                Op::SAdd {
                    key: set_key.clone(),
                    member: user_id.to_owned(),
                },
                // Refreshed on every start so the aggregate never expires
                // before its newest member
                Op::Expire { key: set_key, ttl },
            ])
            .await?;

        self.typing_users(room_id).await
    }

    async fn stop_typing(&self, room_id: &str, user_id: &str) -> Result<()> {
        self.engine()
            .pipeline(vec![
                Op::Del {
                    key: typing_key(room_id, user_id),
                },
                Op::SRem {
                    key: typing_set_key(room_id),
                    member: user_id.to_owned(),
                },
            ])
            .await?;

        Ok(())
    }

    async fn typing_users(&self, room_id: &str) -> Result<Vec<TypingUser>> {
        let members = self.engine().smembers(&typing_set_key(room_id)).await?;
        if members.is_empty() {
            return Ok(Vec::new());
        }

        let gets = members
            .iter()
            .map(|user_id| Op::Get {
                key: typing_key(room_id, user_id),
            })
            .collect();
        let details = self.engine().pipeline(gets).await?;

        let mut typing_users = Vec::with_capacity(members.len());
        for (user_id, value) in members.into_iter().zip(details) {
            let record: Option<TypingRecord> = match value {
                Value::Text(raw) => serde_json::from_str(&raw).ok(),
                _ => None,
            };

            match record {
                Some(record) => typing_users.push(TypingUser {
                    user_id,
                    username: record.username,
                }),
                None => {
                    // Detail key expired; clean the set opportunistically
                    if let Err(error) = self
                        .engine()
                        .srem(&typing_set_key(room_id), &user_id)
                        .await
                    {
                        warn!(%error, room_id, user_id, "Could not clean typing set");
                    }
                }
            }
        }

        Ok(typing_users)
    }

    async fn publish_typing_update(&self, event: &TypingUpdateEvent) -> Result<()> {
        self.publish_json(CHANNEL_TYPING_UPDATE, event).await
    }
}
