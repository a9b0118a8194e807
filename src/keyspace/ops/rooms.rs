use async_trait::async_trait;

use super::{room_users_key, user_rooms_key, ONLINE_KEY};
use crate::{
    keyspace::{abstraction::Op, KeyspaceAdapter},
    service::{bus::CHANNEL_ROOM_EVENT, rooms::RoomEvent},
    Result,
};

#[async_trait]
impl crate::service::rooms::Data for KeyspaceAdapter {
    async fn add_user_to_room(&self, user_id: &str, room_id: &str) -> Result<()> {
        self.engine()
            .pipeline(vec![
                Op::SAdd {
                    key: room_users_key(room_id),
                    member: user_id.to_owned(),
                },
                Op::SAdd {
                    key: user_rooms_key(user_id),
                    member: room_id.to_owned(),
                },
            ])
            .await?;

        Ok(())
    }

    async fn remove_user_from_room(&self, user_id: &str, room_id: &str) -> Result<()> {
        self.engine()
            .pipeline(vec![
                Op::SRem {
                    key: room_users_key(room_id),
                    member: user_id.to_owned(),
                },
                Op::SRem {
                    key: user_rooms_key(user_id),
                    member: room_id.to_owned(),
                },
            ])
            .await?;

        Ok(())
    }

    async fn room_users(&self, room_id: &str) -> Result<Vec<String>> {
        self.engine().smembers(&room_users_key(room_id)).await
    }

    async fn user_rooms(&self, user_id: &str) -> Result<Vec<String>> {
        self.engine().smembers(&user_rooms_key(user_id)).await
    }

    async fn online_scores(&self, users: &[String]) -> Result<Vec<Option<u64>>> {
        let ops = users
            .iter()
            .map(|user_id| Op::ZScore {
                key: ONLINE_KEY.to_owned(),
                member: user_id.clone(),
            })
            .collect();

        let values = self.engine().pipeline(ops).await?;
        Ok(values
            .into_iter()
            .map(|value| value.as_int().map(|score| score as u64))
            .collect())
    }

    async fn publish_room_event(&self, event: &RoomEvent) -> Result<()> {
        self.publish_json(CHANNEL_ROOM_EVENT, event).await
    }
}
