//! In-process connector used by dev runs and the test suites. Models the
//! persistence contracts closely enough to exercise the gateway: room
//! capacity and auto-join, muting, reply validation, receipt dedup and
//! refresh-token families with reuse detection.

use std::{
    collections::{HashMap, HashSet},
    sync::Mutex as StdMutex,
};

use async_trait::async_trait;

use super::{
    contract_error, AccessClaims, Connector, MarkReadResult, ReadReceipt, RoomAccess,
    SavedMessage, TokenPair, UserValidation,
};
use crate::{utils, ErrorCode, Result};

const ACCESS_TOKEN_LIFETIME_SEC: u64 = 15 * 60;

#[derive(Clone)]
struct UserRecord {
    username: String,
    is_active: bool,
    shadow_banned: bool,
    read_receipts_enabled: bool,
}

#[derive(Clone)]
struct RoomRecord {
    name: String,
    members: HashSet<String>,
    muted: HashSet<String>,
    max_members: usize,
    public: bool,
}

#[derive(Clone)]
struct MessageRecord {
    room_id: String,
    sender_id: String,
    content: String,
    reply_to_id: Option<String>,
    created_at: u64,
}

#[derive(Clone)]
struct RefreshRecord {
    family_id: String,
    user_id: String,
    device_id: Option<String>,
    used: bool,
}

#[derive(Default)]
struct State {
    users: HashMap<String, UserRecord>,
    rooms: HashMap<String, RoomRecord>,
    messages: HashMap<String, MessageRecord>,
    // (room_id, message_id) -> user_id -> read_at
    receipts: HashMap<(String, String), HashMap<String, u64>>,
    access_tokens: HashMap<String, (String, Option<String>)>,
    refresh_tokens: HashMap<String, RefreshRecord>,
    revoked_families: HashSet<String>,
    offline_marked: HashSet<String>,
}

#[derive(Default)]
pub struct MemoryConnector {
    state: StdMutex<State>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("memory connector poisoned")
    }

    pub fn add_user(&self, user_id: &str, username: &str) {
        self.state().users.insert(
            user_id.to_owned(),
            UserRecord {
                username: username.to_owned(),
                is_active: true,
                shadow_banned: false,
                read_receipts_enabled: true,
            },
        );
    }

    pub fn deactivate_user(&self, user_id: &str) {
        if let Some(user) = self.state().users.get_mut(user_id) {
            user.is_active = false;
        }
    }

    pub fn shadow_ban_user(&self, user_id: &str) {
        if let Some(user) = self.state().users.get_mut(user_id) {
            user.shadow_banned = true;
        }
    }

    pub fn set_read_receipts_enabled(&self, user_id: &str, enabled: bool) {
        if let Some(user) = self.state().users.get_mut(user_id) {
            user.read_receipts_enabled = enabled;
        }
    }

    pub fn add_room(&self, room_id: &str, name: &str, public: bool, max_members: usize) {
        self.state().rooms.insert(
            room_id.to_owned(),
            RoomRecord {
                name: name.to_owned(),
                members: HashSet::new(),
                muted: HashSet::new(),
                max_members,
                public,
            },
        );
    }

    pub fn add_room_member(&self, room_id: &str, user_id: &str) {
        if let Some(room) = self.state().rooms.get_mut(room_id) {
            room.members.insert(user_id.to_owned());
        }
    }

    pub fn mute_room_member(&self, room_id: &str, user_id: &str) {
        if let Some(room) = self.state().rooms.get_mut(room_id) {
            room.muted.insert(user_id.to_owned());
        }
    }

    /// Issues an access token plus the root of a fresh refresh family.
    pub fn issue_tokens(&self, user_id: &str, device_id: Option<&str>) -> TokenPair {
        let mut state = self.state();

        let access_token = utils::random_string(32);
        state.access_tokens.insert(
            access_token.clone(),
            (user_id.to_owned(), device_id.map(ToOwned::to_owned)),
        );

        let refresh_token = utils::random_string(32);
        let family_id = utils::random_string(12);
        state.refresh_tokens.insert(
            refresh_token.clone(),
            RefreshRecord {
                family_id,
                user_id: user_id.to_owned(),
                device_id: device_id.map(ToOwned::to_owned),
                used: false,
            },
        );

        TokenPair {
            access_token,
            refresh_token,
            expires_in_sec: ACCESS_TOKEN_LIFETIME_SEC,
        }
    }

    pub fn user_marked_offline(&self, user_id: &str) -> bool {
        self.state().offline_marked.contains(user_id)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn verify_access_token(&self, token: &str) -> Result<AccessClaims> {
        let state = self.state();
        let (user_id, device_id) = state
            .access_tokens
            .get(token)
            .cloned()
            .ok_or_else(|| contract_error(ErrorCode::Unauthorized, "Access token is invalid."))?;

        let username = state
            .users
            .get(&user_id)
            .map(|user| user.username.clone())
            .unwrap_or_else(|| user_id.clone());

        Ok(AccessClaims {
            user_id,
            username,
            device_id,
        })
    }

    async fn validate_user(&self, user_id: &str) -> Result<UserValidation> {
        let state = self.state();
        let user = state
            .users
            .get(user_id)
            .ok_or_else(|| contract_error(ErrorCode::NotFound, "User does not exist."))?;

        Ok(UserValidation {
            is_active: user.is_active,
            shadow_banned: user.shadow_banned,
        })
    }

    async fn refresh_tokens(
        &self,
        refresh_token: &str,
        device_id: Option<&str>,
    ) -> Result<TokenPair> {
        let mut state = self.state();

        let record = state
            .refresh_tokens
            .get(refresh_token)
            .cloned()
            .ok_or_else(|| contract_error(ErrorCode::Unauthorized, "Refresh token is unknown."))?;

        // Reuse of any family member revokes the whole family
        if record.used || state.revoked_families.contains(&record.family_id) {
            state.revoked_families.insert(record.family_id.clone());
            return Err(contract_error(
                ErrorCode::Unauthorized,
                "Refresh token was already used; the family is revoked.",
            ));
        }

        if let Some(record) = state.refresh_tokens.get_mut(refresh_token) {
            record.used = true;
        }

        let access_token = utils::random_string(32);
        state.access_tokens.insert(
            access_token.clone(),
            (record.user_id.clone(), record.device_id.clone()),
        );

        let next_refresh = utils::random_string(32);
        state.refresh_tokens.insert(
            next_refresh.clone(),
            RefreshRecord {
                family_id: record.family_id,
                user_id: record.user_id,
                device_id: device_id
                    .map(ToOwned::to_owned)
                    .or(record.device_id.clone()),
                used: false,
            },
        );

        Ok(TokenPair {
            access_token,
            refresh_token: next_refresh,
            expires_in_sec: ACCESS_TOKEN_LIFETIME_SEC,
        })
    }

    async fn room_access(&self, user_id: &str, room_id: &str) -> Result<RoomAccess> {
        let mut state = self.state();

        if !state.users.contains_key(user_id) {
            return Err(contract_error(ErrorCode::NotFound, "User does not exist."));
        }

        let room = state
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| contract_error(ErrorCode::NotFound, "Room does not exist."))?;

        let mut is_member = room.members.contains(user_id);
        if !is_member {
            if !room.public {
                return Err(contract_error(
                    ErrorCode::Forbidden,
                    "You are not a member of this room.",
                ));
            }
            if room.members.len() >= room.max_members {
                return Err(contract_error(ErrorCode::Forbidden, "Room is full."));
            }
            room.members.insert(user_id.to_owned());
            is_member = true;
        }

        Ok(RoomAccess {
            id: room_id.to_owned(),
            name: room.name.clone(),
            member_count: room.members.len() as u64,
            is_member,
        })
    }

    async fn send_message(
        &self,
        user_id: &str,
        room_id: &str,
        content: &str,
        reply_to_id: Option<&str>,
    ) -> Result<SavedMessage> {
        let mut state = self.state();

        let sender_name = state
            .users
            .get(user_id)
            .map(|user| user.username.clone())
            .ok_or_else(|| contract_error(ErrorCode::NotFound, "User does not exist."))?;

        let room = state
            .rooms
            .get(room_id)
            .ok_or_else(|| contract_error(ErrorCode::NotFound, "Room does not exist."))?;
        if !room.members.contains(user_id) {
            return Err(contract_error(
                ErrorCode::Forbidden,
                "You are not a member of this room.",
            ));
        }
        if room.muted.contains(user_id) {
            return Err(contract_error(
                ErrorCode::Forbidden,
                "You are muted in this room.",
            ));
        }

        if let Some(reply_to) = reply_to_id {
            let valid = state
                .messages
                .get(reply_to)
                .is_some_and(|message| message.room_id == room_id);
            if !valid {
                return Err(contract_error(
                    ErrorCode::NotFound,
                    "Replied-to message is not in this room.",
                ));
            }
        }

        let id = utils::random_string(20);
        let created_at = utils::millis_since_unix_epoch();
        state.messages.insert(
            id.clone(),
            MessageRecord {
                room_id: room_id.to_owned(),
                sender_id: user_id.to_owned(),
                content: content.to_owned(),
                reply_to_id: reply_to_id.map(ToOwned::to_owned),
                created_at,
            },
        );

        Ok(SavedMessage {
            id,
            room_id: room_id.to_owned(),
            sender_id: user_id.to_owned(),
            sender_name,
            content: content.to_owned(),
            reply_to_id: reply_to_id.map(ToOwned::to_owned),
            created_at,
        })
    }

    async fn mark_message_as_read(
        &self,
        user_id: &str,
        room_id: &str,
        message_id: &str,
    ) -> Result<MarkReadResult> {
        let mut state = self.state();

        let message = state
            .messages
            .get(message_id)
            .cloned()
            .filter(|message| message.room_id == room_id)
            .ok_or_else(|| contract_error(ErrorCode::NotFound, "Message does not exist."))?;

        let receipts = state
            .receipts
            .entry((room_id.to_owned(), message_id.to_owned()))
            .or_default();

        // Repeated reads keep the first timestamp and owe no broadcast
        let duplicate = receipts.contains_key(user_id);
        let read_at = *receipts
            .entry(user_id.to_owned())
            .or_insert_with(utils::millis_since_unix_epoch);

        Ok(MarkReadResult {
            sender_id: message.sender_id,
            read_at,
            duplicate,
        })
    }

    async fn get_read_receipts(
        &self,
        _user_id: &str,
        room_id: &str,
        message_id: &str,
    ) -> Result<Vec<ReadReceipt>> {
        let state = self.state();

        if !state
            .messages
            .get(message_id)
            .is_some_and(|message| message.room_id == room_id)
        {
            return Err(contract_error(ErrorCode::NotFound, "Message does not exist."));
        }

        let Some(receipts) = state
            .receipts
            .get(&(room_id.to_owned(), message_id.to_owned()))
        else {
            return Ok(Vec::new());
        };

        Ok(receipts
            .iter()
            .filter(|(reader, _)| {
                state
                    .users
                    .get(*reader)
                    .map_or(true, |user| user.read_receipts_enabled)
            })
            .map(|(reader, read_at)| ReadReceipt {
                user_id: reader.clone(),
                username: state
                    .users
                    .get(reader)
                    .map(|user| user.username.clone())
                    .unwrap_or_else(|| reader.clone()),
                read_at: *read_at,
            })
            .collect())
    }

    async fn read_receipts_enabled(&self, user_id: &str) -> Result<bool> {
        Ok(self
            .state()
            .users
            .get(user_id)
            .map_or(true, |user| user.read_receipts_enabled))
    }

    async fn set_user_offline(&self, user_id: &str) -> Result<()> {
        self.state().offline_marked.insert(user_id.to_owned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refresh_reuse_revokes_the_family() {
        let connector = MemoryConnector::new();
        connector.add_user("u1", "alice");

        let pair = connector.issue_tokens("u1", Some("d1"));
        let rotated = connector
            .refresh_tokens(&pair.refresh_token, Some("d1"))
            .await
            .unwrap();

        // Presenting the first token again revokes everything
        assert!(connector
            .refresh_tokens(&pair.refresh_token, Some("d1"))
            .await
            .is_err());
        assert!(connector
            .refresh_tokens(&rotated.refresh_token, Some("d1"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn public_rooms_auto_join_up_to_capacity() {
        let connector = MemoryConnector::new();
        connector.add_user("u1", "alice");
        connector.add_user("u2", "bob");
        connector.add_room("r1", "lobby", true, 1);

        let access = connector.room_access("u1", "r1").await.unwrap();
        assert!(access.is_member);
        assert_eq!(access.member_count, 1);

        // Full room rejects the next non-member
        assert!(connector.room_access("u2", "r1").await.is_err());
        // But stays accessible to its member
        assert!(connector.room_access("u1", "r1").await.is_ok());
    }

    #[tokio::test]
    async fn replies_must_stay_in_the_room() {
        let connector = MemoryConnector::new();
        connector.add_user("u1", "alice");
        connector.add_room("r1", "lobby", true, 10);
        connector.add_room("r2", "other", true, 10);
        connector.add_room_member("r1", "u1");
        connector.add_room_member("r2", "u1");

        let message = connector
            .send_message("u1", "r1", "hello", None)
            .await
            .unwrap();

        assert!(connector
            .send_message("u1", "r2", "reply", Some(&message.id))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn repeated_reads_keep_one_receipt() {
        let connector = MemoryConnector::new();
        connector.add_user("u1", "alice");
        connector.add_user("u2", "bob");
        connector.add_room("r1", "lobby", true, 10);
        connector.add_room_member("r1", "u1");
        connector.add_room_member("r1", "u2");

        let message = connector
            .send_message("u1", "r1", "hello", None)
            .await
            .unwrap();

        let first = connector
            .mark_message_as_read("u2", "r1", &message.id)
            .await
            .unwrap();
        let second = connector
            .mark_message_as_read("u2", "r1", &message.id)
            .await
            .unwrap();
        assert_eq!(first.read_at, second.read_at);

        let receipts = connector
            .get_read_receipts("u1", "r1", &message.id)
            .await
            .unwrap();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].user_id, "u2");
    }

    #[tokio::test]
    async fn disabled_receipts_are_filtered_out() {
        let connector = MemoryConnector::new();
        connector.add_user("u1", "alice");
        connector.add_user("u2", "bob");
        connector.add_room("r1", "lobby", true, 10);
        connector.add_room_member("r1", "u1");
        connector.add_room_member("r1", "u2");
        connector.set_read_receipts_enabled("u2", false);

        let message = connector
            .send_message("u1", "r1", "hello", None)
            .await
            .unwrap();
        connector
            .mark_message_as_read("u2", "r1", &message.id)
            .await
            .unwrap();

        let receipts = connector
            .get_read_receipts("u1", "r1", &message.id)
            .await
            .unwrap();
        assert!(receipts.is_empty());
    }
}
