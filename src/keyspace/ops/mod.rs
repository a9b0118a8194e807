//! Implementations of the service `Data` traits on the keyspace adapter.
//! The key schema here is stable: other instances interoperate through
//! these exact keys and channels.

mod bus;
mod presence;
mod rate_limit;
mod rooms;
mod typing;

pub(crate) const ONLINE_KEY: &str = "presence:online";

pub(crate) fn presence_key(user_id: &str) -> String {
    format!("presence:{user_id}")
}

pub(crate) fn room_users_key(room_id: &str) -> String {
    format!("room:{room_id}:users")
}

pub(crate) fn user_rooms_key(user_id: &str) -> String {
    format!("user:{user_id}:rooms")
}

pub(crate) fn room_presence_set_key(room_id: &str) -> String {
    format!("room_presence:{room_id}")
}

pub(crate) fn room_presence_key(room_id: &str, user_id: &str) -> String {
    format!("room_presence:{room_id}:{user_id}")
}

pub(crate) fn typing_set_key(room_id: &str) -> String {
    format!("typing:{room_id}")
}

pub(crate) fn typing_key(room_id: &str, user_id: &str) -> String {
    format!("typing:{room_id}:{user_id}")
}

pub(crate) fn grace_key(user_id: &str) -> String {
    format!("disconnect_grace:{user_id}")
}

pub(crate) fn rate_limit_key(scope: &str) -> String {
    format!("rate_limit:{scope}")
}
