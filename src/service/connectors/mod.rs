mod http;
pub mod memory;

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use lru_cache::LruCache;
use serde::{Deserialize, Serialize};

use crate::{utils, Config, ErrorCode, Result};

/// Claims carried by a verified access token.
#[derive(Clone, Debug)]
pub struct AccessClaims {
    pub user_id: String,
    pub username: String,
    pub device_id: Option<String>,
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserValidation {
    pub is_active: bool,
    #[serde(default)]
    pub shadow_banned: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in_sec: u64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomAccess {
    pub id: String,
    pub name: String,
    pub member_count: u64,
    pub is_member: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedMessage {
    pub id: String,
    pub room_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    pub created_at: u64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadResult {
    pub sender_id: String,
    pub read_at: u64,
    /// True when the receipt already existed, so no broadcast is owed.
    #[serde(default)]
    pub duplicate: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub user_id: String,
    pub username: String,
    pub read_at: u64,
}

/// The contracts the core relies on from the rest of the backend. The
/// HTTP connector talks to the persistence service; the memory connector
/// backs dev runs and tests.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn verify_access_token(&self, token: &str) -> Result<AccessClaims>;

    async fn validate_user(&self, user_id: &str) -> Result<UserValidation>;

    /// Rotates a refresh-token family. Presenting an already-used token
    /// revokes the whole family.
    async fn refresh_tokens(
        &self,
        refresh_token: &str,
        device_id: Option<&str>,
    ) -> Result<TokenPair>;

    /// May auto-join public rooms up to their member capacity.
    async fn room_access(&self, user_id: &str, room_id: &str) -> Result<RoomAccess>;

    async fn send_message(
        &self,
        user_id: &str,
        room_id: &str,
        content: &str,
        reply_to_id: Option<&str>,
    ) -> Result<SavedMessage>;

    async fn mark_message_as_read(
        &self,
        user_id: &str,
        room_id: &str,
        message_id: &str,
    ) -> Result<MarkReadResult>;

    /// Readers of the message, filtered to users with receipts enabled.
    async fn get_read_receipts(
        &self,
        user_id: &str,
        room_id: &str,
        message_id: &str,
    ) -> Result<Vec<ReadReceipt>>;

    /// Defaults to true when the flag is missing in user settings.
    async fn read_receipts_enabled(&self, user_id: &str) -> Result<bool>;

    /// Used by the presence sweep to persist offline transitions.
    async fn set_user_offline(&self, user_id: &str) -> Result<()>;
}

pub struct Service {
    connector: Arc<dyn Connector>,
    memory: Option<Arc<memory::MemoryConnector>>,
    validation_cache: StdMutex<LruCache<String, (UserValidation, u64)>>,
}

impl Service {
    pub fn build(config: &Config) -> Result<Self> {
        let (connector, memory): (Arc<dyn Connector>, _) = match &config.persistence {
            Some(persistence) => (
                Arc::new(http::HttpConnector::build(config, persistence)?),
                None,
            ),
            None => {
                let memory = Arc::new(memory::MemoryConnector::new());
                (Arc::clone(&memory) as Arc<dyn Connector>, Some(memory))
            }
        };

        Ok(Self {
            connector,
            memory,
            validation_cache: StdMutex::new(LruCache::new(10_000)),
        })
    }

    /// The seedable in-process connector, present when no persistence
    /// service is configured. Dev runs and test setups create users and
    /// rooms through this.
    pub fn memory(&self) -> Option<&memory::MemoryConnector> {
        self.memory.as_deref()
    }

    pub async fn verify_access_token(&self, token: &str) -> Result<AccessClaims> {
        self.connector.verify_access_token(token).await
    }

    /// `validate_user` behind a per-user cache; a deactivation propagates
    /// after at most the cache window.
    pub async fn validate_user(&self, user_id: &str) -> Result<UserValidation> {
        let now = utils::millis_since_unix_epoch();
        let max_age = services_cache_ms();

        {
            let mut cache = self.validation_cache.lock().expect("validation cache poisoned");
            if let Some((validation, cached_at)) = cache.get_mut(user_id) {
                if now.saturating_sub(*cached_at) < max_age {
                    return Ok(*validation);
                }
            }
        }

        let validation = self.connector.validate_user(user_id).await?;

        self.validation_cache
            .lock()
            .expect("validation cache poisoned")
            .insert(user_id.to_owned(), (validation, now));

        Ok(validation)
    }

    pub async fn refresh_tokens(
        &self,
        refresh_token: &str,
        device_id: Option<&str>,
    ) -> Result<TokenPair> {
        self.connector.refresh_tokens(refresh_token, device_id).await
    }

    pub async fn room_access(&self, user_id: &str, room_id: &str) -> Result<RoomAccess> {
        self.connector.room_access(user_id, room_id).await
    }

    pub async fn send_message(
        &self,
        user_id: &str,
        room_id: &str,
        content: &str,
        reply_to_id: Option<&str>,
    ) -> Result<SavedMessage> {
        self.connector
            .send_message(user_id, room_id, content, reply_to_id)
            .await
    }

    pub async fn mark_message_as_read(
        &self,
        user_id: &str,
        room_id: &str,
        message_id: &str,
    ) -> Result<MarkReadResult> {
        self.connector
            .mark_message_as_read(user_id, room_id, message_id)
            .await
    }

    pub async fn get_read_receipts(
        &self,
        user_id: &str,
        room_id: &str,
        message_id: &str,
    ) -> Result<Vec<ReadReceipt>> {
        self.connector
            .get_read_receipts(user_id, room_id, message_id)
            .await
    }

    pub async fn read_receipts_enabled(&self, user_id: &str) -> Result<bool> {
        self.connector.read_receipts_enabled(user_id).await
    }

    pub async fn set_user_offline(&self, user_id: &str) -> Result<()> {
        self.connector.set_user_offline(user_id).await
    }
}

fn services_cache_ms() -> u64 {
    crate::services().globals.user_validation_cache().as_millis() as u64
}

/// Shorthand used by connector impls for contract-level failures.
pub(crate) fn contract_error(code: ErrorCode, message: &'static str) -> crate::Error {
    crate::Error::BadRequest(code, message)
}
