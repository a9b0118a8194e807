use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use url::Url;

use super::{
    contract_error, AccessClaims, Connector, MarkReadResult, ReadReceipt, RoomAccess,
    SavedMessage, TokenPair, UserValidation,
};
use crate::{config::PersistenceConfig, Config, Error, ErrorCode, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(8);

/// Talks to the persistence service's internal API. Access tokens are
/// verified locally when a JWT secret is configured; everything else is
/// one HTTP round trip.
pub struct HttpConnector {
    client: reqwest::Client,
    base_url: Url,
    service_token: String,
    jwt_decoding_key: Option<jsonwebtoken::DecodingKey>,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    device_id: Option<String>,
    //exp is checked by the validation
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_id: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnabledFlag {
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl HttpConnector {
    pub fn build(config: &Config, persistence: &PersistenceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base_url: persistence.base_url.clone(),
            service_token: persistence.service_token.clone(),
            jwt_decoding_key: config
                .jwt_secret
                .as_ref()
                .map(|secret| jsonwebtoken::DecodingKey::from_secret(secret.as_bytes())),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|_| Error::bad_config("Persistence base URL cannot be joined with paths."))
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(&self.service_token)
    }

    async fn expect_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        code: ErrorCode,
        message: &'static str,
    ) -> Result<T> {
        match response.status() {
            status if status.is_success() => Ok(response.json().await?),
            StatusCode::UNAUTHORIZED => Err(contract_error(ErrorCode::Unauthorized, message)),
            StatusCode::FORBIDDEN => Err(contract_error(ErrorCode::Forbidden, message)),
            StatusCode::NOT_FOUND => Err(contract_error(ErrorCode::NotFound, message)),
            _ => Err(contract_error(code, message)),
        }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn verify_access_token(&self, token: &str) -> Result<AccessClaims> {
        if let Some(key) = &self.jwt_decoding_key {
            let data =
                jsonwebtoken::decode::<Claims>(token, key, &jsonwebtoken::Validation::default())
                    .map_err(|_| {
                        contract_error(ErrorCode::Unauthorized, "Access token is invalid.")
                    })?;

            let username = data.claims.username.unwrap_or_else(|| data.claims.sub.clone());
            return Ok(AccessClaims {
                user_id: data.claims.sub,
                username,
                device_id: data.claims.device_id,
            });
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct VerifyResponse {
            user_id: String,
            username: String,
            #[serde(default)]
            device_id: Option<String>,
        }

        let response = self
            .request(reqwest::Method::POST, self.endpoint("internal/auth/verify")?)
            .json(&json!({ "token": token }))
            .send()
            .await?;

        let verified: VerifyResponse =
            Self::expect_json(response, ErrorCode::Unauthorized, "Access token is invalid.")
                .await?;

        Ok(AccessClaims {
            user_id: verified.user_id,
            username: verified.username,
            device_id: verified.device_id,
        })
    }

    async fn validate_user(&self, user_id: &str) -> Result<UserValidation> {
        let response = self
            .request(
                reqwest::Method::GET,
                self.endpoint(&format!("internal/users/{user_id}"))?,
            )
            .send()
            .await?;

        Self::expect_json(response, ErrorCode::NotFound, "User does not exist.").await
    }

    async fn refresh_tokens(
        &self,
        refresh_token: &str,
        device_id: Option<&str>,
    ) -> Result<TokenPair> {
        let response = self
            .request(
                reqwest::Method::POST,
                self.endpoint("internal/auth/refresh")?,
            )
            .json(&RefreshRequest {
                refresh_token,
                device_id,
            })
            .send()
            .await?;

        Self::expect_json(
            response,
            ErrorCode::TokenRefreshFailed,
            "Refresh token was rejected.",
        )
        .await
    }

    async fn room_access(&self, user_id: &str, room_id: &str) -> Result<RoomAccess> {
        let response = self
            .request(
                reqwest::Method::POST,
                self.endpoint(&format!("internal/rooms/{room_id}/access"))?,
            )
            .json(&json!({ "userId": user_id }))
            .send()
            .await?;

        Self::expect_json(response, ErrorCode::JoinFailed, "Room access was denied.").await
    }

    async fn send_message(
        &self,
        user_id: &str,
        room_id: &str,
        content: &str,
        reply_to_id: Option<&str>,
    ) -> Result<SavedMessage> {
        let response = self
            .request(
                reqwest::Method::POST,
                self.endpoint(&format!("internal/rooms/{room_id}/messages"))?,
            )
            .json(&json!({
                "userId": user_id,
                "content": content,
                "replyToId": reply_to_id,
            }))
            .send()
            .await?;

        Self::expect_json(response, ErrorCode::SendFailed, "Message was not persisted.").await
    }

    async fn mark_message_as_read(
        &self,
        user_id: &str,
        room_id: &str,
        message_id: &str,
    ) -> Result<MarkReadResult> {
        let response = self
            .request(
                reqwest::Method::POST,
                self.endpoint(&format!(
                    "internal/rooms/{room_id}/messages/{message_id}/read"
                ))?,
            )
            .json(&json!({ "userId": user_id }))
            .send()
            .await?;

        Self::expect_json(response, ErrorCode::MarkReadFailed, "Receipt was not persisted.").await
    }

    async fn get_read_receipts(
        &self,
        user_id: &str,
        room_id: &str,
        message_id: &str,
    ) -> Result<Vec<ReadReceipt>> {
        let response = self
            .request(
                reqwest::Method::GET,
                self.endpoint(&format!(
                    "internal/rooms/{room_id}/messages/{message_id}/receipts"
                ))?,
            )
            .query(&[("userId", user_id)])
            .send()
            .await?;

        Self::expect_json(
            response,
            ErrorCode::GetReadReceiptsFailed,
            "Receipts could not be read.",
        )
        .await
    }

    async fn read_receipts_enabled(&self, user_id: &str) -> Result<bool> {
        let response = self
            .request(
                reqwest::Method::GET,
                self.endpoint(&format!("internal/users/{user_id}/settings/read-receipts"))?,
            )
            .send()
            .await?;

        // A user without the setting defaults to enabled
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(true);
        }

        let flag: EnabledFlag =
            Self::expect_json(response, ErrorCode::NotFound, "User does not exist.").await?;
        Ok(flag.enabled)
    }

    async fn set_user_offline(&self, user_id: &str) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::POST,
                self.endpoint(&format!("internal/users/{user_id}/offline"))?,
            )
            .send()
            .await?;

        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(contract_error(
                ErrorCode::NotAvailable,
                "Offline transition was not persisted.",
            ))
        }
    }
}
