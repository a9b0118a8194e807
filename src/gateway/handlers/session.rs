use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::info;

use super::ack;
use crate::{
    gateway::frames::{AuthRefreshAck, AuthRefreshPayload, OutboundEnvelope},
    service::sessions::Session,
    services, Result,
};

/// # `auth:refresh`
///
/// Rotates the refresh-token family mid-connection. The socket already
/// authenticated at handshake; presenting a previously-used refresh
/// token revokes the entire family.
///
/// The `auth:refreshed` event goes to the originating socket only.
pub async fn refresh(session: &Arc<Session>, payload: AuthRefreshPayload) -> Result<JsonValue> {
    let pair = services()
        .connectors
        .refresh_tokens(&payload.refresh_token, session.device_id.as_deref())
        .await?;

    info!(
        user_id = session.user_id,
        socket_id = session.socket_id,
        "Rotated token pair"
    );

    let ack_payload = AuthRefreshAck {
        access_token: pair.access_token,
        refresh_token: pair.refresh_token,
        expires_in: pair.expires_in_sec,
    };

    session.send(OutboundEnvelope::event("auth:refreshed", &ack_payload));

    ack(ack_payload)
}
