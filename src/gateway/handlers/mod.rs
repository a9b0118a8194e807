mod message;
mod presence;
mod room;
mod session;
mod typing;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use super::frames::InboundEnvelope;
use crate::{service::sessions::Session, Error, ErrorCode, Result};

/// The static dispatch table: frame name → handler. Every frame reaching
/// this point belongs to an authenticated session; the handshake is the
/// only unauthenticated exchange and never gets here.
pub async fn dispatch(session: &Arc<Session>, envelope: &InboundEnvelope) -> Result<JsonValue> {
    match envelope.event.as_str() {
        "room:join" => room::join(session, parse(&envelope.data)?).await,
        "room:leave" => room::leave(session, parse(&envelope.data)?).await,
        "message:send" => message::send(session, parse(&envelope.data)?).await,
        "message:read" => message::mark_read(session, parse(&envelope.data)?).await,
        "read_receipts:get" => message::read_receipts(session, parse(&envelope.data)?).await,
        "typing" => typing::legacy(session, parse(&envelope.data)?).await,
        "typing:start" => typing::start(session, parse(&envelope.data)?).await,
        "typing:stop" => typing::stop(session, parse(&envelope.data)?).await,
        "heartbeat" => presence::heartbeat(session).await,
        "presence:status" => presence::set_status(session, parse(&envelope.data)?).await,
        "presence:room" => presence::room(session, parse(&envelope.data)?).await,
        "auth:refresh" => session::refresh(session, parse(&envelope.data)?).await,
        _ => Err(Error::BadRequest(ErrorCode::BadFrame, "Unknown frame kind.")),
    }
}

/// Stable failure code for errors that carry no code of their own.
pub fn fallback_code(event: &str) -> ErrorCode {
    match event {
        "room:join" | "room:leave" => ErrorCode::JoinFailed,
        "message:send" => ErrorCode::SendFailed,
        "message:read" => ErrorCode::MarkReadFailed,
        "read_receipts:get" => ErrorCode::GetReadReceiptsFailed,
        "auth:refresh" => ErrorCode::TokenRefreshFailed,
        _ => ErrorCode::NotAvailable,
    }
}

fn parse<T: DeserializeOwned>(data: &JsonValue) -> Result<T> {
    serde_json::from_value(data.clone())
        .map_err(|_| Error::BadRequest(ErrorCode::BadFrame, "Frame payload failed validation."))
}

fn ack<T: serde::Serialize>(value: T) -> Result<JsonValue> {
    Ok(serde_json::to_value(value).expect("ack payloads are serializable"))
}
