//! The protocol surface: websocket upgrade, handshake authentication,
//! per-socket frame loop and the static frame dispatch table.

pub mod frames;
pub mod handlers;

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use http::HeaderMap;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use self::frames::{ConnectionSuccess, InboundEnvelope, OutboundEnvelope, SocketMessage};
use crate::{
    service::{connectors::AccessClaims, sessions::Session},
    services, Error, ErrorCode, Result,
};

pub fn routes() -> Router {
    Router::new()
        .route("/rt", get(socket_upgrade))
        .route("/", get(it_works))
        .fallback(not_found)
}

#[derive(Deserialize)]
struct AuthParams {
    access_token: Option<String>,
}

async fn socket_upgrade(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(params): Query<AuthParams>,
) -> impl IntoResponse {
    let token = extract_token(&headers, params);
    ws.on_upgrade(move |socket| handle_socket(socket, token))
}

/// Token from the `Authorization` header (`Bearer x` or bare) or the
/// `access_token` query parameter.
fn extract_token(headers: &HeaderMap, params: AuthParams) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION) {
        let raw = value.to_str().ok()?.trim();
        let token = match raw.split_once(' ') {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
            _ => raw,
        };
        return Some(token.to_owned());
    }

    params.access_token
}

async fn handle_socket(socket: WebSocket, token: Option<String>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let claims = match authenticate(token).await {
        Ok(claims) => claims,
        Err(error) => {
            // The handshake is the only place an error disconnects
            let frame =
                OutboundEnvelope::event("error", error.to_frame(ErrorCode::Unauthorized));
            if let Ok(text) = serde_json::to_string(&frame) {
                let _ = ws_tx.send(Message::Text(text)).await;
            }
            let _ = ws_tx.send(Message::Close(None)).await;
            return;
        }
    };

    let (sender, mut outbound) = mpsc::unbounded_channel();
    let session = Arc::new(Session::new(
        claims.user_id.clone(),
        claims.username.clone(),
        claims.device_id.clone(),
        sender,
    ));

    services().sessions.register(Arc::clone(&session));

    if let Err(error) = services()
        .presence
        .handle_reconnection(&claims.user_id, claims.device_id.clone())
        .await
    {
        warn!(%error, user_id = claims.user_id, "Could not re-assert presence on connect");
    }

    session.send(OutboundEnvelope::event(
        "connection:success",
        ConnectionSuccess {
            user_id: claims.user_id.clone(),
            username: claims.username.clone(),
            socket_id: session.socket_id.clone(),
        },
    ));

    info!(
        user_id = claims.user_id,
        socket_id = session.socket_id,
        "Socket connected"
    );

    let mut shutdown = services().globals.subscribe_shutdown();

    loop {
        tokio::select! {
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        // Frames are processed in arrival order per socket
                        handle_frame(&session, &text).await;
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_))) => {}
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                }
            }
            message = outbound.recv() => {
                match message {
                    Some(SocketMessage::Frame(frame)) => {
                        let Ok(text) = serde_json::to_string(&frame) else { continue; };
                        if ws_tx.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Some(SocketMessage::Close) | None => break,
                }
            }
            _ = shutdown.recv() => break,
        }
    }

    services().sessions.unregister(&session.socket_id).await;
    let _ = ws_tx.send(Message::Close(None)).await;

    debug!(
        user_id = session.user_id,
        socket_id = session.socket_id,
        "Socket disconnected"
    );
}

/// Verifies the access token and that the account is still usable.
/// Rejections here are the only ones that disconnect the socket.
pub async fn authenticate(token: Option<String>) -> Result<AccessClaims> {
    let token = token.ok_or(Error::BadRequest(
        ErrorCode::Unauthorized,
        "Missing access token.",
    ))?;

    let claims = services().connectors.verify_access_token(&token).await?;

    let validation = services().connectors.validate_user(&claims.user_id).await?;
    if !validation.is_active {
        return Err(Error::BadRequest(
            ErrorCode::Unauthorized,
            "Account is deactivated.",
        ));
    }

    Ok(claims)
}

/// Decodes one inbound frame, runs its handler under the time budget and
/// queues the ack or error frame.
pub async fn handle_frame(session: &Arc<Session>, text: &str) {
    let envelope: InboundEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(_) => {
            session.send(OutboundEnvelope::event(
                "error",
                Error::BadRequest(ErrorCode::BadFrame, "Frame could not be decoded.")
                    .to_frame(ErrorCode::BadFrame),
            ));
            return;
        }
    };

    // Any frame counts as liveness
    session.touch();

    let budget = services().globals.handler_budget();
    let result = match tokio::time::timeout(budget, handlers::dispatch(session, &envelope)).await
    {
        Ok(result) => result,
        Err(_) => Err(Error::HandlerTimeout),
    };

    match result {
        Ok(ack) => {
            if let Some(id) = envelope.id {
                session.send(OutboundEnvelope {
                    event: "ack".to_owned(),
                    data: ack,
                    id: Some(id),
                });
            }
        }
        Err(error) => {
            let mut frame = OutboundEnvelope::event(
                "error",
                error.to_frame(handlers::fallback_code(&envelope.event)),
            );
            frame.id = envelope.id;
            session.send(frame);
        }
    }
}

async fn not_found(uri: http::Uri) -> impl IntoResponse {
    warn!("Not found: {uri}");
    (http::StatusCode::NOT_FOUND, "Unrecognized request")
}

async fn it_works() -> &'static str {
    "Hello from roomcast!"
}
