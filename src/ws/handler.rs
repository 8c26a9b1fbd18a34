//! WebSocket upgrade handler

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::competitor::PushChannel;
use crate::game::snapshot::{message_frame, Frame};
use crate::game::RegistryError;
use crate::http::middleware::{verify_jwt, JwtClaims};
use crate::util::rate_limit::ConnectionRateLimiter;
use crate::util::time::unix_millis;
use crate::ws::protocol::{ClientMsg, ServerMsg};

/// Frames buffered per connection before new ones are dropped
const PUSH_BUFFER: usize = 64;

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// JWT token for authentication
    pub token: String,
    /// Session to join or reconnect to
    pub session: Uuid,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    // Verify JWT token before upgrading
    let claims = match verify_jwt(&query.token, &state.config.jwt_secret) {
        Ok(claims) => claims,
        Err(e) => {
            warn!(error = %e, "WebSocket auth failed");
            return e.into_response();
        }
    };

    if state.registry.session_summary(query.session).is_none() {
        debug!(session_id = %query.session, "WebSocket for unknown session");
        return (StatusCode::NOT_FOUND, "Unknown session").into_response();
    }

    info!(
        user_id = %claims.sub,
        session_id = %query.session,
        "WebSocket upgrade for authenticated user"
    );
    let session_id = query.session;
    ws.on_upgrade(move |socket| handle_socket(socket, claims, session_id, state))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, claims: JwtClaims, session_id: Uuid, state: AppState) {
    let user_id = claims.sub;
    let (mut ws_sink, mut ws_stream) = socket.split();

    let (tx, mut rx) = mpsc::channel::<Frame>(PUSH_BUFFER);
    let channel = PushChannel::new(tx);

    let player_id = match state.registry.connect(
        session_id,
        user_id,
        &claims.display_name(),
        channel.clone(),
    ) {
        Ok(player_id) => player_id,
        Err(e) => {
            warn!(
                user_id = %user_id,
                session_id = %session_id,
                error = %e,
                "Failed to join session"
            );
            let _ = send_msg(&mut ws_sink, &ServerMsg::error(e.code(), &e)).await;
            let _ = ws_sink.close().await;
            return;
        }
    };
    info!(user_id = %user_id, session_id = %session_id, player_id, "Connected to session");

    // Welcome goes out before anything the session queued during connect
    let welcome = ServerMsg::Welcome {
        user_id,
        session_id,
        player_id,
        server_time: unix_millis(),
    };
    if let Err(e) = send_msg(&mut ws_sink, &welcome).await {
        error!(user_id = %user_id, error = %e, "Failed to send welcome");
        state.registry.disconnect(user_id, &channel);
        return;
    }

    // Writer task: session pushes -> WebSocket
    let writer_handle = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = ws_sink.send(Message::Text(frame.to_string())).await {
                debug!(user_id = %user_id, error = %e, "WebSocket send failed");
                break;
            }
        }
    });

    let rate_limiter = ConnectionRateLimiter::new();
    let mut left = false;

    // Reader loop: WebSocket -> registry
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if !rate_limiter.check_input() {
                    warn!(user_id = %user_id, "Rate limited input message");
                    continue;
                }

                let msg = match serde_json::from_str::<ClientMsg>(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(user_id = %user_id, error = %e, "Failed to parse client message");
                        push(&channel, &ServerMsg::error("bad_message", e));
                        continue;
                    }
                };

                let is_lobby = !matches!(msg, ClientMsg::Move { .. } | ClientMsg::Ping { .. });
                if is_lobby && !rate_limiter.check_lobby() {
                    push(&channel, &ServerMsg::error("rate_limited", "Too many lobby commands"));
                    continue;
                }

                left = matches!(msg, ClientMsg::Leave);
                match dispatch(&state, user_id, msg) {
                    Ok(Some(reply)) => push(&channel, &reply),
                    Ok(None) => {}
                    Err(e) => {
                        debug!(user_id = %user_id, code = e.code(), error = %e, "Command rejected");
                        left = false;
                        push(&channel, &ServerMsg::error(e.code(), &e));
                    }
                }
                if left {
                    break;
                }
            }
            Ok(Message::Binary(_)) => {
                warn!(user_id = %user_id, "Received binary message, ignoring");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!(user_id = %user_id, "Client initiated close");
                break;
            }
            Err(e) => {
                error!(user_id = %user_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    if !left {
        state.registry.disconnect(user_id, &channel);
    }
    writer_handle.abort();

    info!(user_id = %user_id, session_id = %session_id, "WebSocket connection closed");
}

/// Apply one client command; the optional reply goes back to this connection
fn dispatch(
    state: &AppState,
    user_id: Uuid,
    msg: ClientMsg,
) -> Result<Option<ServerMsg>, RegistryError> {
    let registry = &state.registry;
    match msg {
        ClientMsg::Move { dir, user } => {
            registry.with_session(user_id, |s| s.set_direction(user_id, user, dir))?;
        }
        ClientMsg::AddAi { skill } => {
            registry.with_session(user_id, |s| s.add_ai(user_id, skill))?;
        }
        ClientMsg::AddLocal { name } => {
            registry.with_session(user_id, |s| s.add_local(user_id, name))?;
        }
        ClientMsg::Remove { player_id } => {
            registry.with_session(user_id, |s| s.remove(user_id, player_id))?;
        }
        ClientMsg::Leave => registry.leave(user_id)?,
        ClientMsg::Start => {
            registry.with_session(user_id, |s| s.request_start(user_id))?;
        }
        ClientMsg::Settings { update } => {
            registry.with_session(user_id, |s| s.update_settings(user_id, &update))?;
        }
        ClientMsg::Ping { t } => return Ok(Some(ServerMsg::Pong { t })),
    }
    Ok(None)
}

fn push(channel: &PushChannel, msg: &ServerMsg) {
    if let Some(frame) = message_frame(msg) {
        channel.send(&frame);
    }
}

/// Send a message straight to the socket, bypassing the push channel
async fn send_msg(sink: &mut SplitSink<WebSocket, Message>, msg: &ServerMsg) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| e.to_string())
}
