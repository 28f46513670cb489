// Realtime feed: one websocket per agent connection. Handshake
// authenticates by api key, attach joins the personal room plus one room
// per group membership, the serve loop accepts room-subscription and
// typing events, detach releases rooms and flips presence.
use crate::api::errors::error_response;
use crate::auth::{extract_bearer_token, looks_like_api_key};
use crate::services::events::{
    agent_room, group_room, EventKind, RealtimeEvent, CONNECTION_QUEUE_SIZE,
};
use crate::services::now_ts;
use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::{routing::get, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/ws", get(realtime_ws))
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClientEnvelope {
    event: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RoomPayload {
    #[serde(default)]
    group_id: Option<String>,
    #[serde(default)]
    agent_id: Option<String>,
}

async fn realtime_ws(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, Response> {
    let token = extract_bearer_token(&headers)
        .or_else(|| {
            query
                .token
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        })
        .ok_or_else(|| error_response(StatusCode::UNAUTHORIZED, "missing token"))?;
    if !looks_like_api_key(&token) {
        return Err(error_response(StatusCode::UNAUTHORIZED, "malformed api key"));
    }
    let agent = state
        .identity
        .authenticate_by_key(&token, now_ts())
        .map_err(|err| error_response(StatusCode::UNAUTHORIZED, err.message()))?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, agent)))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, agent: crate::storage::AgentRecord) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<RealtimeEvent>(CONNECTION_QUEUE_SIZE);
    let cancel = CancellationToken::new();
    let connection_id = state
        .events
        .register(&agent.agent_id, out_tx.clone(), cancel.clone());

    let writer = tokio::spawn(async move {
        while let Some(event) = out_rx.recv().await {
            let frame = event.to_frame().to_string();
            if ws_sender.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    // Attach: personal room plus one room per group membership.
    state
        .events
        .join_room(connection_id, &agent_room(&agent.agent_id));
    match state.storage.list_agent_memberships(&agent.agent_id) {
        Ok(memberships) => {
            for membership in memberships {
                state
                    .events
                    .join_room(connection_id, &group_room(&membership.group_id));
            }
        }
        Err(err) => warn!("membership lookup failed on attach: {err}"),
    }
    let first_connection = state.presence.connect(&agent.agent_id);
    if let Err(err) = state
        .storage
        .set_agent_presence(&agent.agent_id, true, now_ts())
    {
        warn!("presence write failed on attach: {err}");
    }
    if first_connection {
        state.events.broadcast_all(
            Some(connection_id),
            RealtimeEvent::new(
                EventKind::AgentOnline,
                json!({ "agent_id": agent.agent_id, "handle": agent.handle }),
            ),
        );
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            incoming = ws_receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_event(&state, connection_id, &agent, text.as_str());
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // Detach: rooms release implicitly with the registration.
    state.events.unregister(connection_id);
    let last_connection = state.presence.disconnect(&agent.agent_id);
    if last_connection {
        if let Err(err) = state
            .storage
            .set_agent_presence(&agent.agent_id, false, now_ts())
        {
            warn!("presence write failed on detach: {err}");
        }
        state.events.broadcast_all(
            None,
            RealtimeEvent::new(
                EventKind::AgentOffline,
                json!({
                    "agent_id": agent.agent_id,
                    "handle": agent.handle,
                    "last_seen": now_ts(),
                }),
            ),
        );
    }
    drop(out_tx);
    let _ = writer.await;
}

/// Client events touch room subscriptions and typing fan-out only; they
/// never write durable state. Malformed events are logged and dropped.
fn handle_client_event(
    state: &AppState,
    connection_id: u64,
    agent: &crate::storage::AgentRecord,
    text: &str,
) {
    let envelope: ClientEnvelope = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            debug!("dropping malformed client event: {err}");
            return;
        }
    };
    let payload = envelope
        .data
        .and_then(|value| serde_json::from_value::<RoomPayload>(value).ok())
        .unwrap_or(RoomPayload {
            group_id: None,
            agent_id: None,
        });
    match envelope.event.trim() {
        "group:join" => {
            let Some(group_id) = cleaned(payload.group_id) else {
                return;
            };
            // Only members may listen in; the check hits the store, not
            // the room table.
            match state.storage.get_group_member(&group_id, &agent.agent_id) {
                Ok(Some(_)) => state.events.join_room(connection_id, &group_room(&group_id)),
                Ok(None) => debug!("group:join refused, not a member of {group_id}"),
                Err(err) => warn!("group:join membership lookup failed: {err}"),
            }
        }
        "group:leave" => {
            let Some(group_id) = cleaned(payload.group_id) else {
                return;
            };
            state.events.leave_room(connection_id, &group_room(&group_id));
        }
        "typing:start" | "typing:stop" => {
            let kind = if envelope.event.trim() == "typing:start" {
                EventKind::TypingStart
            } else {
                EventKind::TypingStop
            };
            let room = if let Some(group_id) = cleaned(payload.group_id) {
                match state.storage.get_group_member(&group_id, &agent.agent_id) {
                    Ok(Some(_)) => group_room(&group_id),
                    _ => return,
                }
            } else if let Some(agent_id) = cleaned(payload.agent_id) {
                agent_room(&agent_id)
            } else {
                return;
            };
            let event = RealtimeEvent::new(
                kind,
                json!({
                    "agent_id": agent.agent_id,
                    "handle": agent.handle,
                    "room": room.clone(),
                }),
            );
            state.events.publish_except(&room, connection_id, event);
        }
        other => debug!("dropping unsupported client event: {other}"),
    }
}

fn cleaned(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
