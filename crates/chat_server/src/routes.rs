/* Copyright 2023- The Binedge, Lda team. All rights reserved.
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *     http://www.apache.org/licenses/LICENSE-2.0
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! The HTTP surface: liveness probes, the connection-key exchange, and the `/ws`
//! upgrade that wires a socket to a [`crate::runtime::StreamSocketRuntime`].

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::mpsc::unbounded_channel;
use tracing::{info, warn};
use uuid::Uuid;

use chat_core::store::StoreError;
use chat_core::HealthCheck;

use crate::auth::bearer_token;
use crate::protocol::{close_code, ServerMessage};
use crate::runtime::{StreamSocketRuntime, UnknownMaidError};
use crate::state::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/db/health", get(db_health))
        .route("/redis/health", get(redis_health))
        .route("/ws/connection-key", get(issue_connection_key))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

async fn index() -> &'static str {
    "chat server is running"
}

/// Reports whether the Postgres pool can round-trip a query.
#[utoipa::path(get, path = "/db/health", responses((status = 200, description = "liveness result")))]
pub(crate) async fn db_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "ok": state.db.is_healthy().await }))
}

/// Reports whether the Redis connection is reachable.
#[utoipa::path(get, path = "/redis/health", responses((status = 200, description = "liveness result")))]
pub(crate) async fn redis_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "ok": state.queue_backend.is_healthy().await }))
}

#[derive(Debug, Deserialize)]
struct ConnectionKeyQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<i64>,
}

/// Exchanges a bearer token for a short-lived, single-use connection key that the
/// client then presents on the `/ws` upgrade.
#[utoipa::path(
    get,
    path = "/ws/connection-key",
    params(("sessionId" = Option<i64>, Query, description = "resume an existing session")),
    responses((status = 201, description = "connection key issued"))
)]
pub(crate) async fn issue_connection_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ConnectionKeyQuery>,
) -> Response {
    let user_id = match resolve_bearer(&state, &headers).await {
        Ok(user_id) => user_id,
        Err(response) => return response,
    };

    if let Some(session_id) = query.session_id {
        if let Err(err) = state.sessions.ensure_session(&user_id, Some(session_id)).await {
            let status = match err {
                StoreError::NotFound => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            return (status, Json(json!({ "message": err.to_string() }))).into_response();
        }
    }

    let entry = state.connection_keys.issue(user_id, query.session_id);
    let expires_in_ms = (entry.expires_at - OffsetDateTime::now_utc())
        .whole_milliseconds()
        .max(0);

    (
        StatusCode::CREATED,
        Json(json!({
            "connectionKey": entry.key,
            "expiresAt": entry.expires_at.unix_timestamp(),
            "expiresInMs": expires_in_ms,
            "sessionId": entry.session_id,
        })),
    )
        .into_response()
}

async fn resolve_bearer(state: &AppState, headers: &HeaderMap) -> Result<String, Response> {
    let header_value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(unauthorized)?;
    let token = bearer_token(header_value).map_err(|_| unauthorized())?;
    state
        .auth
        .resolve_user(token)
        .await
        .map_err(|_| unauthorized())
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "message": "unauthorized" })),
    )
        .into_response()
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "message": message }))).into_response()
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    #[serde(rename = "maidId")]
    maid_id: String,
    #[serde(rename = "connectionKey")]
    connection_key: Option<Uuid>,
    /// Legacy bearer-on-WS alias; the connection-key exchange is preferred.
    token: Option<String>,
    #[serde(rename = "sessionId")]
    session_id: Option<i64>,
}

async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let (user_id, session_id) = if let Some(key) = query.connection_key {
        match state.connection_keys.consume(key) {
            Some(entry) => (entry.user_id, query.session_id.or(entry.session_id)),
            None => return unauthorized(),
        }
    } else if let Some(token) = &query.token {
        match state.auth.resolve_user(token).await {
            Ok(user_id) => (user_id, query.session_id),
            Err(_) => return unauthorized(),
        }
    } else {
        return bad_request("missing connectionKey or token");
    };

    let maid_id = query.maid_id.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, state, maid_id, user_id, session_id))
}

async fn handle_socket(
    mut socket: WebSocket,
    state: AppState,
    maid_id: String,
    user_id: String,
    session_id: Option<i64>,
) {
    let (outbound_tx, mut outbound_rx) = unbounded_channel();
    let (close_tx, mut close_rx) = unbounded_channel();

    let runtime = match StreamSocketRuntime::new(
        &maid_id,
        user_id,
        session_id,
        state.sessions,
        state.memories,
        state.llm,
        outbound_tx,
        close_tx,
    ) {
        Ok(runtime) => runtime,
        Err(UnknownMaidError(id)) => {
            let message = ServerMessage::Error {
                message: format!("unknown maidId: {id}"),
            }
            .to_json();
            socket.send(WsMessage::Text(message)).await.ok();
            socket
                .send(close_frame(close_code::POLICY_VIOLATION, "unknown maid"))
                .await
                .ok();
            return;
        }
    };

    loop {
        // Biased so a pending outbound frame (e.g. the error frame the maid worker sends
        // right before signaling close) is always flushed ahead of honoring that close
        // signal, rather than `select!`'s default random pick racing the two arms.
        tokio::select! {
            biased;

            Some(msg) = outbound_rx.recv() => {
                if socket.send(WsMessage::Text(msg.to_json())).await.is_err() {
                    break;
                }
            }
            Some(signal) = close_rx.recv() => {
                while let Ok(msg) = outbound_rx.try_recv() {
                    if socket.send(WsMessage::Text(msg.to_json())).await.is_err() {
                        break;
                    }
                }
                socket
                    .send(close_frame(signal.code(), signal.reason()))
                    .await
                    .ok();
                break;
            }
            frame = socket.recv() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => runtime.handle_frame(&text),
                    Some(Ok(WsMessage::Binary(_))) => {}
                    Some(Ok(WsMessage::Close(_))) | None => {
                        runtime.on_transport_close();
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "websocket read error");
                        runtime.on_transport_close();
                        break;
                    }
                }
            }
        }
    }

    info!(maid_id = %maid_id, "websocket connection closed");
}

fn close_frame(code: u16, reason: &str) -> WsMessage {
    WsMessage::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }))
}
