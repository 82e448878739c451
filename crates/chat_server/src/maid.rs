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

//! Maid handlers: pluggable per-`maidId` turn logic plugged into [`crate::runtime`].
//!
//! A maid only ever builds a prompt and decides whether to save the caller's message;
//! the shared turn pipeline (`respond_with_stream`) owns session resolution, streaming,
//! persistence, and the extraction signal.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use once_cell::sync::Lazy;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use chat_core::llm::{LlmGateway, StreamEvent};
use chat_core::store::StoreError;
use chat_core::{MessageRole, Session};

use crate::protocol::ServerMessage;
use crate::services::{MemoryService, SessionService};

const CROSS_SESSION_HISTORY_LIMIT: i64 = 20;
const SAME_SESSION_HISTORY_LIMIT: i64 = 20;
const RECENT_MEMORIES_LIMIT: i64 = 20;

/// Everything a turn needs that isn't specific to the maid itself.
pub struct TurnContext {
    pub user_id: String,
    pub sessions: Arc<SessionService>,
    pub memories: Arc<MemoryService>,
    pub llm: Arc<dyn LlmGateway>,
    pub emit: UnboundedSender<ServerMessage>,
    /// Cancelled by the runtime when the client sends `abort` or `bye`, or the transport
    /// closes, while this turn is in flight.
    pub cancel: CancellationToken,
    /// The session this socket is pinned to once a turn resolves one, so the next turn
    /// reuses it instead of creating a fresh session every time. Written by the maid as
    /// soon as `ensure_session` resolves, independent of how the rest of the turn goes.
    pub current_session_id: Arc<Mutex<Option<i64>>>,
}

/// A handler error, distinguishing the one case the runtime closes the socket for
/// (the caller asserted a `sessionId` that doesn't belong to it) from everything else,
/// which just gets an `error` frame on an otherwise-open socket.
#[derive(Debug, Clone)]
pub enum MaidError {
    SessionNotFound,
    Other(String),
}

impl MaidError {
    pub fn message(&self) -> String {
        match self {
            MaidError::SessionNotFound => "session not found".to_string(),
            MaidError::Other(msg) => msg.clone(),
        }
    }
}

impl From<StoreError> for MaidError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => MaidError::SessionNotFound,
            other => MaidError::Other(other.to_string()),
        }
    }
}

/// A pluggable handler selected by `maidId` on connect. `on_abort`/`on_bye` exist for
/// interface completeness; the runtime already owns cancellation and close, so the
/// default chat maid leaves them as no-ops.
#[async_trait]
pub trait MaidHandler: Send + Sync {
    async fn on_welcome(&self, ctx: &TurnContext, session_id: Option<i64>) -> Result<(), MaidError>;

    async fn on_input(
        &self,
        ctx: &TurnContext,
        session_id: Option<i64>,
        content: String,
    ) -> Result<(), MaidError>;

    async fn on_abort(&self, _ctx: &TurnContext) {}

    async fn on_bye(&self, _ctx: &TurnContext) {}
}

/// The one registered maid: a general-purpose conversational assistant conditioned on
/// recent history and related memories.
pub struct ChatMaid;

#[async_trait]
impl MaidHandler for ChatMaid {
    async fn on_welcome(&self, ctx: &TurnContext, session_id: Option<i64>) -> Result<(), MaidError> {
        let (session, created) = ctx.sessions.ensure_session(&ctx.user_id, session_id).await?;
        *ctx.current_session_id.lock().unwrap() = Some(session.id);

        if created {
            ctx.emit
                .send(ServerMessage::SessionCreated {
                    session_id: session.id,
                })
                .ok();
        }

        let history = ctx
            .sessions
            .recent_messages_across_sessions(&ctx.user_id, CROSS_SESSION_HISTORY_LIMIT)
            .await?;
        let memories = ctx
            .memories
            .recent_memories(&ctx.user_id, RECENT_MEMORIES_LIMIT)
            .await?;

        let mut history: Vec<_> = history;
        history.reverse();

        let mut prompt = String::from(
            "You are a warm, attentive assistant picking up a conversation with a \
             returning user. Use what you remember about them where it is relevant, \
             without stating the obvious.\n\n",
        );
        prompt.push_str("<memories>\n");
        for memory in &memories {
            prompt.push_str(&memory.content);
            prompt.push('\n');
        }
        prompt.push_str("</memories>\n\n<history>\n");
        for message in &history {
            prompt.push_str(&format!("[{}]: {}\n", message.role, message.content));
        }
        prompt.push_str("</history>\n\nWrite a natural first message to greet the user.");

        respond_with_stream(ctx, session, prompt).await
    }

    async fn on_input(
        &self,
        ctx: &TurnContext,
        session_id: Option<i64>,
        content: String,
    ) -> Result<(), MaidError> {
        let (session, created) = ctx.sessions.ensure_session(&ctx.user_id, session_id).await?;
        *ctx.current_session_id.lock().unwrap() = Some(session.id);

        if created {
            ctx.emit
                .send(ServerMessage::SessionCreated {
                    session_id: session.id,
                })
                .ok();
        }

        ctx.sessions
            .save_message(session.id, MessageRole::User, &content)
            .await?;

        let mut history = ctx
            .sessions
            .recent_messages_in_session(session.id, SAME_SESSION_HISTORY_LIMIT + 1)
            .await?;
        // The message we just saved sits at index 0 in the desc-ordered result; drop it,
        // the trailing `[user]:` line below carries it instead.
        if !history.is_empty() {
            history.remove(0);
        }
        history.reverse();

        let related = ctx
            .memories
            .related_memories(&ctx.user_id, &content, Some(0.0))
            .await
            .map_err(|e| MaidError::Other(e.to_string()))?;

        let mut prompt = String::from("<memories>\n");
        for nearby in &related {
            prompt.push_str(&nearby.memory.content);
            prompt.push('\n');
        }
        prompt.push_str("</memories>\n\n<history>\n");
        for message in &history {
            prompt.push_str(&format!("[{}]: {}\n", message.role, message.content));
        }
        prompt.push_str(&format!("</history>\n\n[user]: {content}\n"));

        respond_with_stream(ctx, session, prompt).await
    }
}

/// The shared turn pipeline: stream the model's response, forward deltas, and on normal
/// completion persist the assistant message and signal extraction. Callers save their
/// own user-role message (if any) before invoking this, since that happens ahead of
/// prompt assembly.
async fn respond_with_stream(
    ctx: &TurnContext,
    session: Session,
    prompt: String,
) -> Result<(), MaidError> {
    ctx.emit.send(ServerMessage::StreamStart).ok();

    let mut handle = ctx
        .llm
        .stream_response(&prompt, None)
        .await
        .map_err(|e| MaidError::Other(e.to_string()))?;

    // Grabbed before `events()` below takes `handle` mutably for the life of the stream;
    // this is how cancellation reaches a handle we're concurrently iterating.
    let abort_trigger = handle.abort_trigger();

    let mut accumulated = String::new();
    let mut events = handle.events();
    let mut terminal_error = None;
    let mut aborted = false;
    let mut abort_requested = false;

    loop {
        let event = if abort_requested {
            events.next().await
        } else {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    abort_trigger();
                    abort_requested = true;
                    continue;
                }
                event = events.next() => event,
            }
        };

        match event {
            Some(StreamEvent::TextDelta(delta)) => {
                accumulated.push_str(&delta);
                ctx.emit
                    .send(ServerMessage::StreamTextDelta { delta })
                    .ok();
            }
            Some(StreamEvent::Completed) => break,
            Some(StreamEvent::Aborted) | None => {
                aborted = true;
                break;
            }
            Some(StreamEvent::Error(err)) => {
                terminal_error = Some(err.to_string());
                break;
            }
        }
    }
    drop(events);

    if aborted {
        return Ok(());
    }
    if let Some(message) = terminal_error {
        return Err(MaidError::Other(message));
    }

    ctx.emit
        .send(ServerMessage::StreamDone {
            session_id: session.id,
        })
        .ok();

    if !accumulated.trim().is_empty() {
        if let Err(err) = ctx
            .sessions
            .save_message(session.id, MessageRole::Assistant, &accumulated)
            .await
        {
            error!(error = %err, session_id = session.id, "failed to persist assistant message");
        }
    }

    let user_id = ctx.user_id.clone();
    let memories = Arc::clone(&ctx.memories);
    tokio::spawn(async move {
        if let Err(err) = memories.signal_extraction(&user_id).await {
            warn!(error = %err, user_id, "failed to signal extraction queue");
        }
    });

    Ok(())
}

/// Dynamic dispatch by `maidId`. New handlers are registered here at startup; the
/// runtime resolves `maidId` against this map once, at upgrade time.
pub static MAIDS: Lazy<HashMap<&'static str, Arc<dyn MaidHandler>>> = Lazy::new(|| {
    let mut map: HashMap<&'static str, Arc<dyn MaidHandler>> = HashMap::new();
    map.insert("chat", Arc::new(ChatMaid));
    map
});

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn session_not_found_message_matches_close_reason() {
        assert_eq!(MaidError::SessionNotFound.message(), "session not found");
    }

    #[test]
    fn store_not_found_maps_to_session_not_found() {
        let err: MaidError = StoreError::NotFound.into();
        assert!(matches!(err, MaidError::SessionNotFound));
    }

    #[test]
    fn other_store_errors_map_to_other() {
        let err: MaidError = StoreError::Connection("timeout".to_string()).into();
        assert!(matches!(err, MaidError::Other(_)));
    }

    #[test]
    fn registered_maids_contains_chat() {
        assert!(MAIDS.contains_key("chat"));
    }
}
