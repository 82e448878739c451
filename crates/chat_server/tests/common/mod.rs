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

//! Fakes for every external collaborator, plus a helper that serves [`AppState`] on a
//! real TCP listener so tests can drive it with an actual websocket client.

#![allow(dead_code)]

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use time::OffsetDateTime;
use tokio::net::TcpListener;

use chat_core::llm::{LlmGatewayError, StreamEvent, StreamHandle};
use chat_core::store::{ExtractionTxStats, MemoryAction, NearbyMemory, StoreError};
use chat_core::{HealthCheck, LlmGateway, Memory, Message, MessageRole, Session, Store};
use chat_queue_redis::{ExtractionSignaler, QueueError};
use chat_server::auth::{AuthError, AuthService};
use chat_server::connection_keys::ConnectionKeyStore;
use chat_server::services::{MemoryService, SessionService};
use chat_server::state::AppState;

/// An in-memory [`Store`], enough to exercise session/message/memory flows without a
/// database. Every lookup filters on `user_id`, so there is no cross-tenant isolation
/// bug to accidentally hide here.
#[derive(Default)]
pub struct FakeStore {
    next_id: AtomicI64,
    sessions: Mutex<HashMap<i64, Session>>,
    messages: Mutex<Vec<Message>>,
    memories: Mutex<HashMap<i64, Memory>>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl Store for FakeStore {
    async fn insert_session(&self, user_id: &str) -> Result<Session, StoreError> {
        let now = OffsetDateTime::now_utc();
        let session = Session {
            id: self.fresh_id(),
            user_id: user_id.to_string(),
            title: None,
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        };
        self.sessions.lock().unwrap().insert(session.id, session.clone());
        Ok(session)
    }

    async fn find_session(
        &self,
        session_id: i64,
        user_id: &str,
    ) -> Result<Option<Session>, StoreError> {
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .get(&session_id)
            .filter(|s| s.user_id == user_id)
            .cloned())
    }

    async fn append_message(
        &self,
        session_id: i64,
        role: MessageRole,
        content: &str,
        metadata: serde_json::Value,
    ) -> Result<Message, StoreError> {
        let now = OffsetDateTime::now_utc();
        let message = Message {
            id: self.fresh_id(),
            session_id,
            role,
            content: content.to_string(),
            metadata,
            extracted_at: None,
            created_at: now,
            updated_at: now,
        };
        self.messages.lock().unwrap().push(message.clone());
        Ok(message)
    }

    async fn list_messages_by_session(
        &self,
        session_id: i64,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        let mut messages: Vec<Message> = self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        messages.truncate(limit.max(0) as usize);
        Ok(messages)
    }

    async fn list_messages_across_user_sessions(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        let owned_sessions: Vec<i64> = self
            .sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.user_id == user_id)
            .map(|s| s.id)
            .collect();
        let mut messages: Vec<Message> = self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| owned_sessions.contains(&m.session_id))
            .cloned()
            .collect();
        messages.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        messages.truncate(limit.max(0) as usize);
        Ok(messages)
    }

    async fn list_pending_messages(&self, user_id: &str) -> Result<Vec<Message>, StoreError> {
        let owned_sessions: Vec<i64> = self
            .sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.user_id == user_id)
            .map(|s| s.id)
            .collect();
        let mut messages: Vec<Message> = self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| owned_sessions.contains(&m.session_id) && m.extracted_at.is_none())
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(messages)
    }

    async fn mark_messages_extracted(
        &self,
        ids: &[i64],
        timestamp: OffsetDateTime,
    ) -> Result<(), StoreError> {
        let mut messages = self.messages.lock().unwrap();
        for message in messages.iter_mut() {
            if ids.contains(&message.id) {
                message.extracted_at = Some(timestamp);
            }
        }
        Ok(())
    }

    async fn find_nearby_memories(
        &self,
        _user_id: &str,
        _embedding: &[f32],
        _d_max: f32,
        _top_k: i64,
    ) -> Result<Vec<NearbyMemory>, StoreError> {
        Ok(vec![])
    }

    async fn list_recent_memories(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<Memory>, StoreError> {
        let mut memories: Vec<Memory> = self
            .memories
            .lock()
            .unwrap()
            .values()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect();
        memories.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        memories.truncate(limit.max(0) as usize);
        Ok(memories)
    }

    async fn apply_memory_actions(
        &self,
        user_id: &str,
        actions: Vec<MemoryAction>,
    ) -> Result<ExtractionTxStats, StoreError> {
        let mut stats = ExtractionTxStats::default();
        let mut memories = self.memories.lock().unwrap();
        for action in actions {
            match action {
                MemoryAction::Add { content, embedding } => {
                    let id = self.fresh_id();
                    let now = OffsetDateTime::now_utc();
                    memories.insert(
                        id,
                        Memory {
                            id,
                            user_id: user_id.to_string(),
                            content,
                            embedding,
                            metadata: serde_json::json!({}),
                            created_at: now,
                            updated_at: now,
                        },
                    );
                    stats.added += 1;
                }
                MemoryAction::Update { id, content, embedding } => {
                    if let Some(memory) = memories.get_mut(&id) {
                        memory.content = content;
                        memory.embedding = embedding;
                        memory.updated_at = OffsetDateTime::now_utc();
                        stats.updated += 1;
                    }
                }
                MemoryAction::Delete { id } => {
                    if memories.remove(&id).is_some() {
                        stats.deleted += 1;
                    }
                }
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl HealthCheck for FakeStore {
    async fn is_healthy(&self) -> bool {
        true
    }
}

/// An [`LlmGateway`] that streams back a fixed reply word-by-word, never calls out to
/// any network, and honors abort: each word yields to the executor first, so a
/// concurrently-issued `abort()` is observed before the next delta is produced.
pub struct FakeLlmGateway {
    reply: String,
}

impl FakeLlmGateway {
    pub fn new(reply: impl Into<String>) -> Self {
        FakeLlmGateway { reply: reply.into() }
    }
}

#[async_trait]
impl LlmGateway for FakeLlmGateway {
    async fn stream_response(
        &self,
        _prompt: &str,
        _instructions: Option<&str>,
    ) -> Result<Box<dyn StreamHandle>, LlmGatewayError> {
        Ok(Box::new(FakeStreamHandle {
            words: self.reply.split_whitespace().map(str::to_string).collect(),
            aborted: Arc::new(AtomicBool::new(false)),
        }))
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmGatewayError> {
        Ok(texts.iter().map(|_| vec![0.0_f32; 8]).collect())
    }

    async fn generate_structured(&self, _prompt: &str) -> Result<String, LlmGatewayError> {
        Ok("NONE".to_string())
    }
}

struct FakeStreamHandle {
    words: Vec<String>,
    aborted: Arc<AtomicBool>,
}

impl StreamHandle for FakeStreamHandle {
    fn events(&mut self) -> Pin<Box<dyn Stream<Item = StreamEvent> + Send + '_>> {
        let words = std::mem::take(&mut self.words).into_iter();
        let aborted = Arc::clone(&self.aborted);

        Box::pin(futures::stream::unfold(
            (words, aborted, false),
            |(mut words, aborted, done)| async move {
                if done {
                    return None;
                }
                tokio::task::yield_now().await;
                if aborted.load(Ordering::SeqCst) {
                    return Some((StreamEvent::Aborted, (words, aborted, true)));
                }
                match words.next() {
                    Some(word) => {
                        Some((StreamEvent::TextDelta(format!("{word} ")), (words, aborted, false)))
                    }
                    None => Some((StreamEvent::Completed, (words, aborted, true))),
                }
            },
        ))
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    fn abort_trigger(&self) -> Arc<dyn Fn() + Send + Sync> {
        let aborted = Arc::clone(&self.aborted);
        Arc::new(move || aborted.store(true, Ordering::SeqCst))
    }
}

/// Resolves every non-empty bearer token to a user id equal to the token itself, so
/// tests can pick whatever identity they need just by choosing a token.
pub struct FakeAuthService;

#[async_trait]
impl AuthService for FakeAuthService {
    async fn resolve_user(&self, bearer: &str) -> Result<String, AuthError> {
        if bearer.is_empty() {
            return Err(AuthError::Missing);
        }
        Ok(bearer.to_string())
    }
}

/// Counts how many times extraction was signaled, per user, without running any queue
/// machinery -- the queue and pipeline themselves are exercised by their own crates'
/// tests.
#[derive(Default)]
pub struct CountingSignaler {
    pub calls: Mutex<Vec<String>>,
}

#[async_trait]
impl ExtractionSignaler for CountingSignaler {
    async fn signal(&self, user_id: &str) -> Result<(), QueueError> {
        self.calls.lock().unwrap().push(user_id.to_string());
        Ok(())
    }
}

struct AlwaysHealthy;

#[async_trait]
impl HealthCheck for AlwaysHealthy {
    async fn is_healthy(&self) -> bool {
        true
    }
}

/// Builds an [`AppState`] wired entirely to fakes -- no Postgres, no Redis, no network
/// calls -- and serves it on an ephemeral localhost port.
///
/// Returns the base HTTP URL (`http://127.0.0.1:<port>`) the server is listening on.
pub async fn spawn_test_server(llm_reply: &str) -> String {
    let store: Arc<dyn Store> = Arc::new(FakeStore::new());
    let llm: Arc<dyn LlmGateway> = Arc::new(FakeLlmGateway::new(llm_reply));
    let auth: Arc<dyn AuthService> = Arc::new(FakeAuthService);
    let signaler: Arc<dyn ExtractionSignaler> = Arc::new(CountingSignaler::default());

    let sessions = Arc::new(SessionService::new(Arc::clone(&store)));
    let memories = Arc::new(MemoryService::new(
        Arc::clone(&store),
        Arc::clone(&llm),
        signaler,
        0.7,
        5,
    ));
    let connection_keys = Arc::new(ConnectionKeyStore::new(Duration::from_secs(60)));

    let state = AppState {
        sessions,
        memories,
        llm,
        auth,
        connection_keys,
        db: Arc::new(FakeStore::new()),
        queue_backend: Arc::new(AlwaysHealthy),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    let app = chat_server::routes::routes(state);

    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    format!("http://{addr}")
}
