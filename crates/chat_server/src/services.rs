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

//! Thin, per-user façades over [`Store`] and the extraction queue. Every method takes
//! the caller's `user_id` and folds it into the underlying query, so a maid handler can
//! never accidentally reach across tenants.

use std::sync::Arc;

use chat_core::store::{NearbyMemory, StoreError};
use chat_core::{LlmGateway, Memory, Message, MessageRole, Session, Store};
use chat_queue_redis::{ExtractionSignaler, QueueError};

/// Per-user session/message operations with ownership checks baked in.
pub struct SessionService {
    store: Arc<dyn Store>,
}

impl SessionService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        SessionService { store }
    }

    /// Resolves `session_id` if given, otherwise creates a fresh session for `user_id`.
    /// Returns the session plus whether it was newly created.
    pub async fn ensure_session(
        &self,
        user_id: &str,
        session_id: Option<i64>,
    ) -> Result<(Session, bool), StoreError> {
        if let Some(id) = session_id {
            return match self.store.find_session(id, user_id).await? {
                Some(session) => Ok((session, false)),
                None => Err(StoreError::NotFound),
            };
        }
        let session = self.store.insert_session(user_id).await?;
        Ok((session, true))
    }

    pub async fn save_message(
        &self,
        session_id: i64,
        role: MessageRole,
        content: &str,
    ) -> Result<Message, StoreError> {
        self.store
            .append_message(session_id, role, content, serde_json::json!({}))
            .await
    }

    pub async fn recent_messages_in_session(
        &self,
        session_id: i64,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        self.store.list_messages_by_session(session_id, limit).await
    }

    pub async fn recent_messages_across_sessions(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        self.store
            .list_messages_across_user_sessions(user_id, limit)
            .await
    }
}

/// Per-user memory retrieval plus the one write surface a connected socket needs: asking
/// the extraction queue to eventually run.
pub struct MemoryService {
    store: Arc<dyn Store>,
    llm: Arc<dyn LlmGateway>,
    queue: Arc<dyn ExtractionSignaler>,
    default_threshold: f32,
    top_k: i64,
}

impl MemoryService {
    pub fn new(
        store: Arc<dyn Store>,
        llm: Arc<dyn LlmGateway>,
        queue: Arc<dyn ExtractionSignaler>,
        default_threshold: f32,
        top_k: i64,
    ) -> Self {
        MemoryService {
            store,
            llm,
            queue,
            default_threshold,
            top_k,
        }
    }

    pub async fn recent_memories(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<Memory>, StoreError> {
        self.store.list_recent_memories(user_id, limit).await
    }

    /// Embeds `query` and returns the nearest memories within `threshold` similarity
    /// (`None` falls back to the deployment default). `threshold = 0` returns the
    /// nearest `top_k` regardless of similarity.
    pub async fn related_memories(
        &self,
        user_id: &str,
        query: &str,
        threshold: Option<f32>,
    ) -> Result<Vec<NearbyMemory>, MemoryServiceError> {
        let threshold = threshold.unwrap_or(self.default_threshold);
        let d_max = 1.0 - threshold;
        let embeddings = self
            .llm
            .embed(&[query.to_string()])
            .await
            .map_err(MemoryServiceError::Llm)?;
        let embedding = embeddings
            .into_iter()
            .next()
            .ok_or_else(|| MemoryServiceError::Llm(chat_core::llm::LlmGatewayError::MalformedResponse(
                "embed returned no vectors".to_string(),
            )))?;
        self.store
            .find_nearby_memories(user_id, &embedding, d_max, self.top_k)
            .await
            .map_err(MemoryServiceError::Store)
    }

    /// Fire-and-forget: tells the queue extraction work is available for this user.
    /// Failures are the caller's responsibility to log, never to propagate into the
    /// turn pipeline.
    pub async fn signal_extraction(&self, user_id: &str) -> Result<(), QueueError> {
        self.queue.signal(user_id).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MemoryServiceError {
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Llm(chat_core::llm::LlmGatewayError),
}
