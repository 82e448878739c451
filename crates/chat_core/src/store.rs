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

//! The relational store, as an external collaborator: transactional reads/writes over
//! sessions, messages, and memories, plus an indexed cosine-distance vector search.

use thiserror::Error;
use time::OffsetDateTime;

use crate::domain::{Memory, Message, MessageRole, Session};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("not found")]
    NotFound,
}

/// A memory returned from [`Store::find_nearby_memories`], annotated with its cosine
/// distance from the query embedding (`0` = identical, `2` = opposite).
#[derive(Debug, Clone, PartialEq)]
pub struct NearbyMemory {
    pub memory: Memory,
    pub distance: f32,
}

/// One resolved mutation to apply to the memory table, as decided by the extraction
/// pipeline's reconciliation stage. Real store IDs only -- the LLM-facing temp IDs are
/// resolved by the caller before this point.
#[derive(Debug, Clone, PartialEq)]
pub enum MemoryAction {
    Add {
        content: String,
        embedding: Vec<f32>,
    },
    Update {
        id: i64,
        content: String,
        embedding: Vec<f32>,
    },
    Delete {
        id: i64,
    },
}

/// Tally of what an extraction run's memory transaction actually did, for logging and
/// tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionTxStats {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
}

#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn insert_session(&self, user_id: &str) -> Result<Session, StoreError>;

    async fn find_session(
        &self,
        session_id: i64,
        user_id: &str,
    ) -> Result<Option<Session>, StoreError>;

    async fn append_message(
        &self,
        session_id: i64,
        role: MessageRole,
        content: &str,
        metadata: serde_json::Value,
    ) -> Result<Message, StoreError>;

    /// Ordered desc by `(created_at, id)`.
    async fn list_messages_by_session(
        &self,
        session_id: i64,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError>;

    /// Ordered desc by `(created_at, id)`, spanning every session owned by `user_id`.
    async fn list_messages_across_user_sessions(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError>;

    /// Messages with `extracted_at IS NULL` across the user's sessions, ordered asc by
    /// `created_at`.
    async fn list_pending_messages(&self, user_id: &str) -> Result<Vec<Message>, StoreError>;

    async fn mark_messages_extracted(
        &self,
        ids: &[i64],
        timestamp: OffsetDateTime,
    ) -> Result<(), StoreError>;

    /// Ordered asc by distance; `d_max` bounds cosine distance, `top_k` bounds result count.
    async fn find_nearby_memories(
        &self,
        user_id: &str,
        embedding: &[f32],
        d_max: f32,
        top_k: i64,
    ) -> Result<Vec<NearbyMemory>, StoreError>;

    /// Ordered desc by `(updated_at, id)`.
    async fn list_recent_memories(&self, user_id: &str, limit: i64) -> Result<Vec<Memory>, StoreError>;

    /// Applies a batch of reconciled memory mutations in a single transaction, committing
    /// all-or-nothing. This is the one place the store needs transactional semantics
    /// beyond a single statement, so it is exposed as a dedicated operation rather than a
    /// generic `with_transaction(fn)` escape hatch (see DESIGN.md).
    async fn apply_memory_actions(
        &self,
        user_id: &str,
        actions: Vec<MemoryAction>,
    ) -> Result<ExtractionTxStats, StoreError>;
}
