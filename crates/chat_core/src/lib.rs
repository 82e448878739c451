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

//! Shared domain types and external-collaborator traits for the chat backend.
//!
//! This crate has no opinion on how messages are persisted or how completions are
//! generated; it only describes the shapes (`Session`, `Message`, `Memory`) and the
//! capabilities (`Store`, `LlmGateway`) that the rest of the workspace builds on.

pub mod domain;
pub mod llm;
pub mod settings;
pub mod store;

pub use domain::{ConnectionKeyEntry, Memory, Message, MessageRole, Session};
pub use llm::{LlmGateway, LlmGatewayError, StreamEvent, StreamHandle};
pub use store::{NearbyMemory, Store, StoreError};

/// A cheap liveness probe for an external collaborator, backing the `/db/health` and
/// `/redis/health` routes. Kept separate from [`Store`] and the extraction queue's
/// signaling trait so those stay focused on business operations.
#[async_trait::async_trait]
pub trait HealthCheck: Send + Sync {
    async fn is_healthy(&self) -> bool;
}
