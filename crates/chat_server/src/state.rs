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

//! The shared collaborators every route needs, handed to axum as [`axum::extract::State`].
//!
//! The two `/*/health` routes ping their backend through [`HealthCheck`] rather than
//! `Store`/`ExtractionSignaler`'s business-logic surface, so tests can swap in fakes
//! without standing up a real Postgres or Redis.

use std::sync::Arc;
use std::time::Duration;

use chat_core::settings::Settings;
use chat_core::store::StoreError;
use chat_core::{HealthCheck, LlmGateway, Store};
use chat_extraction::{ExtractionConfig, ExtractionPipeline};
use chat_queue_redis::{ExtractionQueue, ExtractionSignaler, QueueConfig, RedisBackend};
use chat_store_pg::PgStore;

use crate::auth::{AuthService, HttpAuthService};
use crate::connection_keys::ConnectionKeyStore;
use crate::services::{MemoryService, SessionService};

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionService>,
    pub memories: Arc<MemoryService>,
    pub llm: Arc<dyn LlmGateway>,
    pub auth: Arc<dyn AuthService>,
    pub connection_keys: Arc<ConnectionKeyStore>,
    pub db: Arc<dyn HealthCheck>,
    pub queue_backend: Arc<dyn HealthCheck>,
}

/// The reaper-loop side of wiring, kept out of [`AppState`] (and so out of every route
/// handler's reach) since it's concrete in `RedisBackend` rather than type-erased behind
/// `ExtractionSignaler` -- `serve` needs the concrete type to call `run_worker`.
pub struct ExtractionWorker {
    pub queue: Arc<ExtractionQueue<RedisBackend>>,
    pub pipeline: Arc<ExtractionPipeline>,
}

impl AppState {
    /// Wires up every collaborator from `settings`: connects to Postgres and Redis,
    /// builds the LLM gateway and auth client, and returns the handle routes share
    /// alongside the reaper-loop handles `serve` spawns separately.
    pub async fn connect(settings: &Settings) -> Result<(Self, ExtractionWorker), StoreError> {
        let db = Arc::new(PgStore::connect(&settings.database_url).await?);
        let queue_backend = RedisBackend::connect(&settings.redis_url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let llm: Arc<dyn LlmGateway> = Arc::new(chat_llm_gateway::HttpLlmGateway::new(
            chat_llm_gateway::GatewayConfig {
                base_url: settings.llm_base_url.clone(),
                api_key: settings.llm_api_key.clone(),
                chat_model: settings.llm_chat_model.clone(),
                embedding_model: settings.llm_embedding_model.clone(),
            },
        ));

        let store: Arc<dyn Store> = Arc::clone(&db);

        let extraction_queue = Arc::new(ExtractionQueue::new(
            queue_backend.clone(),
            QueueConfig {
                debounce_delay_ms: settings.memory_queue_debounce_delay_ms,
                max_attempts: settings.memory_queue_attempts,
                lock_lease_ms: 30_000,
            },
        ));
        let queue: Arc<dyn ExtractionSignaler> = Arc::clone(&extraction_queue) as Arc<dyn ExtractionSignaler>;

        let extraction_pipeline = Arc::new(ExtractionPipeline::new(
            Arc::clone(&store),
            Arc::clone(&llm),
            ExtractionConfig {
                threshold: settings.memory_extraction_threshold,
                top_k: settings.memory_extraction_top_k,
                max_retries: settings.memory_extraction_retries,
            },
        ));

        let sessions = Arc::new(SessionService::new(Arc::clone(&store)));
        let memories = Arc::new(MemoryService::new(
            store,
            Arc::clone(&llm),
            queue,
            settings.memory_extraction_threshold,
            settings.memory_extraction_top_k,
        ));

        let auth: Arc<dyn AuthService> = Arc::new(HttpAuthService::new(
            settings.better_auth_url.clone(),
            settings.auth_origin.clone(),
        ));

        let connection_keys = Arc::new(ConnectionKeyStore::new(Duration::from_millis(
            settings.ws_connection_key_ttl_ms,
        )));

        let db_health: Arc<dyn HealthCheck> = db;
        let queue_health: Arc<dyn HealthCheck> = Arc::new(queue_backend);

        let state = AppState {
            sessions,
            memories,
            llm,
            auth,
            connection_keys,
            db: db_health,
            queue_backend: queue_health,
        };
        let worker = ExtractionWorker {
            queue: extraction_queue,
            pipeline: extraction_pipeline,
        };

        Ok((state, worker))
    }
}
