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

//! Chat server error handling.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use thiserror;

use chat_core::llm::LlmGatewayError;
use chat_core::settings::SettingsError;
use chat_core::store::StoreError;
use chat_extraction::ExtractionError;
use chat_queue_redis::QueueError;

/// Abstraction over all errors that can occur in the chat server. This allows using `?`
/// error handling everywhere for every known error type.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// generic error represented by an error message
    #[error("{0}")]
    GenericError(String),
    /// the caller asked for a session it does not own, or that does not exist
    #[error("session not found")]
    SessionNotFound,
    /// the bearer token could not be resolved to a user, or was missing
    #[error("unauthorized")]
    Unauthorized,
    /// error resulting from settings
    #[error(transparent)]
    SettingsError(#[from] SettingsError),
    /// error resulting from the store
    #[error(transparent)]
    StoreError(#[from] StoreError),
    /// error resulting from the LLM gateway
    #[error(transparent)]
    LlmGatewayError(#[from] LlmGatewayError),
    /// error resulting from the extraction pipeline
    #[error(transparent)]
    ExtractionError(#[from] ExtractionError),
    /// error resulting from the extraction queue
    #[error(transparent)]
    QueueError(#[from] QueueError),
    /// error resulting from a redis connection
    #[error(transparent)]
    RedisError(#[from] redis::RedisError),
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = match self {
            ChatError::SessionNotFound => StatusCode::NOT_FOUND,
            ChatError::Unauthorized => StatusCode::UNAUTHORIZED,
            ChatError::StoreError(StoreError::NotFound) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(json!({ "message": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn gen_chat_settings_error() -> Result<(), ChatError> {
        let _ = gen_settings_error()?;
        Ok(())
    }

    fn gen_settings_error() -> Result<(), SettingsError> {
        Err(SettingsError::AlreadyInitialised)
    }

    #[test]
    fn from_settings_error() {
        assert_eq!(
            format!("{:?}", gen_chat_settings_error()),
            "Err(SettingsError(AlreadyInitialised))".to_string(),
        );
    }

    fn gen_chat_store_error() -> Result<(), ChatError> {
        let _ = gen_store_error()?;
        Ok(())
    }

    fn gen_store_error() -> Result<(), StoreError> {
        Err(StoreError::NotFound)
    }

    #[test]
    fn from_store_error() {
        assert_eq!(
            format!("{:?}", gen_chat_store_error()),
            "Err(StoreError(NotFound))".to_string(),
        );
    }

    #[test]
    fn session_not_found_maps_to_404() {
        let response = ChatError::SessionNotFound.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn unauthorized_maps_to_401() {
        let response = ChatError::Unauthorized.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
