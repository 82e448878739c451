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

//! User identity resolution, treated as an opaque external collaborator: the only
//! capability the rest of the server needs is "does this bearer token belong to a
//! user, and if so which one". How that's actually verified lives behind a trait so
//! the runtime and routes never depend on the specifics of the auth provider.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing or malformed bearer token")]
    Missing,
    #[error("bearer token is invalid or expired")]
    Invalid,
    #[error("failed to reach the auth service: {0}")]
    Transport(String),
}

#[async_trait]
pub trait AuthService: Send + Sync {
    /// Resolves a raw `Authorization: Bearer <token>` value (token only, no `Bearer `
    /// prefix) to the user id it belongs to.
    async fn resolve_user(&self, bearer: &str) -> Result<String, AuthError>;
}

/// Verifies a session against a `better-auth`-compatible session endpoint
/// (`GET {base_url}/api/auth/get-session`), forwarding the bearer token and the
/// configured origin.
pub struct HttpAuthService {
    client: reqwest::Client,
    base_url: String,
    origin: String,
}

impl HttpAuthService {
    pub fn new(base_url: String, origin: String) -> Self {
        HttpAuthService {
            client: reqwest::Client::new(),
            base_url,
            origin,
        }
    }
}

#[derive(Deserialize)]
struct SessionResponse {
    user: SessionUser,
}

#[derive(Deserialize)]
struct SessionUser {
    id: String,
}

#[async_trait]
impl AuthService for HttpAuthService {
    async fn resolve_user(&self, bearer: &str) -> Result<String, AuthError> {
        if bearer.is_empty() {
            return Err(AuthError::Missing);
        }

        let url = format!("{}/api/auth/get-session", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(bearer)
            .header("Origin", &self.origin)
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(AuthError::Invalid);
        }
        if !response.status().is_success() {
            return Err(AuthError::Transport(format!(
                "auth service returned status {}",
                response.status()
            )));
        }

        let session: SessionResponse = response
            .json()
            .await
            .map_err(|_| AuthError::Invalid)?;

        Ok(session.user.id)
    }
}

/// Extracts the raw token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header_value: &str) -> Result<&str, AuthError> {
    header_value.strip_prefix("Bearer ").ok_or(AuthError::Missing)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn extracts_token_from_bearer_header() {
        assert_eq!(bearer_token("Bearer abc123").unwrap(), "abc123");
    }

    #[test]
    fn rejects_header_without_bearer_prefix() {
        assert!(bearer_token("abc123").is_err());
        assert!(bearer_token("Basic abc123").is_err());
    }
}
