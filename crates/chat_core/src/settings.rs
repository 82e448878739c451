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

//! Process-wide configuration, sourced from environment variables.
//!
//! Mirrors the lazily-initialized, deref-through singleton shape used elsewhere in this
//! codebase: call [`SETTINGS`]`.write().await.init()` once at startup, then read through
//! the deref.

use std::ops::{Deref, DerefMut};

use once_cell::sync::Lazy;
use thiserror::Error;
use tokio::sync::RwLock;

/// The process-wide settings singleton. Lazily initialized; panics if read before
/// [`StaticSettings::init`] has run.
pub static SETTINGS: Lazy<RwLock<StaticSettings>> = Lazy::new(Default::default);

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("missing required environment variable: {0}")]
    MissingVar(String),

    #[error("invalid value for environment variable {name}: {reason}")]
    InvalidVar { name: String, reason: String },

    #[error("global settings have already been initialised")]
    AlreadyInitialised,
}

/// Tunable, environment-sourced parameters (spec.md's environment variable table).
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub redis_url: String,
    pub port: u16,

    /// Base URL of the external auth service; user identity resolution itself is out of
    /// scope here (see `AuthService`), but the endpoint is still process configuration.
    pub better_auth_url: String,
    pub auth_origin: String,

    pub llm_base_url: String,
    pub llm_api_key: String,
    pub llm_chat_model: String,
    pub llm_embedding_model: String,

    pub memory_queue_debounce_delay_ms: u64,
    pub memory_queue_attempts: u32,
    pub memory_extraction_threshold: f32,
    pub memory_extraction_top_k: i64,
    pub memory_extraction_retries: u32,
    pub ws_connection_key_ttl_ms: u64,
    pub app_shutdown_timeout_ms: u64,

    pub embedding_dim: usize,
}

impl Settings {
    pub fn from_env() -> Result<Self, SettingsError> {
        Ok(Settings {
            database_url: require_var("DATABASE_URL")?,
            redis_url: require_var("REDIS_URL")?,
            port: parse_var("PORT", 3000)?,

            better_auth_url: std::env::var("BETTER_AUTH_URL")
                .unwrap_or_else(|_| "http://localhost:3001".to_string()),
            auth_origin: std::env::var("AUTH_ORIGIN")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),

            llm_base_url: std::env::var("LLM_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            llm_api_key: std::env::var("LLM_API_KEY").unwrap_or_default(),
            llm_chat_model: std::env::var("CHAT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            llm_embedding_model: std::env::var("EMBEDDING_MODEL")
                .unwrap_or_else(|_| "text-embedding-3-small".to_string()),

            memory_queue_debounce_delay_ms: parse_var("MEMORY_QUEUE_DEBOUNCE_DELAY_MS", 3000)?,
            memory_queue_attempts: parse_var("MEMORY_QUEUE_ATTEMPTS", 3)?,
            memory_extraction_threshold: parse_var("MEMORY_EXTRACTION_THRESHOLD", 0.7)?,
            memory_extraction_top_k: parse_var("MEMORY_EXTRACTION_TOP_K", 5)?,
            memory_extraction_retries: parse_var("MEMORY_EXTRACTION_RETRIES", 3)?,
            ws_connection_key_ttl_ms: parse_var("WS_CONNECTION_KEY_TTL_MS", 60_000)?,
            app_shutdown_timeout_ms: parse_var("APP_SHUTDOWN_TIMEOUT_MS", 10_000)?,

            embedding_dim: parse_var("MEMORY_EMBEDDING_DIM", 1024)?,
        })
    }

    /// Builds settings directly from a fixed map, bypassing the process environment.
    /// Used by tests that need a `Settings` without mutating global env state.
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Result<Self, SettingsError> {
        let get = |name: &str| pairs.iter().find(|(k, _)| *k == name).map(|(_, v)| *v);

        Ok(Settings {
            database_url: get("DATABASE_URL")
                .ok_or_else(|| SettingsError::MissingVar("DATABASE_URL".into()))?
                .to_string(),
            redis_url: get("REDIS_URL")
                .ok_or_else(|| SettingsError::MissingVar("REDIS_URL".into()))?
                .to_string(),
            port: parse_opt("PORT", get("PORT"), 3000)?,
            better_auth_url: get("BETTER_AUTH_URL")
                .unwrap_or("http://localhost:3001")
                .to_string(),
            auth_origin: get("AUTH_ORIGIN")
                .unwrap_or("http://localhost:3000")
                .to_string(),
            llm_base_url: get("LLM_BASE_URL")
                .unwrap_or("https://api.openai.com/v1")
                .to_string(),
            llm_api_key: get("LLM_API_KEY").unwrap_or("").to_string(),
            llm_chat_model: get("CHAT_MODEL").unwrap_or("gpt-4o-mini").to_string(),
            llm_embedding_model: get("EMBEDDING_MODEL")
                .unwrap_or("text-embedding-3-small")
                .to_string(),
            memory_queue_debounce_delay_ms: parse_opt(
                "MEMORY_QUEUE_DEBOUNCE_DELAY_MS",
                get("MEMORY_QUEUE_DEBOUNCE_DELAY_MS"),
                3000,
            )?,
            memory_queue_attempts: parse_opt(
                "MEMORY_QUEUE_ATTEMPTS",
                get("MEMORY_QUEUE_ATTEMPTS"),
                3,
            )?,
            memory_extraction_threshold: parse_opt(
                "MEMORY_EXTRACTION_THRESHOLD",
                get("MEMORY_EXTRACTION_THRESHOLD"),
                0.7,
            )?,
            memory_extraction_top_k: parse_opt(
                "MEMORY_EXTRACTION_TOP_K",
                get("MEMORY_EXTRACTION_TOP_K"),
                5,
            )?,
            memory_extraction_retries: parse_opt(
                "MEMORY_EXTRACTION_RETRIES",
                get("MEMORY_EXTRACTION_RETRIES"),
                3,
            )?,
            ws_connection_key_ttl_ms: parse_opt(
                "WS_CONNECTION_KEY_TTL_MS",
                get("WS_CONNECTION_KEY_TTL_MS"),
                60_000,
            )?,
            app_shutdown_timeout_ms: parse_opt(
                "APP_SHUTDOWN_TIMEOUT_MS",
                get("APP_SHUTDOWN_TIMEOUT_MS"),
                10_000,
            )?,
            embedding_dim: parse_opt("MEMORY_EMBEDDING_DIM", get("MEMORY_EMBEDDING_DIM"), 1024)?,
        })
    }
}

fn require_var(name: &str) -> Result<String, SettingsError> {
    std::env::var(name).map_err(|_| SettingsError::MissingVar(name.to_string()))
}

fn parse_var<T>(name: &str, default: T) -> Result<T, SettingsError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    parse_opt(name, std::env::var(name).ok(), default)
}

fn parse_opt<T>(name: &str, value: Option<impl AsRef<str>>, default: T) -> Result<T, SettingsError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw.as_ref().parse().map_err(|e: T::Err| SettingsError::InvalidVar {
            name: name.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// The deref-through wrapper around a lazily-initialized [`Settings`]. Mirrors the shape
/// of the teacher's `StaticSettings`, but init reads environment variables instead of a
/// YAML file.
#[derive(Default)]
pub struct StaticSettings {
    inner: Option<Settings>,
}

impl StaticSettings {
    pub fn init(&mut self) -> Result<(), SettingsError> {
        if self.inner.is_none() {
            self.inner = Some(Settings::from_env()?);
        }
        Ok(())
    }

    /// Initializes with an explicit [`Settings`] value, for tests and embedders that
    /// build configuration themselves instead of reading the process environment.
    pub fn init_with(&mut self, settings: Settings) -> Result<(), SettingsError> {
        if self.inner.is_some() {
            return Err(SettingsError::AlreadyInitialised);
        }
        self.inner = Some(settings);
        Ok(())
    }
}

impl Deref for StaticSettings {
    type Target = Settings;

    fn deref(&self) -> &Self::Target {
        self.inner
            .as_ref()
            .expect("settings have not been initialised yet")
    }
}

impl DerefMut for StaticSettings {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner
            .as_mut()
            .expect("settings have not been initialised yet")
    }
}
