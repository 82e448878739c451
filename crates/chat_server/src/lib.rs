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

//! A long-lived WebSocket chat backend: per-connection session runtime plus a
//! debounced background memory-extraction pipeline.

#![deny(unsafe_code)]

use core::future::IntoFuture;
use std::process::exit;

use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use utoipa::OpenApi;

use chat_core::settings::{Settings, SETTINGS};

pub mod auth;
pub mod cli;
pub mod connection_keys;
pub mod error;
pub mod graceful_shutdown;
pub mod maid;
pub mod protocol;
pub mod routes;
pub mod runtime;
pub mod services;
pub mod state;

pub use error::ChatError;
pub use state::AppState;

#[derive(OpenApi)]
#[openapi(
    info(title = "Chat server API", description = "WebSocket chat backend with memory extraction."),
    paths(routes::issue_connection_key, routes::db_health, routes::redis_health)
)]
struct ApiDoc;

/// Result of the top-level CLI commands.
pub type ServeResult = Result<(), ChatError>;

/// Main entry point for the server process.
pub fn start(command: &cli::TopLevel) -> ServeResult {
    match &command.subcommand {
        None => start_runtime(&cli::Serve::default()),
        Some(cli::Command::Serve(args)) => start_runtime(args),
        Some(cli::Command::Migrate(_)) => start_migrate(),
        Some(cli::Command::Version(_)) => version(),
    }
}

/// Prints the crate version to stdout.
pub fn version() -> ServeResult {
    println!("{}", env!("CARGO_PKG_VERSION"));
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}

fn load_settings() -> Result<Settings, ChatError> {
    dotenvy::dotenv().ok();
    Settings::from_env().map_err(ChatError::from)
}

fn start_runtime(args: &cli::Serve) -> ServeResult {
    init_tracing();

    let rt = tokio::runtime::Runtime::new().map_err(|err| ChatError::GenericError(err.to_string()))?;
    rt.block_on(async {
        let settings = load_settings()?;
        SETTINGS
            .write()
            .await
            .init_with(settings.clone())
            .map_err(ChatError::from)?;
        graceful_shutdown::set_grace_period_ms(settings.app_shutdown_timeout_ms as i64);

        serve(settings, args).await
    })
}

fn start_migrate() -> ServeResult {
    init_tracing();

    let rt = tokio::runtime::Runtime::new().map_err(|err| ChatError::GenericError(err.to_string()))?;
    rt.block_on(async {
        let settings = load_settings()?;
        chat_store_pg::PgStore::connect(&settings.database_url)
            .await
            .map_err(ChatError::from)?;
        info!("migrations applied");
        Ok(())
    })
}

async fn serve(settings: Settings, args: &cli::Serve) -> ServeResult {
    let port = args.port.unwrap_or(settings.port);
    let addr = format!("0.0.0.0:{port}");

    let (state, worker) = AppState::connect(&settings).await.map_err(ChatError::from)?;

    let worker_shutdown = CancellationToken::new();
    let worker_shutdown_child = worker_shutdown.clone();
    let worker_handle = tokio::spawn(async move {
        worker.queue.run_worker(worker.pipeline, worker_shutdown_child).await;
    });

    let app: Router = routes::routes(state).layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|err| {
        error!("could not bind to {addr}: {err}");
        exit(1)
    });

    info!("listening on {addr}");

    let server = axum::serve(listener, app)
        .with_graceful_shutdown(graceful_shutdown::global_shutdown_starts());

    tokio::select! {
        result = server.into_future() => {
            result.map_err(|err| ChatError::GenericError(err.to_string()))?;
            info!("server exited");
        }
        _ = graceful_shutdown::global_shutdown_ends() => {
            error!("graceful shutdown grace period elapsed; exiting abnormally");
            exit(1);
        }
    }

    worker_shutdown.cancel();
    worker_handle.await.ok();

    Ok(())
}
