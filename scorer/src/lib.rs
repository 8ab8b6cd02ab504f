use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use fitmusic_storage::BlobStore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod config;
pub mod generator;
pub mod lora;
pub mod mirror;

use generator::{PromptGenerator, T5Generator};

#[derive(Clone)]
pub struct AppState {
    pub generator: Arc<dyn PromptGenerator>,
}

impl AppState {
    pub fn new(generator: Arc<dyn PromptGenerator>) -> Self {
        Self { generator }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ScoreRequest {
    #[serde(default)]
    pub biometric: String,
}

#[derive(Debug, Serialize)]
pub struct ScoreResponse {
    pub generated_prompt: String,
}

#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("generation failed: {0:#}")]
    Generation(#[from] anyhow::Error),

    #[error("generation task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl IntoResponse for ScoreError {
    fn into_response(self) -> Response {
        tracing::error!("{}", self);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": self.to_string()})),
        )
            .into_response()
    }
}

async fn health_check() -> &'static str {
    "ok"
}

async fn score(State(state): State<AppState>, body: Bytes) -> Result<Json<ScoreResponse>, ScoreError> {
    // a missing or malformed body scores the empty string
    let request: ScoreRequest = serde_json::from_slice(&body).unwrap_or_default();
    tracing::debug!("scoring: {}", request.biometric);

    let generator = state.generator.clone();
    let generated_prompt =
        tokio::task::spawn_blocking(move || generator.generate(&request.biometric)).await??;

    Ok(Json(ScoreResponse { generated_prompt }))
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/score", post(score))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fitmusic_scorer=debug,tower_http=debug".into()),
        )
        .init();

    let config = config::load()?;
    let store = BlobStore::from_connection_string(&config.connection_string, &config.container)
        .context("failed to open model container")?;

    let version = mirror::mirror_models(&store, &config.lora_dir, &config.base_dir).await?;
    tracing::info!("loading adapter {}", version);

    let (base_dir, lora_dir, settings) = (
        config.base_dir.clone(),
        config.lora_dir.clone(),
        config.generation,
    );
    let generator =
        tokio::task::spawn_blocking(move || T5Generator::load(&base_dir, &lora_dir, settings))
            .await??;

    let app = build_router(AppState::new(Arc::new(generator)));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app).await?;
    Ok(())
}
