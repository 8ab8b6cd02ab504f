use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use fitmusic_storage::BlobStore;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod audio;
pub mod biometrics;
pub mod config;
pub mod error;
pub mod feedback;
pub mod fitbit;
pub mod music;
pub mod oauth;
pub mod prompt;
pub mod session;

use audio::AudioClient;
use config::Config;
use error::{AppError, Stage};
use feedback::{FeedbackLog, FeedbackRecord};
use fitbit::{FitbitClient, Resource, HISTORY_WINDOW};
use oauth::{Credentials, TokenFile, TokenLookup};
use prompt::PromptClient;
use session::SessionStore;

const INDEX_HTML: &str = include_str!("../static/index.html");

/// Process-scoped clients, built once in [`AppState::from_config`] and shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub http: reqwest::Client,
    pub credentials: Credentials,
    pub fitbit_api_base: String,
    pub fitbit_token_url: String,
    pub sessions: Arc<SessionStore>,
    pub token_file: TokenFile,
    pub prompts: PromptClient,
    pub audio: AudioClient,
    pub audio_store: BlobStore,
    pub feedback: FeedbackLog,
}

impl AppState {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let http = reqwest::Client::new();

        let audio_store = BlobStore::from_connection_string(
            &config.storage_connection_string,
            &config.audio_container,
        )
        .context("failed to open audio container")?;
        let feedback_store = BlobStore::from_connection_string(
            &config.storage_connection_string,
            &config.feedback_container,
        )
        .context("failed to open feedback container")?;

        Ok(Self {
            credentials: Credentials {
                client_id: config.client_id.clone(),
                client_secret: config.client_secret.clone(),
                redirect_uri: config.redirect_uri.clone(),
            },
            fitbit_api_base: config.fitbit_api_base.clone(),
            fitbit_token_url: config.fitbit_token_url.clone(),
            sessions: Arc::new(SessionStore::new(&config.session_secret)?),
            token_file: TokenFile::new(config.token_path.clone()),
            prompts: PromptClient::new(http.clone(), config.model_endpoint.clone()),
            audio: AudioClient::new(http.clone(), config.musicgen_endpoint.clone()),
            audio_store,
            feedback: FeedbackLog::new(feedback_store),
            http,
        })
    }

    /// Session token first, then the token file.
    async fn token(&self, headers: &HeaderMap) -> TokenLookup {
        if let Some(token) = self.sessions.token_from_headers(headers) {
            return TokenLookup::Present(token);
        }
        match self.token_file.load().await {
            Ok(lookup) => lookup,
            Err(e) => {
                tracing::warn!("ignoring unreadable token file: {:#}", e);
                TokenLookup::Absent
            }
        }
    }

    async fn fitbit(&self, headers: &HeaderMap) -> Option<FitbitClient> {
        let token = self.token(headers).await.into_option()?;
        Some(FitbitClient::new(
            self.http.clone(),
            &self.fitbit_api_base,
            token.access_token,
        ))
    }
}

fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

fn today() -> chrono::NaiveDate {
    chrono::Local::now().date_naive()
}

/// Request bodies are read leniently: anything that isn't a JSON object counts as `{}`.
fn json_object(body: &[u8]) -> Map<String, Value> {
    match serde_json::from_slice(body) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

async fn health_check() -> &'static str {
    "ok"
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn authorize(State(state): State<AppState>) -> Response {
    found(&oauth::build_authorize_url(
        &state.credentials.client_id,
        &state.credentials.redirect_uri,
    ))
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
}

async fn callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackQuery>,
) -> Result<Response, AppError> {
    let Some(code) = params.code.filter(|c| !c.is_empty()) else {
        return Ok((StatusCode::BAD_REQUEST, "no OAuth code returned").into_response());
    };

    let token = oauth::exchange_code_for_token(
        &state.http,
        &state.fitbit_token_url,
        &state.credentials,
        &code,
    )
    .await
    .map_err(|e| AppError::upstream(Stage::Authorization, e))?;

    if let Err(e) = state.token_file.save(&token).await {
        tracing::warn!("failed to persist token: {:#}", e);
    }
    let cookie = state.sessions.create(token);
    tracing::info!("fitbit authorization complete");

    let mut response = found("/");
    if let Ok(value) = session::set_cookie_header(&cookie).parse() {
        response.headers_mut().insert(header::SET_COOKIE, value);
    }
    Ok(response)
}

async fn biometrics(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(client) = state.fitbit(&headers).await else {
        return found("/authorize");
    };
    Json(client.fetch_snapshot(today()).await).into_response()
}

async fn generate_music(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<music::GenerationResult>, AppError> {
    let input_text = prompt::encode_biometrics(&json_object(&body));
    tracing::info!("generating music for: {}", input_text);

    let result = music::generate_music(
        &state.prompts,
        &state.audio,
        &state.audio_store,
        input_text,
        chrono::Local::now(),
    )
    .await?;
    Ok(Json(result))
}

async fn submit_feedback(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let body = Value::Object(json_object(&body));
    let record = FeedbackRecord::from_json(&body)?;

    state
        .feedback
        .append(&record)
        .await
        .map_err(|e| AppError::Internal(e.into()))?;

    Ok(Json(json!({"status": "success", "message": "feedback recorded"})))
}

async fn history(state: &AppState, headers: &HeaderMap, resource: Resource) -> Json<Value> {
    let Some(client) = state.fitbit(headers).await else {
        return Json(json!([]));
    };
    let points = client.last_values(resource, today(), HISTORY_WINDOW).await;
    Json(json!(points))
}

async fn heart_history(State(state): State<AppState>, headers: HeaderMap) -> Json<Value> {
    history(&state, &headers, Resource::HeartRate).await
}

async fn steps_history(State(state): State<AppState>, headers: HeaderMap) -> Json<Value> {
    history(&state, &headers, Resource::Steps).await
}

async fn calories_history(State(state): State<AppState>, headers: HeaderMap) -> Json<Value> {
    history(&state, &headers, Resource::Calories).await
}

async fn sedentary_history(State(state): State<AppState>, headers: HeaderMap) -> Json<Value> {
    history(&state, &headers, Resource::MinutesSedentary).await
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health_check))
        .route("/authorize", get(authorize))
        .route("/callback", get(callback))
        .route("/biometrics", get(biometrics))
        .route("/generate_music", post(generate_music))
        .route("/submit_feedback", post(submit_feedback))
        .route("/heart_history", get(heart_history))
        .route("/steps_history", get(steps_history))
        .route("/calories_history", get(calories_history))
        .route("/sedentary_history", get(sedentary_history))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fitmusic_api=debug,tower_http=debug".into()),
        )
        .init();

    let config = config::load()?;
    let state = AppState::from_config(&config)?;
    tracing::info!("clients initialized");

    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app).await?;
    Ok(())
}
