use std::path::PathBuf;

use thiserror::Error;

use crate::fitbit::FITBIT_API_BASE;
use crate::oauth::TOKEN_URL;

pub const DEFAULT_MUSICGEN_ENDPOINT: &str = "https://douniaharag-fitmusicgen-api.hf.space/generate";
pub const DEFAULT_TOKEN_PATH: &str = "fitbit_token.json";
pub const DEFAULT_PORT: u16 = 5000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Process configuration, read once at startup.
#[derive(Clone)]
pub struct Config {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub session_secret: String,
    pub storage_connection_string: String,
    pub audio_container: String,
    pub feedback_container: String,
    pub model_endpoint: String,
    pub musicgen_endpoint: String,
    pub fitbit_api_base: String,
    pub fitbit_token_url: String,
    pub token_path: PathBuf,
    pub port: u16,
}

pub fn load() -> Result<Config, ConfigError> {
    dotenvy::dotenv().ok();
    from_lookup(|key| std::env::var(key).ok())
}

/// Build a config from any key lookup; `load` passes the process environment.
pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Config, ConfigError> {
    let required = |var: &'static str| {
        lookup(var)
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing(var))
    };

    let port = match lookup("PORT") {
        Some(raw) => raw.parse().map_err(|e: std::num::ParseIntError| ConfigError::Invalid {
            var: "PORT",
            reason: e.to_string(),
        })?,
        None => DEFAULT_PORT,
    };

    Ok(Config {
        client_id: required("CLIENT_ID")?,
        client_secret: required("CLIENT_SECRET")?,
        redirect_uri: required("REDIRECT_URI")?,
        session_secret: required("SESSION_SECRET")?,
        storage_connection_string: required("AZURE_STORAGE_CONNECTION_STRING")?,
        audio_container: required("AUDIO_CONTAINER")?,
        feedback_container: required("FEEDBACK_CONTAINER")?,
        model_endpoint: required("AZURE_MODEL_ENDPOINT")?,
        musicgen_endpoint: lookup("MUSICGEN_ENDPOINT")
            .unwrap_or_else(|| DEFAULT_MUSICGEN_ENDPOINT.to_string()),
        fitbit_api_base: lookup("FITBIT_API_BASE").unwrap_or_else(|| FITBIT_API_BASE.to_string()),
        fitbit_token_url: lookup("FITBIT_TOKEN_URL").unwrap_or_else(|| TOKEN_URL.to_string()),
        token_path: lookup("TOKEN_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_TOKEN_PATH)),
        port,
    })
}
