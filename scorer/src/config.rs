use std::path::PathBuf;

use thiserror::Error;

pub const DEFAULT_CONTAINER: &str = "model";
pub const DEFAULT_LORA_DIR: &str = "/tmp/lora_model";
pub const DEFAULT_BASE_DIR: &str = "/tmp/t5-base-finetuned";
pub const DEFAULT_PORT: u16 = 5000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("set AZURE_CONNECTION_STRING or AZURE_STORAGE_CONNECTION_STRING")]
    MissingConnectionString,

    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationSettings {
    /// Prompt tokens kept after truncation.
    pub max_input_tokens: usize,
    pub max_new_tokens: usize,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            max_input_tokens: 64,
            max_new_tokens: 16,
        }
    }
}

#[derive(Clone)]
pub struct Config {
    pub connection_string: String,
    pub container: String,
    pub lora_dir: PathBuf,
    pub base_dir: PathBuf,
    pub port: u16,
    pub generation: GenerationSettings,
}

pub fn load() -> Result<Config, ConfigError> {
    dotenvy::dotenv().ok();
    from_lookup(|key| std::env::var(key).ok())
}

pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Config, ConfigError> {
    let connection_string = lookup("AZURE_CONNECTION_STRING")
        .filter(|v| !v.is_empty())
        .or_else(|| lookup("AZURE_STORAGE_CONNECTION_STRING").filter(|v| !v.is_empty()))
        .ok_or(ConfigError::MissingConnectionString)?;

    let port = match lookup("PORT") {
        Some(raw) => raw.parse().map_err(|e: std::num::ParseIntError| ConfigError::Invalid {
            var: "PORT",
            reason: e.to_string(),
        })?,
        None => DEFAULT_PORT,
    };

    Ok(Config {
        connection_string,
        container: lookup("MODEL_CONTAINER").unwrap_or_else(|| DEFAULT_CONTAINER.to_string()),
        lora_dir: lookup("LORA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LORA_DIR)),
        base_dir: lookup("BASE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BASE_DIR)),
        port,
        generation: GenerationSettings::default(),
    })
}
