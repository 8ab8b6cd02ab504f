use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::config::ConfigError;

/// Which external leg of a request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Authorization,
    Model,
    Audio,
    Upload,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Authorization => "authorization error",
            Stage::Model => "model error",
            Stage::Audio => "audio generation error",
            Stage::Upload => "upload error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{stage}: {message}")]
    Upstream { stage: Stage, message: String },

    #[error("{0}")]
    Validation(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn upstream(stage: Stage, err: impl fmt::Display) -> Self {
        AppError::Upstream {
            stage,
            message: err.to_string(),
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            AppError::Upstream { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Upstream { stage, message } => {
                tracing::error!(%stage, "upstream call failed: {}", message);
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::Config(e) => {
                tracing::error!("configuration error: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::Internal(e) => {
                tracing::error!("internal error: {:#}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(json!({
            "status": "error",
            "message": self.to_string(),
        }));

        (status, body).into_response()
    }
}
