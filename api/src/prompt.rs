use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::biometrics::plain;
use crate::error::{AppError, Stage};

pub const MODEL_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Serialize)]
struct ScoreRequest<'a> {
    biometric: &'a str,
}

#[derive(Deserialize)]
struct ScoreResponse {
    #[serde(default)]
    generated_prompt: String,
}

/// `steps:120 bpm:71 ...` in the order the keys were sent.
pub fn encode_biometrics(fields: &Map<String, Value>) -> String {
    fields
        .iter()
        .map(|(key, value)| format!("{}:{}", key, plain(value)))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Client for the scoring service that turns biometrics into a music prompt.
#[derive(Clone)]
pub struct PromptClient {
    http: Client,
    endpoint: String,
    timeout: Duration,
}

impl PromptClient {
    pub fn new(http: Client, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            timeout: MODEL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn generate(&self, biometric: &str) -> Result<String, AppError> {
        let response = self
            .http
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&ScoreRequest { biometric })
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AppError::upstream(Stage::Model, e))?;

        let body: ScoreResponse = response
            .json()
            .await
            .map_err(|e| AppError::upstream(Stage::Model, e))?;

        if body.generated_prompt.is_empty() {
            return Err(AppError::upstream(
                Stage::Model,
                "the model returned no prompt",
            ));
        }

        tracing::info!("generated prompt: {}", body.generated_prompt);
        Ok(body.generated_prompt)
    }
}
