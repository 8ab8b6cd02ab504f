use std::time::Duration;

use bytes::Bytes;
use reqwest::Client;
use serde::Serialize;

use crate::error::{AppError, Stage};

pub const AUDIO_TIMEOUT: Duration = Duration::from_secs(300);
pub const CLIP_SECONDS: u32 = 30;

#[derive(Serialize)]
struct GenerateRequest<'a> {
    prompt: &'a str,
    duration: u32,
}

/// Client for the external text-to-audio service.
#[derive(Clone)]
pub struct AudioClient {
    http: Client,
    endpoint: String,
    timeout: Duration,
}

impl AudioClient {
    pub fn new(http: Client, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            timeout: AUDIO_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The response body is returned as-is; content type and length are not checked.
    pub async fn generate(&self, prompt: &str) -> Result<Bytes, AppError> {
        let response = self
            .http
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&GenerateRequest {
                prompt,
                duration: CLIP_SECONDS,
            })
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AppError::upstream(Stage::Audio, e))?;

        let audio = response
            .bytes()
            .await
            .map_err(|e| AppError::upstream(Stage::Audio, e))?;

        tracing::debug!("received {} bytes of audio", audio.len());
        Ok(audio)
    }
}
