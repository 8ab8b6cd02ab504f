use chrono::{DateTime, Local};
use fitmusic_storage::BlobStore;
use serde::{Deserialize, Serialize};

use crate::audio::AudioClient;
use crate::error::{AppError, Stage};
use crate::prompt::PromptClient;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub status: String,
    pub filename: String,
    pub url: String,
    pub prompt: String,
    pub input_text: String,
}

/// Blob name for a clip. Second resolution: two clips in the same second share a name.
pub fn artifact_name(now: DateTime<Local>) -> String {
    format!("music_{}.wav", now.format("%Y-%m-%d_%H-%M-%S"))
}

/// Biometrics -> prompt -> audio -> blob. Each leg reports its own [`Stage`].
pub async fn generate_music(
    prompts: &PromptClient,
    audio: &AudioClient,
    store: &BlobStore,
    input_text: String,
    now: DateTime<Local>,
) -> Result<GenerationResult, AppError> {
    let prompt = prompts.generate(&input_text).await?;
    let clip = audio.generate(&prompt).await?;

    let filename = artifact_name(now);
    store
        .put(&filename, clip)
        .await
        .map_err(|e| AppError::upstream(Stage::Upload, e))?;

    tracing::info!("stored {}", filename);

    Ok(GenerationResult {
        status: "success".to_string(),
        url: store.url(&filename),
        filename,
        prompt,
        input_text,
    })
}
