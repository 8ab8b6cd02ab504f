//! Local copies of the model folders kept in blob storage.
//!
//! Blob folders are flattened into a directory of file names. A file whose
//! local size already matches the remote size is left alone, so restarts only
//! fetch what changed.

use std::path::Path;

use anyhow::{bail, Context, Result};
use fitmusic_storage::BlobStore;

/// Single-line blob naming the current adapter folder.
pub const POINTER_BLOB: &str = "latest.txt";
pub const BASE_MODEL_FOLDER: &str = "t5-base-finetuned";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MirrorReport {
    pub downloaded: usize,
    pub skipped: usize,
}

pub async fn read_pointer(store: &BlobStore) -> Result<String> {
    let Some(raw) = store.get(POINTER_BLOB).await? else {
        bail!("{} not found in model container", POINTER_BLOB);
    };
    let folder = String::from_utf8_lossy(&raw).trim().to_string();
    if folder.is_empty() {
        bail!("{} is empty", POINTER_BLOB);
    }
    Ok(folder)
}

pub async fn mirror_folder(
    store: &BlobStore,
    folder: &str,
    local_dir: &Path,
) -> Result<MirrorReport> {
    tokio::fs::create_dir_all(local_dir)
        .await
        .with_context(|| format!("failed to create {}", local_dir.display()))?;

    let mut report = MirrorReport::default();
    for entry in store.list(folder).await? {
        let filename = entry.name.rsplit('/').next().unwrap_or_default();
        if filename.is_empty() {
            continue;
        }
        let dest = local_dir.join(filename);

        if let Ok(meta) = tokio::fs::metadata(&dest).await {
            if meta.len() == entry.size as u64 {
                tracing::debug!("{} > {} already cached", folder, filename);
                report.skipped += 1;
                continue;
            }
        }

        let Some(data) = store.get(&entry.name).await? else {
            tracing::warn!("{} vanished while mirroring", entry.name);
            continue;
        };
        tokio::fs::write(&dest, &data)
            .await
            .with_context(|| format!("failed to write {}", dest.display()))?;
        tracing::info!("{} > {} downloaded to {}", folder, filename, dest.display());
        report.downloaded += 1;
    }

    Ok(report)
}

/// Mirror the adapter named by the pointer blob and the base model.
/// Returns the adapter version.
pub async fn mirror_models(store: &BlobStore, lora_dir: &Path, base_dir: &Path) -> Result<String> {
    let adapter = read_pointer(store).await?;
    tracing::info!("latest adapter version: {}", adapter);

    let report = mirror_folder(store, &adapter, lora_dir).await?;
    tracing::info!(
        downloaded = report.downloaded,
        skipped = report.skipped,
        "adapter mirrored"
    );

    let report = mirror_folder(store, BASE_MODEL_FOLDER, base_dir).await?;
    tracing::info!(
        downloaded = report.downloaded,
        skipped = report.skipped,
        "base model mirrored"
    );

    Ok(adapter)
}
