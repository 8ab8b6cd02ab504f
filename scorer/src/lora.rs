//! Folding a low-rank adapter into base weights.
//!
//! For every adapted linear layer the merged weight is
//! `W + (lora_alpha / r) * B @ A`, after which the adapter tensors are no
//! longer needed and the model loads like a plain checkpoint.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};
use serde::Deserialize;
use thiserror::Error;

pub const ADAPTER_CONFIG: &str = "adapter_config.json";
pub const ADAPTER_WEIGHTS: &str = "adapter_model.safetensors";

const PEFT_PREFIX: &str = "base_model.model.";
const LORA_A: &str = ".lora_A";
const LORA_B: &str = ".lora_B";

#[derive(Debug, Error)]
pub enum LoraError {
    #[error("failed to read adapter config: {0}")]
    Config(String),

    #[error("adapter rank must be positive")]
    ZeroRank,

    #[error("adapter layer {0} has no matching base weight")]
    MissingBase(String),

    #[error("adapter layer {0} is missing its B matrix")]
    MissingB(String),

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoraConfig {
    pub r: usize,
    pub lora_alpha: f64,
    #[serde(default)]
    pub target_modules: Vec<String>,
}

impl LoraConfig {
    pub fn from_file(path: &Path) -> Result<Self, LoraError> {
        let raw = std::fs::read_to_string(path).map_err(|e| LoraError::Config(e.to_string()))?;
        serde_json::from_str(&raw).map_err(|e| LoraError::Config(e.to_string()))
    }

    pub fn scale(&self) -> Result<f64, LoraError> {
        if self.r == 0 {
            return Err(LoraError::ZeroRank);
        }
        Ok(self.lora_alpha / self.r as f64)
    }
}

/// Base layer name for an adapter `A` tensor key, or `None` for any other key.
///
/// `base_model.model.encoder.block.0.layer.0.SelfAttention.q.lora_A.weight`
/// maps to `encoder.block.0.layer.0.SelfAttention.q`. An adapter name segment
/// (`lora_A.default.weight`) is accepted too.
pub fn layer_name(key: &str) -> Option<&str> {
    let key = key.strip_prefix(PEFT_PREFIX).unwrap_or(key);
    let (layer, rest) = key.rsplit_once(LORA_A)?;
    matches!(rest, ".weight" | ".default.weight").then_some(layer)
}

fn b_key(a_key: &str) -> String {
    match a_key.rsplit_once(LORA_A) {
        Some((head, tail)) => format!("{}{}{}", head, LORA_B, tail),
        None => a_key.to_string(),
    }
}

/// Merges every adapter pair into `base` in place. Returns the number of
/// layers updated.
pub fn merge_into(
    base: &mut HashMap<String, Tensor>,
    adapter: &HashMap<String, Tensor>,
    config: &LoraConfig,
) -> Result<usize, LoraError> {
    let scale = config.scale()?;
    let mut merged = 0;

    let mut a_keys: Vec<&String> = adapter.keys().filter(|k| layer_name(k).is_some()).collect();
    a_keys.sort();

    for a_key in a_keys {
        let Some(layer) = layer_name(a_key) else {
            continue;
        };
        let a = &adapter[a_key];
        let b = adapter
            .get(&b_key(a_key))
            .ok_or_else(|| LoraError::MissingB(layer.to_string()))?;

        let weight_key = format!("{}.weight", layer);
        let weight = base
            .get(&weight_key)
            .ok_or_else(|| LoraError::MissingBase(weight_key.clone()))?;

        let delta = (b.matmul(a)? * scale)?.to_dtype(weight.dtype())?;
        let updated = (weight + delta)?;
        base.insert(weight_key, updated);
        merged += 1;
    }

    Ok(merged)
}

/// Loads the adapter from `dir` and merges it into `base`.
pub fn merge_from_dir(
    base: &mut HashMap<String, Tensor>,
    dir: &Path,
    device: &Device,
) -> Result<usize, LoraError> {
    let config = LoraConfig::from_file(&dir.join(ADAPTER_CONFIG))?;
    let adapter = candle_core::safetensors::load(dir.join(ADAPTER_WEIGHTS), device)?;
    let merged = merge_into(base, &adapter, &config)?;
    tracing::info!(r = config.r, alpha = config.lora_alpha, "merged {} adapter layers", merged);
    Ok(merged)
}
