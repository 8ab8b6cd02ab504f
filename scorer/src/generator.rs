use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::t5;
use tokenizers::{Tokenizer, TruncationParams};

use crate::config::GenerationSettings;
use crate::lora;

pub const PROMPT_TEMPLATE_PREFIX: &str = "Generate music style: ";

/// Turns an encoded biometric string into a music style prompt.
///
/// Implementations are called from blocking threads.
pub trait PromptGenerator: Send + Sync {
    fn generate(&self, biometric: &str) -> Result<String>;
}

pub fn render_prompt(biometric: &str) -> String {
    format!("{}{}", PROMPT_TEMPLATE_PREFIX, biometric)
}

/// Fine-tuned T5 with its adapter already folded into the weights.
pub struct T5Generator {
    model: Mutex<t5::T5ForConditionalGeneration>,
    tokenizer: Tokenizer,
    decoder_start: u32,
    eos: u32,
    use_cache: bool,
    device: Device,
    settings: GenerationSettings,
}

impl T5Generator {
    /// `base_dir` holds `config.json`, `model.safetensors` and
    /// `tokenizer.json`; `adapter_dir` holds the mirrored adapter.
    pub fn load(base_dir: &Path, adapter_dir: &Path, settings: GenerationSettings) -> Result<Self> {
        let device = Device::Cpu;

        let raw = std::fs::read_to_string(base_dir.join("config.json"))
            .context("failed to read base model config")?;
        let config: t5::Config =
            serde_json::from_str(&raw).context("failed to parse base model config")?;

        let mut weights =
            candle_core::safetensors::load(base_dir.join("model.safetensors"), &device)
                .context("failed to load base model weights")?;
        lora::merge_from_dir(&mut weights, adapter_dir, &device)
            .context("failed to merge adapter")?;

        let vb = VarBuilder::from_tensors(weights, DType::F32, &device);
        let model = t5::T5ForConditionalGeneration::load(vb, &config)
            .context("failed to build model")?;

        let mut tokenizer = Tokenizer::from_file(base_dir.join("tokenizer.json"))
            .map_err(|e| anyhow!("failed to load tokenizer: {}", e))?;
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: settings.max_input_tokens,
                ..Default::default()
            }))
            .map_err(|e| anyhow!("failed to configure truncation: {}", e))?;
        tokenizer.with_padding(None);

        let decoder_start = config
            .decoder_start_token_id
            .unwrap_or(config.pad_token_id) as u32;

        tracing::info!("model ready");
        Ok(Self {
            model: Mutex::new(model),
            tokenizer,
            decoder_start,
            eos: config.eos_token_id as u32,
            use_cache: config.use_cache,
            device,
            settings,
        })
    }

    fn greedy(&self, model: &mut t5::T5ForConditionalGeneration, input: &[u32]) -> Result<Vec<u32>> {
        model.clear_kv_cache();
        let input_ids = Tensor::new(input, &self.device)?.unsqueeze(0)?;
        let encoded = model.encode(&input_ids)?;

        let mut output = vec![self.decoder_start];
        for step in 0..self.settings.max_new_tokens {
            // with a kv cache only the newest token is fed
            let context = if step == 0 || !self.use_cache {
                &output[..]
            } else {
                &output[output.len() - 1..]
            };
            let decoder_ids = Tensor::new(context, &self.device)?.unsqueeze(0)?;
            let logits = model.decode(&decoder_ids, &encoded)?.flatten_all()?;
            let next = logits.argmax(0)?.to_scalar::<u32>()?;
            if next == self.eos {
                break;
            }
            output.push(next);
        }

        Ok(output.split_off(1))
    }

    fn generate_ids(&self, biometric: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(render_prompt(biometric), true)
            .map_err(|e| anyhow!("tokenization failed: {}", e))?;

        let mut model = self
            .model
            .lock()
            .map_err(|_| anyhow!("model lock poisoned"))?;
        self.greedy(&mut model, encoding.get_ids())
    }
}

impl PromptGenerator for T5Generator {
    fn generate(&self, biometric: &str) -> Result<String> {
        let ids = self.generate_ids(biometric)?;
        self.tokenizer
            .decode(&ids, true)
            .map_err(|e| anyhow!("detokenization failed: {}", e))
    }
}
