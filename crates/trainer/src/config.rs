use anyhow::{ensure, Context, Result};
use chat_format::RolePolicy;
use lm_core::{LoraConfig, ModelConfig, WeightDtype};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use tch::Device;

/// Hyperparameters for a LoRA fine-tuning run.
///
/// Resolved in layers: defaults, then an optional YAML file, then the
/// environment variables listed in [`FineTuneConfig::apply_env`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FineTuneConfig {
    pub learning_rate: f64,
    /// Per-device batch size, used for both training and evaluation.
    pub batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub num_epochs: usize,
    pub warmup_steps: usize,
    pub weight_decay: f64,
    pub max_grad_norm: f64,
    /// Tokenizer truncation length.
    pub max_length: usize,
    /// Examples per formatting/tokenization call.
    pub map_batch_size: usize,
    pub logging_steps: usize,
    pub save_steps: usize,
    pub eval_steps: usize,
    pub load_best_model_at_end: bool,
    pub fp16: bool,
    /// Storage dtype of the frozen base model on GPU. CPU runs always use f32.
    pub base_dtype: WeightDtype,
    pub overwrite_output_dir: bool,
    pub role_policy: RolePolicy,
    pub seed: u64,
    pub lora: LoraConfig,
}

impl Default for FineTuneConfig {
    fn default() -> Self {
        Self {
            learning_rate: 2e-4,
            batch_size: 1,
            gradient_accumulation_steps: 32,
            num_epochs: 1,
            warmup_steps: 50,
            weight_decay: 0.0,
            max_grad_norm: 1.0,
            max_length: 2048,
            map_batch_size: 1000,
            logging_steps: 5,
            save_steps: 100,
            eval_steps: 100,
            load_best_model_at_end: true,
            fp16: true,
            base_dtype: WeightDtype::Float16,
            overwrite_output_dir: true,
            role_policy: RolePolicy::Lenient,
            seed: 42,
            lora: LoraConfig::default(),
        }
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid value for {}: {:?}", name, value))
}

impl FineTuneConfig {
    /// Defaults (or the YAML file at `path`), then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config {:?}", path))?;
                serde_yaml::from_str(&content).with_context(|| format!("Failed to parse config {:?}", path))?
            }
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `BATCH_SIZE`, `GRADIENT_ACCUMULATION_STEPS`,
    /// `NUM_EPOCHS`, `WARMUP_STEPS`, `LORA_RANK`, `LORA_ALPHA` and
    /// `LORA_DROPOUT`. Unset variables leave the field alone.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("BATCH_SIZE") {
            self.batch_size = parse_var("BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("GRADIENT_ACCUMULATION_STEPS") {
            self.gradient_accumulation_steps = parse_var("GRADIENT_ACCUMULATION_STEPS", &v)?;
        }
        if let Some(v) = lookup("NUM_EPOCHS") {
            self.num_epochs = parse_var("NUM_EPOCHS", &v)?;
        }
        if let Some(v) = lookup("WARMUP_STEPS") {
            self.warmup_steps = parse_var("WARMUP_STEPS", &v)?;
        }
        if let Some(v) = lookup("LORA_RANK") {
            self.lora.r = parse_var("LORA_RANK", &v)?;
        }
        if let Some(v) = lookup("LORA_ALPHA") {
            self.lora.alpha = parse_var("LORA_ALPHA", &v)?;
        }
        if let Some(v) = lookup("LORA_DROPOUT") {
            self.lora.dropout = parse_var("LORA_DROPOUT", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.batch_size > 0, "batch_size must be > 0");
        ensure!(self.gradient_accumulation_steps > 0, "gradient_accumulation_steps must be > 0");
        ensure!(self.num_epochs > 0, "num_epochs must be > 0");
        ensure!(self.max_length > 1, "max_length must be > 1");
        ensure!(self.map_batch_size > 0, "map_batch_size must be > 0");
        ensure!(self.learning_rate > 0.0, "learning_rate must be > 0");
        ensure!(self.lora.r > 0, "LoRA rank must be > 0");
        ensure!(
            (0.0..1.0).contains(&self.lora.dropout),
            "LoRA dropout must be in [0, 1), got {}",
            self.lora.dropout
        );
        ensure!(!self.lora.target_modules.is_empty(), "LoRA needs at least one target module");
        Ok(())
    }

    /// Check `model` against these settings and set the dtype its frozen
    /// weights are stored in on `device`.
    pub fn resolve_model(&self, mut model: ModelConfig, device: Device) -> Result<ModelConfig> {
        ensure!(
            self.max_length as i64 <= model.max_seq_len,
            "max_length ({}) exceeds the model's max_seq_len ({})",
            self.max_length,
            model.max_seq_len
        );
        model.weight_dtype = if device.is_cuda() {
            self.base_dtype
        } else {
            if self.base_dtype != WeightDtype::Float32 {
                log::warn!("base_dtype {:?} ignored on CPU, using float32", self.base_dtype);
            }
            WeightDtype::Float32
        };
        Ok(model)
    }

    /// Examples consumed per optimizer step.
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size * self.gradient_accumulation_steps
    }
}
