use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tch::Kind;

/// Storage dtype of the frozen base weights. Adapter weights stay in f32.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightDtype {
    #[default]
    Float32,
    Float16,
    Bfloat16,
}

impl WeightDtype {
    pub fn kind(self) -> Kind {
        match self {
            WeightDtype::Float32 => Kind::Float,
            WeightDtype::Float16 => Kind::Half,
            WeightDtype::Bfloat16 => Kind::BFloat16,
        }
    }
}

/// Decoder-only model shape. Field aliases accept a Hugging Face style
/// `config.json` (Qwen2 / Llama naming) as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Dimension of the token embeddings (and internal transformer states).
    #[serde(alias = "hidden_size")]
    pub n_embd: i64,
    /// Number of query heads.
    #[serde(alias = "num_attention_heads")]
    pub n_head: i64,
    /// Number of key/value heads (grouped-query attention when < n_head).
    #[serde(alias = "num_key_value_heads")]
    pub n_kv_head: i64,
    /// Number of transformer layers.
    #[serde(alias = "num_hidden_layers")]
    pub n_layer: i64,
    /// Hidden width of the gated MLP.
    #[serde(alias = "intermediate_size")]
    pub n_inner: i64,
    pub vocab_size: i64,
    /// Maximum context window size (max sequence length).
    #[serde(alias = "max_position_embeddings")]
    pub max_seq_len: i64,
    #[serde(default)]
    pub dropout: f64,
    #[serde(alias = "rms_norm_eps", default = "default_eps")]
    pub layer_norm_epsilon: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    /// Bias on q/k/v projections (Qwen2 uses it, Llama does not).
    #[serde(default = "default_true")]
    pub qkv_bias: bool,
    /// Chosen by the caller at load time, never read from `config.json`.
    #[serde(skip)]
    pub weight_dtype: WeightDtype,
}

fn default_eps() -> f64 {
    1e-6
}

fn default_rope_theta() -> f64 {
    1_000_000.0
}

fn default_true() -> bool {
    true
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            n_embd: 3584, // Qwen2.5-7B
            n_head: 28,
            n_kv_head: 4,
            n_layer: 28,
            n_inner: 18944,
            vocab_size: 152064,
            max_seq_len: 32768,
            dropout: 0.0,
            layer_norm_epsilon: 1e-6,
            rope_theta: 1_000_000.0,
            qkv_bias: true,
            weight_dtype: WeightDtype::Float32,
        }
    }
}

impl ModelConfig {
    pub fn head_size(&self) -> i64 {
        self.n_embd / self.n_head
    }

    pub fn kv_dim(&self) -> i64 {
        self.n_kv_head * self.head_size()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read model config at {:?}", path))?;
        let config: Self = serde_json::from_str(&text).context("Failed to parse model config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.n_head > 0 && self.n_kv_head > 0, "head counts must be positive");
        ensure!(
            self.n_embd % self.n_head == 0,
            "n_embd ({}) not divisible by n_head ({})",
            self.n_embd,
            self.n_head
        );
        ensure!(
            self.n_head % self.n_kv_head == 0,
            "n_head ({}) not divisible by n_kv_head ({})",
            self.n_head,
            self.n_kv_head
        );
        ensure!(self.head_size() % 2 == 0, "rotary embedding needs an even head size");
        Ok(())
    }
}

/// Low-rank adapter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoraConfig {
    pub r: i64,
    pub alpha: f64,
    pub dropout: f64,
    /// Attention projections that receive an adapter.
    pub target_modules: Vec<String>,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            r: 4,
            alpha: 8.0,
            dropout: 0.1,
            target_modules: ["q_proj", "k_proj", "v_proj", "o_proj"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl LoraConfig {
    pub fn scaling(&self) -> f64 {
        self.alpha / self.r as f64
    }

    pub fn targets(&self, module: &str) -> bool {
        self.target_modules.iter().any(|m| m == module)
    }
}
