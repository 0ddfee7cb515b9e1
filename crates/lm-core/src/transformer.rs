use tch::{nn, Device, Kind, Tensor};

use crate::attention::CausalSelfAttention;
use crate::config::{LoraConfig, ModelConfig};
use crate::layer_norm::RMSNorm;
use crate::lora::{frozen, FrozenLinear};
use crate::rotary::RotaryEmbedding;

/// Label value excluded from the loss.
pub const IGNORE_INDEX: i64 = -100;

/// Gated feed-forward block: `down(silu(gate(x)) * up(x))`.
pub struct MLP {
    gate_proj: FrozenLinear,
    up_proj: FrozenLinear,
    down_proj: FrozenLinear,
}

impl MLP {
    pub fn new(vs: &nn::Path, config: &ModelConfig) -> Self {
        let kind = config.weight_dtype.kind();
        Self {
            gate_proj: FrozenLinear::new(vs / "gate_proj", config.n_embd, config.n_inner, false, kind),
            up_proj: FrozenLinear::new(vs / "up_proj", config.n_embd, config.n_inner, false, kind),
            down_proj: FrozenLinear::new(vs / "down_proj", config.n_inner, config.n_embd, false, kind),
        }
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        let gated = self.gate_proj.forward(x).silu() * self.up_proj.forward(x);
        self.down_proj.forward(&gated)
    }
}

pub struct Block {
    input_layernorm: RMSNorm,
    self_attn: CausalSelfAttention,
    post_attention_layernorm: RMSNorm,
    mlp: MLP,
}

impl Block {
    pub fn new(vs: &nn::Path, config: &ModelConfig, lora: Option<&LoraConfig>) -> Self {
        let kind = config.weight_dtype.kind();
        Self {
            input_layernorm: RMSNorm::new(&(vs / "input_layernorm"), config.n_embd, config.layer_norm_epsilon, kind),
            self_attn: CausalSelfAttention::new(&(vs / "self_attn"), config, lora),
            post_attention_layernorm: RMSNorm::new(
                &(vs / "post_attention_layernorm"),
                config.n_embd,
                config.layer_norm_epsilon,
                kind,
            ),
            mlp: MLP::new(&(vs / "mlp"), config),
        }
    }

    pub fn forward_t(&self, x: &Tensor, cos: &Tensor, sin: &Tensor, mask: &Tensor, train: bool) -> Tensor {
        let h = x + self
            .self_attn
            .forward_t(&self.input_layernorm.forward(x), cos, sin, mask, train);
        let out = self.mlp.forward(&self.post_attention_layernorm.forward(&h));
        h + out
    }
}

/// Decoder-only causal language model. Variable names follow the
/// `model.layers.{i}.self_attn.q_proj.weight` convention so pretrained
/// safetensors load without renaming.
pub struct CausalLM {
    embed_tokens: Tensor,
    layers: Vec<Block>,
    norm: RMSNorm,
    lm_head: FrozenLinear,
    rotary: RotaryEmbedding,
    pub config: ModelConfig,
    pub lora: Option<LoraConfig>,
}

impl CausalLM {
    pub fn new(vs: &nn::Path, config: &ModelConfig, lora: Option<&LoraConfig>) -> Self {
        let model = vs / "model";
        let kind = config.weight_dtype.kind();
        let embed_tokens = frozen(
            &(&model / "embed_tokens"),
            "weight",
            &[config.vocab_size, config.n_embd],
            0.02,
            kind,
        );

        let layers = (0..config.n_layer)
            .map(|i| Block::new(&(&model / "layers" / i), config, lora))
            .collect();

        Self {
            embed_tokens,
            layers,
            norm: RMSNorm::new(&(&model / "norm"), config.n_embd, config.layer_norm_epsilon, kind),
            lm_head: FrozenLinear::new(vs / "lm_head", config.n_embd, config.vocab_size, false, kind),
            rotary: RotaryEmbedding::new(config.head_size(), config.rope_theta, vs.device()),
            config: config.clone(),
            lora: lora.cloned(),
        }
    }

    pub fn adapted_projections(&self) -> usize {
        self.layers.iter().map(|l| l.self_attn.adapted_projections()).sum()
    }

    /// Additive `[b, 1, t, t]` mask: causal, plus key padding from
    /// `attention_mask` (`[b, t]`, 1 for real tokens).
    fn build_mask(attention_mask: Option<&Tensor>, t: i64, device: Device) -> Tensor {
        let causal = Tensor::ones([t, t], (Kind::Bool, device)).tril(0);
        let keep = match attention_mask {
            Some(am) => causal.unsqueeze(0).logical_and(&am.to_kind(Kind::Bool).unsqueeze(1)).unsqueeze(1),
            None => causal.unsqueeze(0).unsqueeze(0),
        };
        Tensor::zeros(keep.size().as_slice(), (Kind::Float, device)).masked_fill(&keep.logical_not(), f64::NEG_INFINITY)
    }

    /// input_ids: [batch, seq] (Int64). Returns logits [batch, seq, vocab].
    pub fn forward_t(&self, input_ids: &Tensor, attention_mask: Option<&Tensor>, train: bool) -> Tensor {
        let (_, t) = input_ids.size2().expect("input_ids are [batch, seq]");
        let device = input_ids.device();

        let mut x = Tensor::embedding(&self.embed_tokens, input_ids, -1, false, false);
        let (cos, sin) = self.rotary.tables(t);
        let mask = Self::build_mask(attention_mask, t, device);

        for layer in &self.layers {
            x = layer.forward_t(&x, &cos, &sin, &mask, train);
        }

        self.lm_head.forward(&self.norm.forward(&x))
    }

    /// Next-token cross-entropy: logits at position `i` predict `labels[i + 1]`.
    /// Positions labelled [`IGNORE_INDEX`] do not count. Returns a scalar mean
    /// over counted tokens.
    pub fn loss(logits: &Tensor, labels: &Tensor) -> Tensor {
        let (b, t, v) = logits.size3().expect("logits are [batch, seq, vocab]");
        let shift_logits = logits.narrow(1, 0, t - 1).to_kind(Kind::Float).reshape([b * (t - 1), v]);
        let shift_labels = labels.narrow(1, 1, t - 1).reshape([b * (t - 1)]);
        shift_logits.cross_entropy_loss::<Tensor>(&shift_labels, None, tch::Reduction::Mean, IGNORE_INDEX, 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            n_embd: 32,
            n_head: 4,
            n_kv_head: 2,
            n_layer: 2,
            n_inner: 64,
            vocab_size: 50,
            max_seq_len: 64,
            dropout: 0.0,
            layer_norm_epsilon: 1e-6,
            rope_theta: 10000.0,
            qkv_bias: true,
            ..ModelConfig::default()
        }
    }

    #[test]
    fn forward_shapes_and_adapter_count() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = CausalLM::new(&vs.root(), &tiny_config(), Some(&LoraConfig::default()));
        assert_eq!(model.adapted_projections(), 8);

        let ids = Tensor::from_slice(&[1i64, 2, 3, 4, 5, 6]).view([2, 3]);
        let logits = model.forward_t(&ids, None, false);
        assert_eq!(logits.size(), vec![2, 3, 50]);
    }

    #[test]
    fn padding_does_not_change_real_positions() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = CausalLM::new(&vs.root(), &tiny_config(), None);

        let short = Tensor::from_slice(&[7i64, 8, 9]).view([1, 3]);
        let padded = Tensor::from_slice(&[7i64, 8, 9, 0, 0]).view([1, 5]);
        let mask = Tensor::from_slice(&[1i64, 1, 1, 0, 0]).view([1, 5]);

        let a = model.forward_t(&short, None, false);
        let b = model.forward_t(&padded, Some(&mask), false).narrow(1, 0, 3);
        assert!(a.allclose(&b, 1e-4, 1e-5, false));
    }

    #[test]
    fn loss_ignores_masked_labels() {
        let logits = Tensor::zeros([1, 3, 4], (Kind::Float, Device::Cpu));
        let labels = Tensor::from_slice(&[1i64, 2, IGNORE_INDEX]).view([1, 3]);
        let loss = CausalLM::loss(&logits, &labels).double_value(&[]);
        // Uniform logits: one counted token at ln(4)
        assert!((loss - 4f64.ln()).abs() < 1e-6);
    }
}
