use tch::{nn, Kind, Tensor};

use crate::config::{LoraConfig, ModelConfig};
use crate::lora::LoraLinear;
use crate::rotary::RotaryEmbedding;

/// Grouped-query causal self-attention with separate q/k/v/o projections,
/// each of which may carry a LoRA adapter.
pub struct CausalSelfAttention {
    q_proj: LoraLinear,
    k_proj: LoraLinear,
    v_proj: LoraLinear,
    o_proj: LoraLinear,
    n_head: i64,
    n_kv_head: i64,
    head_dim: i64,
    dropout: f64,
}

impl CausalSelfAttention {
    pub fn new(vs: &nn::Path, config: &ModelConfig, lora: Option<&LoraConfig>) -> Self {
        let n_embd = config.n_embd;
        let kv_dim = config.kv_dim();
        let adapter = |name: &str| lora.filter(|cfg| cfg.targets(name));
        let kind = config.weight_dtype.kind();

        Self {
            q_proj: LoraLinear::new(vs / "q_proj", n_embd, n_embd, config.qkv_bias, kind, adapter("q_proj")),
            k_proj: LoraLinear::new(vs / "k_proj", n_embd, kv_dim, config.qkv_bias, kind, adapter("k_proj")),
            v_proj: LoraLinear::new(vs / "v_proj", n_embd, kv_dim, config.qkv_bias, kind, adapter("v_proj")),
            o_proj: LoraLinear::new(vs / "o_proj", n_embd, n_embd, false, kind, adapter("o_proj")),
            n_head: config.n_head,
            n_kv_head: config.n_kv_head,
            head_dim: config.head_size(),
            dropout: config.dropout,
        }
    }

    pub fn adapted_projections(&self) -> usize {
        [&self.q_proj, &self.k_proj, &self.v_proj, &self.o_proj]
            .iter()
            .filter(|p| p.has_adapter())
            .count()
    }

    /// Expand `[b, n_kv_head, t, d]` to `[b, n_head, t, d]`.
    fn repeat_kv(&self, x: Tensor) -> Tensor {
        let groups = self.n_head / self.n_kv_head;
        if groups == 1 {
            return x;
        }
        let (b, h, t, d) = x.size4().expect("attention input is 4-D");
        x.unsqueeze(2)
            .expand([b, h, groups, t, d], false)
            .reshape([b, h * groups, t, d])
    }

    /// `mask` is additive, broadcastable to `[b, n_head, t, t]` (0 keep, -inf drop).
    pub fn forward_t(&self, x: &Tensor, cos: &Tensor, sin: &Tensor, mask: &Tensor, train: bool) -> Tensor {
        let (b, t, c) = x.size3().expect("hidden states are [batch, seq, embd]");

        let q = self.q_proj.forward_t(x, train).view([b, t, self.n_head, self.head_dim]).transpose(1, 2);
        let k = self.k_proj.forward_t(x, train).view([b, t, self.n_kv_head, self.head_dim]).transpose(1, 2);
        let v = self.v_proj.forward_t(x, train).view([b, t, self.n_kv_head, self.head_dim]).transpose(1, 2);

        let q = RotaryEmbedding::apply(&q, cos, sin);
        let k = self.repeat_kv(RotaryEmbedding::apply(&k, cos, sin));
        let v = self.repeat_kv(v);

        let att = q.matmul(&k.transpose(-2, -1)) * (1.0 / (self.head_dim as f64).sqrt());
        let att = (att.to_kind(Kind::Float) + mask)
            .softmax(-1, Kind::Float)
            .to_kind(v.kind())
            .dropout(self.dropout, train);

        let y = att.matmul(&v).transpose(1, 2).contiguous().view([b, t, c]);
        self.o_proj.forward_t(&y, train)
    }
}
