use tch::{nn, Kind, Tensor};

use crate::config::LoraConfig;

/// Create a frozen variable (kept in the VarStore, excluded from training)
/// of dtype `kind`, filled with N(0, std).
pub(crate) fn frozen(p: &nn::Path, name: &str, dims: &[i64], std: f64, kind: Kind) -> Tensor {
    let mut var = p.zeros_no_train(name, dims);
    tch::no_grad(|| {
        if kind != Kind::Float {
            var.set_data(&var.to_kind(kind));
        }
        if std != 0.0 {
            let init = Tensor::randn(dims, (Kind::Float, p.device())) * std;
            var.copy_(&init);
        }
    });
    var
}

/// Linear layer whose weights never receive gradients.
#[derive(Debug)]
pub struct FrozenLinear {
    pub ws: Tensor,
    pub bs: Option<Tensor>,
}

impl FrozenLinear {
    pub fn new(p: nn::Path, in_dim: i64, out_dim: i64, bias: bool, kind: Kind) -> Self {
        let std = (1.0 / in_dim as f64).sqrt();
        let ws = frozen(&p, "weight", &[out_dim, in_dim], std, kind);
        let bs = bias.then(|| frozen(&p, "bias", &[out_dim], 0.0, kind));
        Self { ws, bs }
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        x.linear(&self.ws, self.bs.as_ref())
    }
}

/// Frozen projection plus a trainable low-rank update:
/// `W x + (alpha / r) * B(A(dropout(x)))`.
///
/// `B` starts at zero so a fresh adapter leaves the base model unchanged.
/// `A` and `B` are f32 whatever the dtype of the frozen projection.
#[derive(Debug)]
pub struct LoraLinear {
    base: FrozenLinear,
    adapter: Option<(Tensor, Tensor)>,
    scaling: f64,
    dropout: f64,
}

impl LoraLinear {
    pub fn new(p: nn::Path, in_dim: i64, out_dim: i64, bias: bool, kind: Kind, lora: Option<&LoraConfig>) -> Self {
        let adapter = lora.map(|cfg| {
            let bound = 1.0 / (in_dim as f64).sqrt();
            let a = p.var("lora_A", &[cfg.r, in_dim], nn::Init::Uniform { lo: -bound, up: bound });
            let b = p.var("lora_B", &[out_dim, cfg.r], nn::Init::Const(0.0));
            (a, b)
        });
        Self {
            base: FrozenLinear::new(p, in_dim, out_dim, bias, kind),
            adapter,
            scaling: lora.map(LoraConfig::scaling).unwrap_or(0.0),
            dropout: lora.map(|cfg| cfg.dropout).unwrap_or(0.0),
        }
    }

    pub fn has_adapter(&self) -> bool {
        self.adapter.is_some()
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Tensor {
        let out = self.base.forward(x);
        match &self.adapter {
            Some((a, b)) => {
                let update = x
                    .to_kind(a.kind())
                    .dropout(self.dropout, train)
                    .linear::<Tensor>(a, None)
                    .linear::<Tensor>(b, None);
                let update = (update * self.scaling).to_kind(out.kind());
                out + update
            }
            None => out,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn fresh_adapter_is_identity_on_base() {
        let vs = nn::VarStore::new(Device::Cpu);
        let layer = LoraLinear::new(vs.root() / "q_proj", 8, 6, true, Kind::Float, Some(&LoraConfig::default()));
        let x = Tensor::randn([2, 3, 8], (Kind::Float, Device::Cpu));
        let with_adapter = layer.forward_t(&x, false);
        let base_only = layer.base.forward(&x);
        assert!(with_adapter.allclose(&base_only, 1e-6, 1e-6, false));
    }

    #[test]
    fn only_adapter_weights_are_trainable() {
        let vs = nn::VarStore::new(Device::Cpu);
        let _layer = LoraLinear::new(vs.root() / "v_proj", 8, 6, false, Kind::Float, Some(&LoraConfig::default()));
        let trainable: usize = vs.trainable_variables().iter().map(|t| t.numel()).sum();
        assert_eq!(trainable, 4 * 8 + 6 * 4);
        assert_eq!(vs.variables().len(), 3);
    }

    #[test]
    fn half_base_keeps_f32_adapter() {
        let vs = nn::VarStore::new(Device::Cpu);
        let layer = LoraLinear::new(vs.root() / "k_proj", 8, 6, true, Kind::Half, Some(&LoraConfig::default()));
        assert_eq!(layer.base.ws.kind(), Kind::Half);
        assert_eq!(layer.base.bs.as_ref().map(Tensor::kind), Some(Kind::Half));

        let variables = vs.variables();
        assert_eq!(variables["k_proj.weight"].kind(), Kind::Half);
        assert_eq!(variables["k_proj.lora_A"].kind(), Kind::Float);
        assert_eq!(variables["k_proj.lora_B"].kind(), Kind::Float);
        // Still a non-zero normal init after the cast
        assert!(variables["k_proj.weight"].to_kind(Kind::Float).abs().sum(Kind::Float).double_value(&[]) > 0.0);
    }
}
