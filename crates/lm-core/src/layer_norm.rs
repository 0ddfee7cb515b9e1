use tch::{nn, Kind, Tensor};

/// RMSNorm with a frozen scale. Normalization is computed in f32 and cast back
/// to the input dtype so it stays stable under autocast.
#[derive(Debug)]
pub struct RMSNorm {
    weight: Tensor,
    eps: f64,
}

impl RMSNorm {
    pub fn new(vs: &nn::Path, dim: i64, eps: f64, kind: Kind) -> Self {
        let mut weight = vs.ones_no_train("weight", &[dim]);
        if kind != Kind::Float {
            tch::no_grad(|| weight.set_data(&weight.to_kind(kind)));
        }
        Self { weight, eps }
    }

    /// x: [batch, seq_len, dim]
    pub fn forward(&self, x: &Tensor) -> Tensor {
        let kind = x.kind();
        let xf = x.to_kind(Kind::Float);
        let norm = xf.pow_tensor_scalar(2.0).mean_dim(Some(&[-1i64][..]), true, Kind::Float) + self.eps;
        (xf * norm.rsqrt()).to_kind(kind) * &self.weight
    }
}
