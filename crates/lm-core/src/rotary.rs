use tch::{Device, Kind, Tensor};

/// Rotary position embedding over the full head dimension (half-split layout).
pub struct RotaryEmbedding {
    inv_freq: Tensor,
}

impl RotaryEmbedding {
    pub fn new(head_dim: i64, theta: f64, device: Device) -> Self {
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| (1.0 / theta.powf(i as f64 / head_dim as f64)) as f32)
            .collect();
        Self {
            inv_freq: Tensor::from_slice(&inv_freq).to(device),
        }
    }

    /// Returns `(cos, sin)`, each `[1, 1, seq_len, head_dim]`.
    pub fn tables(&self, seq_len: i64) -> (Tensor, Tensor) {
        let t = Tensor::arange(seq_len, (Kind::Float, self.inv_freq.device()));
        let freqs = t.outer(&self.inv_freq);
        let emb = Tensor::cat(&[&freqs, &freqs], -1).unsqueeze(0).unsqueeze(0);
        (emb.cos(), emb.sin())
    }

    /// x: [batch, n_head, seq_len, head_dim]
    pub fn apply(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Tensor {
        let kind = x.kind();
        let x = x.to_kind(Kind::Float);
        let rotated = (&x * cos) + (Self::rotate_half(&x) * sin);
        rotated.to_kind(kind)
    }

    fn rotate_half(x: &Tensor) -> Tensor {
        let half = x.size()[x.dim() - 1] / 2;
        let x1 = x.narrow(-1, 0, half);
        let x2 = x.narrow(-1, half, half);
        Tensor::cat(&[&-x2, &x1], -1)
    }
}
