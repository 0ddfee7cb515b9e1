use lm_core::IGNORE_INDEX;
use tch::{Device, Tensor};

/// One padded training batch, all `[batch, seq]` Int64 tensors.
pub struct Batch {
    pub input_ids: Tensor,
    pub attention_mask: Tensor,
    pub labels: Tensor,
    /// Number of next-token targets that count towards the loss.
    pub num_targets: i64,
}

/// Causal-LM collation: right-pad to the longest sequence in the batch, copy
/// the inputs into `labels` and mask padded positions with [`IGNORE_INDEX`].
#[derive(Debug, Clone, Copy)]
pub struct Collator {
    pad_id: i64,
    device: Device,
}

/// Host-side padded rows, row-major.
#[derive(Debug, PartialEq, Eq)]
pub struct Padded {
    pub width: usize,
    pub input_ids: Vec<i64>,
    pub attention_mask: Vec<i64>,
    pub labels: Vec<i64>,
}

pub fn pad_sequences(seqs: &[&[u32]], pad_id: i64) -> Padded {
    let width = seqs.iter().map(|s| s.len()).max().unwrap_or(0);
    let cells = seqs.len() * width;
    let mut padded = Padded {
        width,
        input_ids: Vec::with_capacity(cells),
        attention_mask: Vec::with_capacity(cells),
        labels: Vec::with_capacity(cells),
    };
    for seq in seqs {
        for pos in 0..width {
            match seq.get(pos) {
                Some(&id) => {
                    padded.input_ids.push(id as i64);
                    padded.attention_mask.push(1);
                    padded.labels.push(id as i64);
                }
                None => {
                    padded.input_ids.push(pad_id);
                    padded.attention_mask.push(0);
                    padded.labels.push(IGNORE_INDEX);
                }
            }
        }
    }
    padded
}

impl Collator {
    pub fn new(pad_id: u32, device: Device) -> Self {
        Self {
            pad_id: pad_id as i64,
            device,
        }
    }

    pub fn collate(&self, seqs: &[&[u32]]) -> Batch {
        let padded = pad_sequences(seqs, self.pad_id);
        let shape = [seqs.len() as i64, padded.width as i64];
        let tensor = |v: &[i64]| Tensor::from_slice(v).view(shape).to_device(self.device);

        Batch {
            input_ids: tensor(&padded.input_ids),
            attention_mask: tensor(&padded.attention_mask),
            labels: tensor(&padded.labels),
            num_targets: seqs.iter().map(|s| s.len().saturating_sub(1) as i64).sum(),
        }
    }
}
