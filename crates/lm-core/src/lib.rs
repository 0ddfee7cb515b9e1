pub mod attention;
pub mod config;
pub mod layer_norm;
pub mod lora;
pub mod rotary;
pub mod safetensors_util;
pub mod transformer;

pub use config::{LoraConfig, ModelConfig, WeightDtype};
pub use lora::LoraLinear;
pub use transformer::{CausalLM, IGNORE_INDEX};

use tch::nn;

/// Trainable vs. total parameter counts of a VarStore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterCount {
    pub trainable: usize,
    pub total: usize,
}

impl ParameterCount {
    pub fn of(vs: &nn::VarStore) -> Self {
        Self {
            trainable: vs.trainable_variables().iter().map(|t| t.numel()).sum(),
            total: vs.variables().values().map(|t| t.numel()).sum(),
        }
    }

    pub fn trainable_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        100.0 * self.trainable as f64 / self.total as f64
    }
}

impl std::fmt::Display for ParameterCount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "trainable params: {} || all params: {} || trainable%: {:.4}",
            self.trainable,
            self.total,
            self.trainable_percent()
        )
    }
}

/// Whether a VarStore variable belongs to a LoRA adapter.
pub fn is_adapter_variable(name: &str) -> bool {
    name.contains("lora_A") || name.contains("lora_B")
}
