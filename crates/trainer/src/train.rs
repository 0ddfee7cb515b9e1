use anyhow::{bail, Context, Result};
use lm_core::safetensors_util::{load_safetensors, save_safetensors};
use lm_core::{is_adapter_variable, CausalLM, ParameterCount};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tch::{nn, nn::OptimizerConfig, Device, Tensor};
use tokenizer::BPE;

use crate::collator::Collator;
use crate::data::TokenizedDataset;
use crate::FineTuneConfig;

pub const ADAPTER_WEIGHTS: &str = "adapter_model.safetensors";
pub const ADAPTER_CONFIG: &str = "adapter_config.json";
pub const TRAINER_STATE: &str = "trainer_state.json";

/// Linear warmup from 0 to 1 over `warmup` steps, then linear decay to 0 at
/// `total`. `step` counts optimizer steps already taken.
pub fn lr_factor(step: usize, warmup: usize, total: usize) -> f64 {
    if step < warmup {
        return step as f64 / warmup.max(1) as f64;
    }
    let remaining = total.saturating_sub(step) as f64;
    (remaining / total.saturating_sub(warmup).max(1) as f64).max(0.0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerState {
    pub global_step: usize,
    pub epoch: usize,
    pub eval_loss: Option<f64>,
    pub best_eval_loss: Option<f64>,
    pub best_step: Option<usize>,
    pub log_history: Vec<LogEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub step: usize,
    pub epoch: usize,
    pub learning_rate: f64,
    pub loss: Option<f64>,
    pub eval_loss: Option<f64>,
}

#[derive(Serialize)]
struct AdapterConfig<'a> {
    r: i64,
    lora_alpha: f64,
    lora_dropout: f64,
    target_modules: &'a [String],
    task_type: &'static str,
    base_model: &'a lm_core::ModelConfig,
}

/// LoRA fine-tuning loop over a [`CausalLM`] whose base weights are frozen.
pub struct Trainer {
    config: FineTuneConfig,
    model: CausalLM,
    vs: nn::VarStore,
    optimizer: nn::Optimizer,
    collator: Collator,
    output_dir: PathBuf,
    device: Device,
    state: TrainerState,
    best_adapter: Option<Vec<(String, Tensor)>>,
}

impl Trainer {
    pub fn new(
        model: CausalLM,
        vs: nn::VarStore,
        config: FineTuneConfig,
        pad_id: u32,
        output_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let adamw = nn::AdamW {
            wd: config.weight_decay,
            ..Default::default()
        };
        let optimizer = adamw.build(&vs, config.learning_rate)?;
        let device = vs.device();

        log::info!("{}", ParameterCount::of(&vs));

        Ok(Self {
            collator: Collator::new(pad_id, device),
            config,
            model,
            vs,
            optimizer,
            output_dir: output_dir.into(),
            device,
            state: TrainerState {
                global_step: 0,
                epoch: 0,
                eval_loss: None,
                best_eval_loss: None,
                best_step: None,
                log_history: Vec::new(),
            },
            best_adapter: None,
        })
    }

    fn use_autocast(&self) -> bool {
        self.config.fp16 && self.device.is_cuda()
    }

    fn prepare_output_dir(&self) -> Result<()> {
        if self.output_dir.exists() {
            let occupied = std::fs::read_dir(&self.output_dir)?.next().is_some();
            if occupied && !self.config.overwrite_output_dir {
                bail!(
                    "Output directory {:?} is not empty; set overwrite_output_dir to reuse it",
                    self.output_dir
                );
            }
            for entry in std::fs::read_dir(&self.output_dir)? {
                let path = entry?.path();
                let is_checkpoint = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map_or(false, |n| n.starts_with("checkpoint-"));
                if is_checkpoint && path.is_dir() {
                    std::fs::remove_dir_all(&path)?;
                }
            }
        }
        std::fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("Failed to create output directory {:?}", self.output_dir))?;
        Ok(())
    }

    /// Number of optimizer steps the run will take.
    pub fn total_steps(&self, train: &TokenizedDataset) -> usize {
        let micro = train.trainable_indices().len().div_ceil(self.config.batch_size);
        micro.div_ceil(self.config.gradient_accumulation_steps) * self.config.num_epochs
    }

    pub fn train(&mut self, train: &TokenizedDataset, eval: &TokenizedDataset) -> Result<&TrainerState> {
        self.prepare_output_dir()?;

        let skipped = train.len() - train.trainable_indices().len();
        if skipped > 0 {
            log::warn!("Skipping {} training examples with fewer than 2 tokens", skipped);
        }
        let total = self.total_steps(train);
        if total == 0 {
            bail!("Training set has no usable examples");
        }
        log::info!(
            "Starting training: {} examples, {} epoch(s), {} optimizer steps, effective batch {}",
            train.len(),
            self.config.num_epochs,
            total,
            self.config.effective_batch_size()
        );

        let accum = self.config.gradient_accumulation_steps;
        for epoch in 0..self.config.num_epochs {
            self.state.epoch = epoch;
            let order = train.shuffled_indices(self.config.seed + epoch as u64);
            let micro_batches: Vec<&[usize]> = order.chunks(self.config.batch_size).collect();

            let mut window_loss = 0.0;
            for (window_idx, window) in micro_batches.chunks(accum).enumerate() {
                for indices in window {
                    let seqs: Vec<&[u32]> = indices.iter().map(|&i| train.input_ids[i].as_slice()).collect();
                    let batch = self.collator.collate(&seqs);

                    let loss = tch::autocast(self.use_autocast(), || {
                        let logits = self.model.forward_t(&batch.input_ids, Some(&batch.attention_mask), true);
                        CausalLM::loss(&logits, &batch.labels)
                    });
                    (&loss / window.len() as f64).backward();
                    window_loss += loss.double_value(&[]) / window.len() as f64;
                }

                // Adapter weights must not see gradients from a non-finite loss
                if !window_loss.is_finite() {
                    self.optimizer.zero_grad();
                    bail!(
                        "Loss became {} at step {} (epoch {}, window {})",
                        window_loss,
                        self.state.global_step + 1,
                        epoch,
                        window_idx
                    );
                }

                let lr = self.config.learning_rate * lr_factor(self.state.global_step, self.config.warmup_steps, total);
                self.optimizer.set_lr(lr);
                if self.config.max_grad_norm > 0.0 {
                    self.optimizer.clip_grad_norm(self.config.max_grad_norm);
                }
                self.optimizer.step();
                self.optimizer.zero_grad();
                self.state.global_step += 1;

                let step = self.state.global_step;
                if self.config.logging_steps > 0 && step % self.config.logging_steps == 0 {
                    log::info!("Epoch {} | Step {}/{} | loss {:.4} | lr {:.3e}", epoch, step, total, window_loss, lr);
                    self.record(lr, Some(window_loss), None);
                }
                window_loss = 0.0;

                if self.config.eval_steps > 0 && step % self.config.eval_steps == 0 {
                    self.evaluate_and_track(eval, lr)?;
                }
                if self.config.save_steps > 0 && step % self.config.save_steps == 0 {
                    self.save_checkpoint()?;
                }
            }
        }

        if self.config.load_best_model_at_end {
            // Always evaluate the final weights so they compete with earlier checkpoints
            let lr = self.config.learning_rate * lr_factor(self.state.global_step, self.config.warmup_steps, total);
            self.evaluate_and_track(eval, lr)?;
            self.restore_best()?;
        }
        Ok(&self.state)
    }

    fn record(&mut self, lr: f64, loss: Option<f64>, eval_loss: Option<f64>) {
        self.state.log_history.push(LogEntry {
            step: self.state.global_step,
            epoch: self.state.epoch,
            learning_rate: lr,
            loss,
            eval_loss,
        });
    }

    fn evaluate_and_track(&mut self, eval: &TokenizedDataset, lr: f64) -> Result<()> {
        let Some(eval_loss) = self.evaluate(eval)? else {
            return Ok(());
        };
        log::info!("Step {} | eval_loss {:.4}", self.state.global_step, eval_loss);
        self.state.eval_loss = Some(eval_loss);
        self.record(lr, None, Some(eval_loss));

        let improved = self.state.best_eval_loss.map_or(true, |best| eval_loss < best);
        if improved {
            self.state.best_eval_loss = Some(eval_loss);
            self.state.best_step = Some(self.state.global_step);
            if self.config.load_best_model_at_end {
                self.best_adapter = Some(self.adapter_snapshot());
            }
        }
        Ok(())
    }

    /// Token-weighted mean loss over the evaluation set, or `None` when it has
    /// no usable examples.
    pub fn evaluate(&self, eval: &TokenizedDataset) -> Result<Option<f64>> {
        let indices = eval.trainable_indices();
        if indices.is_empty() {
            return Ok(None);
        }

        let mut weighted = 0.0;
        let mut targets = 0i64;
        tch::no_grad(|| {
            for chunk in indices.chunks(self.config.batch_size) {
                let seqs: Vec<&[u32]> = chunk.iter().map(|&i| eval.input_ids[i].as_slice()).collect();
                let batch = self.collator.collate(&seqs);
                let loss = tch::autocast(self.use_autocast(), || {
                    let logits = self.model.forward_t(&batch.input_ids, Some(&batch.attention_mask), false);
                    CausalLM::loss(&logits, &batch.labels)
                });
                weighted += loss.double_value(&[]) * batch.num_targets as f64;
                targets += batch.num_targets;
            }
        });
        Ok(Some(weighted / targets as f64))
    }

    fn adapter_snapshot(&self) -> Vec<(String, Tensor)> {
        self.vs
            .variables()
            .into_iter()
            .filter(|(name, _)| is_adapter_variable(name))
            .map(|(name, t)| (name, t.detach().copy()))
            .collect()
    }

    fn restore_best(&mut self) -> Result<()> {
        let Some(best) = self.best_adapter.take() else {
            return Ok(());
        };
        let mut variables = self.vs.variables();
        tch::no_grad(|| {
            for (name, saved) in &best {
                if let Some(var) = variables.get_mut(name) {
                    var.copy_(saved);
                }
            }
        });
        log::info!(
            "Restored best adapter from step {} (eval_loss {:.4})",
            self.state.best_step.unwrap_or_default(),
            self.state.best_eval_loss.unwrap_or(f64::NAN)
        );
        Ok(())
    }

    fn write_adapter(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let lora = self.model.lora.clone().unwrap_or_default();

        let mut metadata = HashMap::new();
        metadata.insert("format".to_string(), "pt".to_string());
        metadata.insert("r".to_string(), lora.r.to_string());
        metadata.insert("lora_alpha".to_string(), lora.alpha.to_string());
        metadata.insert("target_modules".to_string(), lora.target_modules.join(","));
        let written = save_safetensors(&self.vs, dir.join(ADAPTER_WEIGHTS), is_adapter_variable, Some(metadata))?;

        let adapter_config = AdapterConfig {
            r: lora.r,
            lora_alpha: lora.alpha,
            lora_dropout: lora.dropout,
            target_modules: &lora.target_modules,
            task_type: "CAUSAL_LM",
            base_model: &self.model.config,
        };
        std::fs::write(dir.join(ADAPTER_CONFIG), serde_json::to_string_pretty(&adapter_config)?)?;
        log::debug!("Wrote {} adapter tensors to {:?}", written, dir);
        Ok(())
    }

    pub fn save_checkpoint(&self) -> Result<PathBuf> {
        let dir = self.output_dir.join(format!("checkpoint-{}", self.state.global_step));
        self.write_adapter(&dir)?;
        std::fs::write(dir.join(TRAINER_STATE), serde_json::to_string_pretty(&self.state)?)?;
        log::info!("Saved checkpoint to {:?}", dir);
        Ok(dir)
    }

    /// Write the final adapter, tokenizer, state and resolved config to the
    /// output directory.
    pub fn save_model(&self, tokenizer: &BPE) -> Result<()> {
        self.write_adapter(&self.output_dir)?;
        tokenizer
            .save(self.output_dir.join("tokenizer.json"))
            .context("Failed to save tokenizer")?;
        std::fs::write(self.output_dir.join(TRAINER_STATE), serde_json::to_string_pretty(&self.state)?)?;
        std::fs::write(
            self.output_dir.join("training_config.yaml"),
            serde_yaml::to_string(&self.config)?,
        )?;
        log::info!("Model saved to: {:?}", self.output_dir);
        Ok(())
    }

    /// Load adapter weights from a directory written by [`Trainer::save_model`]
    /// or [`Trainer::save_checkpoint`].
    pub fn load_adapter(&mut self, dir: &Path) -> Result<()> {
        let report = load_safetensors(&mut self.vs, dir.join(ADAPTER_WEIGHTS))?;
        if !report.unexpected.is_empty() {
            bail!("Adapter has tensors unknown to this model: {:?}", report.unexpected);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_warms_up_then_decays() {
        assert_eq!(lr_factor(0, 4, 10), 0.0);
        assert_eq!(lr_factor(2, 4, 10), 0.5);
        assert_eq!(lr_factor(4, 4, 10), 1.0);
        assert_eq!(lr_factor(7, 4, 10), 0.5);
        assert_eq!(lr_factor(10, 4, 10), 0.0);
        assert_eq!(lr_factor(12, 4, 10), 0.0);
    }

    #[test]
    fn schedule_without_warmup_starts_at_full_rate() {
        assert_eq!(lr_factor(0, 0, 4), 1.0);
        assert_eq!(lr_factor(3, 0, 4), 0.25);
    }
}
