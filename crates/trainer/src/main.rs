use anyhow::{bail, ensure, Context, Result};
use chat_format::{Formatter, RolePolicy};
use clap::Parser;
use lm_core::safetensors_util::load_safetensors_dir;
use lm_core::{CausalLM, ModelConfig};
use std::path::{Path, PathBuf};
use tch::{nn, Cuda, Device};
use tokenizer::BPE;
use trainer::{load_splits, prepare, FineTuneConfig, Trainer};

/// LoRA fine-tuning of a causal LM on ChatML-formatted text-to-SQL conversations.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory with config.json, tokenizer.json and *.safetensors weights
    #[arg(long)]
    model_dir: PathBuf,

    #[arg(long, default_value = "/data/train.jsonl")]
    train_file: PathBuf,

    #[arg(long, default_value = "/data/validation.jsonl")]
    validation_file: PathBuf,

    #[arg(long, default_value = "/output/sql-qwen-finetuned")]
    output_dir: PathBuf,

    /// YAML file with training hyperparameters
    #[arg(long)]
    config: Option<PathBuf>,

    /// Fail on messages whose role is not system, user or assistant
    #[arg(long)]
    strict_roles: bool,

    /// Train on CPU when no GPU is visible
    #[arg(long)]
    allow_cpu: bool,
}

fn select_device(allow_cpu: bool) -> Result<Device> {
    if Cuda::is_available() {
        log::info!("CUDA devices visible: {}", Cuda::device_count());
        return Ok(Device::Cuda(0));
    }
    if !allow_cpu {
        bail!("CUDA is not available; pass --allow-cpu to train on the CPU");
    }
    log::warn!("CUDA is not available, training on CPU");
    Ok(Device::Cpu)
}

fn has_weights(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .any(|e| e.path().extension().map_or(false, |ext| ext == "safetensors"))
        })
        .unwrap_or(false)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let device = select_device(args.allow_cpu)?;

    let mut config = FineTuneConfig::load(args.config.as_deref())?;
    if args.strict_roles {
        config.role_policy = RolePolicy::Strict;
    }
    log::info!(
        "Training config: lr {} | batch {} x {} accumulation | {} epoch(s) | LoRA r={} alpha={} dropout={}",
        config.learning_rate,
        config.batch_size,
        config.gradient_accumulation_steps,
        config.num_epochs,
        config.lora.r,
        config.lora.alpha,
        config.lora.dropout
    );

    let tokenizer_path = args.model_dir.join("tokenizer.json");
    let tokenizer = BPE::load(&tokenizer_path).with_context(|| {
        format!("Failed to load {:?}; build one with `data_prep tokenizer`", tokenizer_path)
    })?;
    let pad_id = tokenizer.pad_token_id()?;

    let model_config = config.resolve_model(ModelConfig::load(args.model_dir.join("config.json"))?, device)?;
    log::info!("Base weights stored as {:?}", model_config.weight_dtype);
    ensure!(
        tokenizer.vocab_size() as i64 <= model_config.vocab_size,
        "Tokenizer has {} tokens but the model only embeds {}",
        tokenizer.vocab_size(),
        model_config.vocab_size
    );

    let mut vs = nn::VarStore::new(device);
    let model = CausalLM::new(&vs.root(), &model_config, Some(&config.lora));
    log::info!("Attached LoRA adapters to {} projections", model.adapted_projections());

    if has_weights(&args.model_dir) {
        let report = load_safetensors_dir(&mut vs, &args.model_dir)?;
        let expected = vs.variables().len() - vs.trainable_variables().len();
        if report.loaded < expected {
            log::warn!("Only {} of {} base tensors found in checkpoint", report.loaded, expected);
        }
        if !report.unexpected.is_empty() {
            log::warn!("Ignored {} checkpoint tensors with no matching variable", report.unexpected.len());
        }
    } else {
        log::warn!("No safetensors weights in {:?}; base model is randomly initialised", args.model_dir);
    }

    let (train_examples, val_examples) = load_splits(&args.train_file, &args.validation_file)?;
    let formatter = Formatter::new(config.role_policy);
    let train_set = prepare(&train_examples, &tokenizer, formatter, config.max_length, config.map_batch_size)
        .context("Failed to prepare training data")?;
    let val_set = prepare(&val_examples, &tokenizer, formatter, config.max_length, config.map_batch_size)
        .context("Failed to prepare validation data")?;

    let mut trainer = Trainer::new(model, vs, config, pad_id, &args.output_dir)?;
    let state = trainer.train(&train_set, &val_set)?;
    log::info!(
        "Training finished after {} steps; best eval_loss {:?} at step {:?}",
        state.global_step,
        state.best_eval_loss,
        state.best_step
    );
    trainer.save_model(&tokenizer)?;

    Ok(())
}
