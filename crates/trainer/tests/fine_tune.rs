use chat_format::{Example, Formatter, Turn};
use lm_core::safetensors_util::{load_safetensors, save_safetensors};
use lm_core::{is_adapter_variable, CausalLM, LoraConfig, ModelConfig};
use tch::{nn, Device};
use tempfile::TempDir;
use tokenizer::{SpecialTokens, BPE};
use trainer::{prepare, FineTuneConfig, TokenizedDataset, Trainer};

fn conversations() -> Vec<Example> {
    (0..6)
        .map(|i| {
            Example::new(vec![
                Turn::system("You are a SQL assistant."),
                Turn::user(format!("How many orders does customer {} have?", i)),
                Turn::assistant(format!("SELECT COUNT(*) FROM orders WHERE customer_id = {};", i)),
            ])
        })
        .collect()
}

fn tokenizer(examples: &[Example]) -> BPE {
    let texts = chat_format::format_batch(examples).unwrap().text;
    tokenizer::Trainer::new(320, 1, SpecialTokens::default())
        .train_from_texts(&texts)
        .unwrap()
}

fn tiny_model(vocab_size: usize, lora: &LoraConfig) -> (CausalLM, nn::VarStore) {
    let config = ModelConfig {
        n_embd: 32,
        n_head: 4,
        n_kv_head: 2,
        n_layer: 1,
        n_inner: 64,
        vocab_size: vocab_size as i64,
        max_seq_len: 128,
        ..ModelConfig::default()
    };
    let vs = nn::VarStore::new(Device::Cpu);
    let model = CausalLM::new(&vs.root(), &config, Some(lora));
    (model, vs)
}

fn tiny_config() -> FineTuneConfig {
    FineTuneConfig {
        learning_rate: 1e-2,
        batch_size: 2,
        gradient_accumulation_steps: 2,
        num_epochs: 2,
        warmup_steps: 1,
        max_length: 64,
        logging_steps: 1,
        eval_steps: 2,
        save_steps: 2,
        fp16: false,
        lora: LoraConfig {
            r: 2,
            alpha: 4.0,
            dropout: 0.0,
            ..LoraConfig::default()
        },
        ..FineTuneConfig::default()
    }
}

fn datasets(bpe: &BPE, examples: &[Example]) -> (TokenizedDataset, TokenizedDataset) {
    let train = prepare(examples, bpe, Formatter::default(), 64, 4).unwrap();
    let eval = prepare(&examples[..2], bpe, Formatter::default(), 64, 4).unwrap();
    (train, eval)
}

#[test]
fn trains_and_writes_adapter_artifacts() {
    let examples = conversations();
    let bpe = tokenizer(&examples);
    let (train, eval) = datasets(&bpe, &examples);
    let config = tiny_config();
    let (model, vs) = tiny_model(bpe.vocab_size(), &config.lora);

    let out = TempDir::new().unwrap();
    let mut trainer = Trainer::new(model, vs, config, bpe.pad_token_id().unwrap(), out.path()).unwrap();
    assert_eq!(trainer.total_steps(&train), 4);

    let state = trainer.train(&train, &eval).unwrap().clone();
    assert_eq!(state.global_step, 4);
    assert!(state.best_eval_loss.unwrap().is_finite());
    assert!(state.log_history.iter().any(|e| e.loss.is_some()));
    assert!(state.log_history.iter().any(|e| e.eval_loss.is_some()));

    trainer.save_model(&bpe).unwrap();
    for file in [
        "adapter_model.safetensors",
        "adapter_config.json",
        "tokenizer.json",
        "trainer_state.json",
        "training_config.yaml",
        "checkpoint-2/adapter_model.safetensors",
        "checkpoint-4/trainer_state.json",
    ] {
        assert!(out.path().join(file).exists(), "missing {}", file);
    }

    let adapter_config: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(out.path().join("adapter_config.json")).unwrap()).unwrap();
    assert_eq!(adapter_config["r"], 2);
    assert_eq!(adapter_config["target_modules"].as_array().unwrap().len(), 4);
}

#[test]
fn saved_adapter_reproduces_best_eval_loss() {
    let examples = conversations();
    let bpe = tokenizer(&examples);
    let (train, eval) = datasets(&bpe, &examples);
    let config = tiny_config();

    let out = TempDir::new().unwrap();
    let base = TempDir::new().unwrap();
    let base_weights = base.path().join("model.safetensors");
    let (model, vs) = tiny_model(bpe.vocab_size(), &config.lora);
    save_safetensors(&vs, &base_weights, |name| !is_adapter_variable(name), None).unwrap();
    let mut trainer = Trainer::new(model, vs, config.clone(), bpe.pad_token_id().unwrap(), out.path()).unwrap();
    let best = trainer.train(&train, &eval).unwrap().best_eval_loss.unwrap();
    trainer.save_model(&bpe).unwrap();

    let restored = trainer.evaluate(&eval).unwrap().unwrap();
    assert!((restored - best).abs() < 1e-5);

    let reload_dir = TempDir::new().unwrap();
    let (model, mut vs) = tiny_model(bpe.vocab_size(), &config.lora);
    load_safetensors(&mut vs, &base_weights).unwrap();
    let mut fresh = Trainer::new(model, vs, config, bpe.pad_token_id().unwrap(), reload_dir.path()).unwrap();
    fresh.load_adapter(out.path()).unwrap();
    let reloaded = fresh.evaluate(&eval).unwrap().unwrap();
    assert!((reloaded - best).abs() < 1e-5);
}

#[test]
fn refuses_non_empty_output_dir_without_overwrite() {
    let examples = conversations();
    let bpe = tokenizer(&examples);
    let (train, eval) = datasets(&bpe, &examples);
    let config = FineTuneConfig {
        overwrite_output_dir: false,
        ..tiny_config()
    };

    let out = TempDir::new().unwrap();
    std::fs::write(out.path().join("previous.txt"), "run").unwrap();
    let (model, vs) = tiny_model(bpe.vocab_size(), &config.lora);
    let mut trainer = Trainer::new(model, vs, config, bpe.pad_token_id().unwrap(), out.path()).unwrap();
    let err = trainer.train(&train, &eval).unwrap_err();
    assert!(err.to_string().contains("not empty"));
}

#[test]
fn non_finite_loss_stops_before_the_adapter_moves() {
    let examples = conversations();
    let bpe = tokenizer(&examples);
    let (train, eval) = datasets(&bpe, &examples);
    let config = tiny_config();
    let (model, vs) = tiny_model(bpe.vocab_size(), &config.lora);

    let mut lm_head = vs.variables()["lm_head.weight"].shallow_clone();
    tch::no_grad(|| {
        let _ = lm_head.fill_(f64::NAN);
    });
    let lora_b = vs.variables()["model.layers.0.self_attn.q_proj.lora_B"].shallow_clone();

    let out = TempDir::new().unwrap();
    let mut trainer = Trainer::new(model, vs, config, bpe.pad_token_id().unwrap(), out.path()).unwrap();
    let err = trainer.train(&train, &eval).unwrap_err();
    assert!(err.to_string().contains("Loss became NaN at step 1"));

    assert_eq!(lora_b.abs().sum(tch::Kind::Float).double_value(&[]), 0.0);
    assert!(!out.path().join("checkpoint-2").exists());
}
