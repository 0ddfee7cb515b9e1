use anyhow::{ensure, Context, Result};
use chat_format::{load_jsonl, Formatter, RolePolicy};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tokenizer::{SpecialTokens, Trainer};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render a conversation JSONL file to sharded ChatML text
    Format {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long)]
        output_dir: PathBuf,

        #[arg(short, long, default_value_t = 1000)]
        lines_per_shard: usize,

        /// Fail on messages whose role is not system, user or assistant
        #[arg(long)]
        strict_roles: bool,
    },
    /// Train a ChatML-aware BPE tokenizer on a conversation JSONL file
    Tokenizer {
        #[arg(short, long)]
        input: PathBuf,

        /// Where to write tokenizer.json
        #[arg(short, long, default_value = "tokenizer.json")]
        output: PathBuf,

        #[arg(short, long, default_value_t = 32000)]
        vocab_size: usize,

        /// Minimum frequency for a pair to be merged
        #[arg(long, default_value_t = 2)]
        min_frequency: u32,
    },
}

fn policy(strict: bool) -> RolePolicy {
    if strict {
        RolePolicy::Strict
    } else {
        RolePolicy::Lenient
    }
}

/// Write `texts` as `{"text": ...}` lines into `shard_XXXX.jsonl` files.
/// Returns the number of shards created.
fn write_shards(texts: &[String], output_dir: &Path, lines_per_shard: usize) -> Result<usize> {
    ensure!(lines_per_shard > 0, "lines_per_shard must be > 0");
    std::fs::create_dir_all(output_dir)?;

    let mut shards = 0;
    for chunk in texts.chunks(lines_per_shard) {
        let shard_path = output_dir.join(format!("shard_{:04}.jsonl", shards));
        log::info!("Creating shard: {:?}", shard_path);
        let mut writer = BufWriter::new(File::create(&shard_path)?);
        for text in chunk {
            writeln!(writer, "{}", serde_json::json!({ "text": text }))?;
        }
        writer.flush()?;
        shards += 1;
    }
    Ok(shards)
}

fn format(input: &Path, output_dir: &Path, lines_per_shard: usize, strict: bool) -> Result<()> {
    let examples = load_jsonl(input).with_context(|| format!("Failed to load {:?}", input))?;
    let formatted = Formatter::new(policy(strict)).format_batch(&examples)?;
    let shards = write_shards(&formatted.text, output_dir, lines_per_shard)?;
    println!("Done. Created {} shards from {} examples.", shards, formatted.len());
    Ok(())
}

fn train_tokenizer(input: &Path, output: &Path, vocab_size: usize, min_frequency: u32) -> Result<()> {
    let examples = load_jsonl(input).with_context(|| format!("Failed to load {:?}", input))?;
    let formatted = Formatter::default().format_batch(&examples)?;
    let bpe = Trainer::new(vocab_size, min_frequency, SpecialTokens::default()).train_from_texts(&formatted.text)?;
    bpe.save(output)?;
    println!("Saved tokenizer with {} tokens to {:?}", bpe.vocab_size(), output);
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Commands::Format {
            input,
            output_dir,
            lines_per_shard,
            strict_roles,
        } => format(&input, &output_dir, lines_per_shard, strict_roles),
        Commands::Tokenizer {
            input,
            output,
            vocab_size,
            min_frequency,
        } => train_tokenizer(&input, &output, vocab_size, min_frequency),
    }
}
