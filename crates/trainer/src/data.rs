use anyhow::{Context, Result};
use chat_format::{load_jsonl, Example, Formatter};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use std::path::Path;
use tokenizer::BPE;

/// Token ids per example, index-aligned with the source JSONL.
#[derive(Debug, Clone, Default)]
pub struct TokenizedDataset {
    pub input_ids: Vec<Vec<u32>>,
}

impl TokenizedDataset {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    pub fn total_tokens(&self) -> usize {
        self.input_ids.iter().map(Vec::len).sum()
    }

    /// Indices of sequences long enough to provide a next-token target.
    pub fn trainable_indices(&self) -> Vec<usize> {
        (0..self.len()).filter(|&i| self.input_ids[i].len() >= 2).collect()
    }

    /// `trainable_indices` in a seeded random order.
    pub fn shuffled_indices(&self, seed: u64) -> Vec<usize> {
        let mut indices = self.trainable_indices();
        indices.shuffle(&mut StdRng::seed_from_u64(seed));
        indices
    }
}

/// Read the training and validation JSONL files.
pub fn load_splits(train_file: &Path, val_file: &Path) -> Result<(Vec<Example>, Vec<Example>)> {
    log::info!("Loading dataset from {:?} and {:?}", train_file, val_file);
    let train = load_jsonl(train_file).with_context(|| format!("Failed to load {:?}", train_file))?;
    let val = load_jsonl(val_file).with_context(|| format!("Failed to load {:?}", val_file))?;
    log::info!(
        "Loaded {} training examples, {} validation examples",
        train.len(),
        val.len()
    );
    Ok((train, val))
}

/// Format and tokenize `examples` in batches of `map_batch_size`.
///
/// Batches run in parallel; each one is an independent formatter call. Any
/// failing batch fails the whole preparation. Output order matches input.
pub fn prepare(
    examples: &[Example],
    tokenizer: &BPE,
    formatter: Formatter,
    max_length: usize,
    map_batch_size: usize,
) -> Result<TokenizedDataset> {
    let batches = examples
        .par_chunks(map_batch_size)
        .enumerate()
        .map(|(b, chunk)| {
            let start = b * map_batch_size;
            let formatted = formatter.format_batch(chunk).with_context(|| {
                format!("Failed to format batch {} (examples {}..{})", b, start, start + chunk.len())
            })?;
            Ok(tokenizer.encode_batch(&formatted.text, Some(max_length)))
        })
        .collect::<Result<Vec<Vec<Vec<u32>>>>>()?;

    let dataset = TokenizedDataset {
        input_ids: batches.into_iter().flatten().collect(),
    };
    let truncated = dataset.input_ids.iter().filter(|ids| ids.len() == max_length).count();
    log::info!(
        "Tokenized {} examples ({} tokens, {} at max_length {})",
        dataset.len(),
        dataset.total_tokens(),
        truncated,
        max_length
    );
    Ok(dataset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_format::Turn;
    use tokenizer::{SpecialTokens, Trainer};

    fn examples(n: usize) -> Vec<Example> {
        (0..n)
            .map(|i| {
                Example::new(vec![
                    Turn::user(format!("How many rows in t{}", i)),
                    Turn::assistant(format!("SELECT COUNT(*) FROM t{}", i)),
                ])
            })
            .collect()
    }

    fn tokenizer(examples: &[Example]) -> BPE {
        let texts = chat_format::format_batch(examples).unwrap().text;
        Trainer::new(400, 1, SpecialTokens::default())
            .train_from_texts(&texts)
            .unwrap()
    }

    #[test]
    fn batching_preserves_order() {
        let ex = examples(7);
        let bpe = tokenizer(&ex);
        let ds = prepare(&ex, &bpe, Formatter::default(), 512, 3).unwrap();
        assert_eq!(ds.len(), 7);
        for (ids, example) in ds.input_ids.iter().zip(&ex) {
            let text = chat_format::format_example(example).unwrap();
            assert_eq!(ids, &bpe.encode(&text));
        }
    }

    #[test]
    fn truncates_without_padding() {
        let ex = examples(2);
        let bpe = tokenizer(&ex);
        let ds = prepare(&ex, &bpe, Formatter::default(), 5, 10).unwrap();
        assert!(ds.input_ids.iter().all(|ids| ids.len() == 5));
    }

    #[test]
    fn one_bad_example_fails_preparation() {
        let mut ex = examples(4);
        ex[2].messages.as_mut().unwrap()[1].content = None;
        let bpe = tokenizer(&ex[..2]);
        let err = prepare(&ex, &bpe, Formatter::default(), 64, 2).unwrap_err();
        assert!(format!("{:#}", err).contains("batch 1"));
    }

    #[test]
    fn empty_conversations_are_kept_but_not_trainable() {
        let mut ex = examples(3);
        ex[1] = Example::new(vec![]);
        let bpe = tokenizer(&ex);
        let ds = prepare(&ex, &bpe, Formatter::default(), 64, 8).unwrap();
        assert_eq!(ds.len(), 3);
        assert!(ds.input_ids[1].is_empty());
        assert_eq!(ds.trainable_indices(), vec![0, 2]);

        let mut a = ds.shuffled_indices(1);
        a.sort();
        assert_eq!(a, vec![0, 2]);
    }
}
