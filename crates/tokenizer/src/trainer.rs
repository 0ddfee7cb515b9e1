use regex::Regex;
use std::collections::{HashMap, HashSet};

use crate::bpe::{PRETOKENIZE_PATTERN, BPE};
use crate::error::Result;
use crate::special::SpecialTokens;
use crate::vocab::Vocab;

/// Learns a BPE vocabulary. Special tokens get the lowest ids and are never
/// split or merged.
pub struct Trainer {
    vocab_size: usize,
    min_frequency: u32,
    special: SpecialTokens,
}

impl Trainer {
    pub fn new(vocab_size: usize, min_frequency: u32, special: SpecialTokens) -> Self {
        Self {
            vocab_size,
            min_frequency,
            special,
        }
    }

    pub fn train_from_texts<S: AsRef<str>>(&self, texts: &[S]) -> Result<BPE> {
        let regex = Regex::new(PRETOKENIZE_PATTERN)?;
        let special = self.special.pattern()?;

        let mut word_counts: HashMap<String, u32> = HashMap::new();
        for text in texts {
            count_words(text.as_ref(), &regex, special.as_ref(), &mut word_counts);
        }
        self.train_on_counts(word_counts)
    }

    fn train_on_counts(&self, word_counts: HashMap<String, u32>) -> Result<BPE> {
        log::info!("Unique words: {}", word_counts.len());

        let mut split_words: HashMap<String, Vec<String>> = word_counts
            .keys()
            .map(|word| (word.clone(), word.chars().map(|c| c.to_string()).collect()))
            .collect();

        let mut vocab = Vocab::new();
        let mut merges: HashMap<(String, String), u32> = HashMap::new();

        for token in self.special.tokens.iter().chain([&self.special.eos]).chain(self.special.pad.as_ref()) {
            if vocab.get_id(token).is_none() {
                vocab.insert(token.clone(), vocab.len() as u32);
            }
        }

        let mut base_chars: Vec<String> = split_words
            .values()
            .flatten()
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        base_chars.sort();
        for ch in base_chars {
            if vocab.get_id(&ch).is_none() {
                vocab.insert(ch, vocab.len() as u32);
            }
        }

        // Byte fallback tokens <0x00>..<0xFF>
        for i in 0..256 {
            let s = format!("<0x{:02X}>", i);
            if vocab.get_id(&s).is_none() {
                vocab.insert(s, vocab.len() as u32);
            }
        }

        log::info!("Initial vocab size: {}", vocab.len());

        let mut merge_count = 0;
        while vocab.len() < self.vocab_size {
            let mut pair_counts: HashMap<(String, String), u32> = HashMap::new();
            for (word, count) in &word_counts {
                if let Some(tokens) = split_words.get(word) {
                    for pair in tokens.windows(2) {
                        *pair_counts.entry((pair[0].clone(), pair[1].clone())).or_insert(0) += count;
                    }
                }
            }

            // Highest count wins; ties go to the lexicographically smallest pair
            let best = pair_counts
                .into_iter()
                .filter(|(_, count)| *count >= self.min_frequency)
                .max_by(|(pa, ca), (pb, cb)| ca.cmp(cb).then_with(|| pb.cmp(pa)));

            let Some(((first, second), _)) = best else {
                log::info!("No more pairs to merge. Stopping.");
                break;
            };

            let new_token = format!("{}{}", first, second);
            if vocab.get_id(&new_token).is_none() {
                vocab.insert(new_token.clone(), vocab.len() as u32);
            }
            merges.insert((first.clone(), second.clone()), merge_count);
            merge_count += 1;

            for tokens in split_words.values_mut() {
                let mut merged = Vec::with_capacity(tokens.len());
                let mut i = 0;
                while i < tokens.len() {
                    if i + 1 < tokens.len() && tokens[i] == first && tokens[i + 1] == second {
                        merged.push(new_token.clone());
                        i += 2;
                    } else {
                        merged.push(tokens[i].clone());
                        i += 1;
                    }
                }
                *tokens = merged;
            }

            if vocab.len() % 100 == 0 {
                log::debug!("Vocab size: {}", vocab.len());
            }
        }

        log::info!("Trained BPE: {} tokens, {} merges", vocab.len(), merges.len());
        BPE::new(vocab, merges, self.special.clone())
    }
}

fn count_words(text: &str, regex: &Regex, special: Option<&Regex>, counts: &mut HashMap<String, u32>) {
    let pieces: Vec<&str> = match special {
        Some(special) => special.split(text).collect(),
        None => vec![text],
    };
    for piece in pieces {
        for mat in regex.find_iter(piece) {
            *counts.entry(mat.as_str().to_string()).or_insert(0) += 1;
        }
    }
}
