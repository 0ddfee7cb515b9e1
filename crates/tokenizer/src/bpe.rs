use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::error::{Result, TokenizerError};
use crate::special::SpecialTokens;
use crate::vocab::Vocab;

pub(crate) const PRETOKENIZE_PATTERN: &str =
    r"'s|'t|'re|'ve|'m|'ll|'d| ?\p{L}+| ?\p{N}+| ?[^\s\p{L}\p{N}]+|\s+";

/// On-disk layout of `tokenizer.json`. Merges are stored in rank order as
/// `"left right"` strings.
#[derive(Serialize, Deserialize)]
struct TokenizerFile {
    vocab: HashMap<String, u32>,
    merges: Vec<String>,
    special_tokens: SpecialTokens,
}

#[derive(Clone)]
pub struct BPE {
    pub vocab: Vocab,
    pub merges: HashMap<(String, String), u32>,
    pub special: SpecialTokens,
    regex: Regex,
    special_regex: Option<Regex>,
}

// Custom Debug impl to skip regex
impl std::fmt::Debug for BPE {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BPE")
            .field("vocab_size", &self.vocab.len())
            .field("merges_count", &self.merges.len())
            .field("special_tokens", &self.special.tokens)
            .finish()
    }
}

fn byte_token(byte: u8) -> String {
    format!("<0x{:02X}>", byte)
}

fn parse_byte_token(token: &str) -> Option<u8> {
    let hex = token.strip_prefix("<0x")?.strip_suffix('>')?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}

impl BPE {
    /// Every special token (and the eos/pad tokens) must already be in `vocab`.
    pub fn new(vocab: Vocab, merges: HashMap<(String, String), u32>, special: SpecialTokens) -> Result<Self> {
        for token in special.tokens.iter().chain([&special.eos]).chain(special.pad.as_ref()) {
            if vocab.get_id(token).is_none() {
                return Err(TokenizerError::MissingSpecialToken(token.clone()));
            }
        }
        let special_regex = special.pattern()?;
        Ok(Self {
            vocab,
            merges,
            special,
            regex: Regex::new(PRETOKENIZE_PATTERN)?,
            special_regex,
        })
    }

    pub fn from_files<P: AsRef<Path>>(vocab_path: P, merges_path: P, special: SpecialTokens) -> Result<Self> {
        let vocab = Vocab::load(vocab_path)?;

        let file = File::open(merges_path)?;
        let reader = BufReader::new(file);
        let mut merges = HashMap::new();

        for (i, line_res) in reader.lines().enumerate() {
            let line = line_res?;
            // Also covers the "#version" header
            if line.starts_with('#') || line.trim().is_empty() {
                continue;
            }

            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() != 2 {
                return Err(TokenizerError::BadMerge { line: i + 1, text: line });
            }
            let rank = merges.len() as u32;
            merges.insert((parts[0].to_string(), parts[1].to_string()), rank);
        }

        Self::new(vocab, merges, special)
    }

    /// Write `vocab.json` and `merges.txt` (rank order) into `dir`.
    pub fn save_files<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        self.vocab.save(dir.join("vocab.json"))?;

        let mut file = BufWriter::new(File::create(dir.join("merges.txt"))?);
        writeln!(file, "#version: 0.2")?;
        for (first, second) in self.sorted_merges() {
            writeln!(file, "{} {}", first, second)?;
        }
        file.flush()?;
        Ok(())
    }

    fn sorted_merges(&self) -> Vec<&(String, String)> {
        let mut sorted: Vec<_> = self.merges.iter().collect();
        sorted.sort_by_key(|&(_, rank)| *rank);
        sorted.into_iter().map(|(pair, _)| pair).collect()
    }

    fn get_pairs(word: &[String]) -> HashSet<(String, String)> {
        let mut pairs = HashSet::new();
        if word.len() < 2 {
            return pairs;
        }
        for i in 0..word.len() - 1 {
            pairs.insert((word[i].clone(), word[i + 1].clone()));
        }
        pairs
    }

    fn bpe(&self, token: &str) -> Vec<String> {
        let mut word: Vec<String> = token.chars().map(|c| c.to_string()).collect();

        loop {
            let pairs = Self::get_pairs(&word);
            if pairs.is_empty() {
                break;
            }

            let mut best_pair: Option<(String, String)> = None;
            let mut min_rank = u32::MAX;

            for pair in &pairs {
                if let Some(&rank) = self.merges.get(pair) {
                    if rank < min_rank {
                        min_rank = rank;
                        best_pair = Some(pair.clone());
                    }
                }
            }

            let Some((first, second)) = best_pair else {
                break;
            };

            let mut new_word = Vec::with_capacity(word.len());
            let mut i = 0;
            while i < word.len() {
                if i < word.len() - 1 && word[i] == first && word[i + 1] == second {
                    new_word.push(format!("{}{}", first, second));
                    i += 2;
                } else {
                    new_word.push(word[i].clone());
                    i += 1;
                }
            }

            word = new_word;
            if word.len() == 1 {
                break;
            }
        }

        word
    }

    /// Encode text that contains no special tokens.
    fn encode_ordinary(&self, text: &str, ids: &mut Vec<u32>) {
        for mat in self.regex.find_iter(text) {
            for token in self.bpe(mat.as_str()) {
                if let Some(id) = self.vocab.get_id(&token) {
                    ids.push(id);
                    continue;
                }
                // Byte fallback
                for byte in token.bytes() {
                    match self.vocab.get_id(&byte_token(byte)) {
                        Some(id) => ids.push(id),
                        None => log::warn!("No id for byte 0x{:02X} in token {:?}; dropped", byte, token),
                    }
                }
            }
        }
    }

    /// Encode `text`, mapping every special token occurrence to its single id.
    pub fn encode(&self, text: &str) -> Vec<u32> {
        let mut ids = Vec::new();
        let mut last = 0;
        if let Some(special) = &self.special_regex {
            for mat in special.find_iter(text) {
                self.encode_ordinary(&text[last..mat.start()], &mut ids);
                if let Some(id) = self.vocab.get_id(mat.as_str()) {
                    ids.push(id);
                }
                last = mat.end();
            }
        }
        self.encode_ordinary(&text[last..], &mut ids);
        ids
    }

    /// Encode and keep only the first `max_tokens` ids. Never pads.
    pub fn encode_with_max_tokens(&self, text: &str, max_tokens: usize) -> Vec<u32> {
        let mut ids = self.encode(text);
        ids.truncate(max_tokens);
        ids
    }

    /// Encode a batch in parallel. Output order follows input order.
    pub fn encode_batch<S: AsRef<str> + Sync>(&self, texts: &[S], max_length: Option<usize>) -> Vec<Vec<u32>> {
        texts
            .par_iter()
            .map(|text| match max_length {
                Some(max) => self.encode_with_max_tokens(text.as_ref(), max),
                None => self.encode(text.as_ref()),
            })
            .collect()
    }

    pub fn decode(&self, ids: &[u32]) -> String {
        let mut bytes = Vec::new();
        for id in ids {
            if let Some(token) = self.vocab.get_token(*id) {
                match parse_byte_token(token) {
                    Some(byte) => bytes.push(byte),
                    None => bytes.extend_from_slice(token.as_bytes()),
                }
            }
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn token_id(&self, token: &str) -> Result<u32> {
        self.vocab
            .get_id(token)
            .ok_or_else(|| TokenizerError::TokenNotFound(token.to_string()))
    }

    pub fn eos_token_id(&self) -> Result<u32> {
        self.token_id(&self.special.eos)
    }

    /// Pad id; the eos id when no pad token is configured.
    pub fn pad_token_id(&self) -> Result<u32> {
        self.token_id(self.special.pad_or_eos())
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = TokenizerFile {
            vocab: self.vocab.token_to_id.clone(),
            merges: self
                .sorted_merges()
                .into_iter()
                .map(|(a, b)| format!("{} {}", a, b))
                .collect(),
            special_tokens: self.special.clone(),
        };
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, &file)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let file: TokenizerFile = serde_json::from_reader(reader)?;

        let mut merges = HashMap::with_capacity(file.merges.len());
        for (rank, merge) in file.merges.iter().enumerate() {
            let (first, second) = merge.split_once(' ').ok_or_else(|| TokenizerError::BadMerge {
                line: rank + 1,
                text: merge.clone(),
            })?;
            merges.insert((first.to_string(), second.to_string()), rank as u32);
        }

        Self::new(Vocab::from_token_map(file.vocab), merges, file.special_tokens)
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::special::{ENDOFTEXT, IM_END, IM_START};

    fn tiny() -> BPE {
        let mut vocab = Vocab::new();
        for token in [ENDOFTEXT, IM_START, IM_END, "u", "s", "e", "r", "us", "user", "\n", "h", "i", "hi"] {
            vocab.insert(token.to_string(), vocab.len() as u32);
        }
        for b in 0..=255u8 {
            vocab.insert(byte_token(b), vocab.len() as u32);
        }
        let mut merges = HashMap::new();
        merges.insert(("u".to_string(), "s".to_string()), 0);
        merges.insert(("e".to_string(), "r".to_string()), 1);
        merges.insert(("us".to_string(), "er".to_string()), 2);
        merges.insert(("h".to_string(), "i".to_string()), 3);
        vocab.insert("er".to_string(), vocab.len() as u32);
        BPE::new(vocab, merges, SpecialTokens::default()).unwrap()
    }

    #[test]
    fn special_tokens_encode_to_single_ids() {
        let bpe = tiny();
        let ids = bpe.encode("<|im_start|>user\nhi<|im_end|>\n");
        let start = bpe.token_id(IM_START).unwrap();
        let end = bpe.token_id(IM_END).unwrap();
        assert_eq!(ids.first(), Some(&start));
        assert_eq!(ids.iter().filter(|&&id| id == end).count(), 1);
        assert_eq!(bpe.decode(&ids), "<|im_start|>user\nhi<|im_end|>\n");
    }

    #[test]
    fn truncation_never_pads() {
        let bpe = tiny();
        let full = bpe.encode("<|im_start|>user\nhi<|im_end|>\n");
        assert_eq!(bpe.encode_with_max_tokens("<|im_start|>user\nhi<|im_end|>\n", 2), full[..2].to_vec());
        assert_eq!(bpe.encode_with_max_tokens("hi", 100), bpe.encode("hi"));
        assert!(bpe.encode_with_max_tokens("", 8).is_empty());
    }

    #[test]
    fn unknown_text_falls_back_to_bytes() {
        let bpe = tiny();
        let ids = bpe.encode("é");
        assert_eq!(ids.len(), 2);
        assert_eq!(bpe.decode(&ids), "é");
    }

    #[test]
    fn missing_special_token_is_rejected() {
        let vocab = Vocab::new();
        let err = BPE::new(vocab, HashMap::new(), SpecialTokens::default()).unwrap_err();
        assert!(matches!(err, TokenizerError::MissingSpecialToken(_)));
    }

    #[test]
    fn json_roundtrip_preserves_encoding() {
        let bpe = tiny();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokenizer.json");
        bpe.save(&path).unwrap();
        let loaded = BPE::load(&path).unwrap();
        let text = "<|im_start|>user\nhi user<|im_end|>\n";
        assert_eq!(loaded.encode(text), bpe.encode(text));
        assert_eq!(loaded.pad_token_id().unwrap(), bpe.eos_token_id().unwrap());
    }
}
