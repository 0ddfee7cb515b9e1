use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const ENDOFTEXT: &str = "<|endoftext|>";
pub const IM_START: &str = "<|im_start|>";
pub const IM_END: &str = "<|im_end|>";

/// Tokens that are matched literally in the input and always map to a single id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialTokens {
    pub tokens: Vec<String>,
    pub eos: String,
    #[serde(default)]
    pub pad: Option<String>,
}

impl Default for SpecialTokens {
    /// ChatML set: `<|endoftext|>` doubles as eos and (implicitly) pad.
    fn default() -> Self {
        Self {
            tokens: vec![ENDOFTEXT.to_string(), IM_START.to_string(), IM_END.to_string()],
            eos: ENDOFTEXT.to_string(),
            pad: None,
        }
    }
}

impl SpecialTokens {
    /// Padding token, falling back to eos when none is configured.
    pub fn pad_or_eos(&self) -> &str {
        self.pad.as_deref().unwrap_or(&self.eos)
    }

    /// Alternation over all special tokens, longest first so that a token that
    /// prefixes another never wins.
    pub fn pattern(&self) -> Result<Option<Regex>> {
        if self.tokens.is_empty() {
            return Ok(None);
        }
        let mut sorted: Vec<&String> = self.tokens.iter().collect();
        sorted.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        let alternation = sorted
            .iter()
            .map(|t| regex::escape(t))
            .collect::<Vec<_>>()
            .join("|");
        Ok(Some(Regex::new(&alternation)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_falls_back_to_eos() {
        let mut special = SpecialTokens::default();
        assert_eq!(special.pad_or_eos(), ENDOFTEXT);
        special.pad = Some("<pad>".into());
        assert_eq!(special.pad_or_eos(), "<pad>");
    }

    #[test]
    fn pattern_matches_literal_delimiters() {
        let re = SpecialTokens::default().pattern().unwrap().unwrap();
        let found: Vec<&str> = re
            .find_iter("<|im_start|>user\nhi<|im_end|>\n")
            .map(|m| m.as_str())
            .collect();
        assert_eq!(found, vec![IM_START, IM_END]);
    }
}
