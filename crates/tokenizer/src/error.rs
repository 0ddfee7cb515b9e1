use thiserror::Error;

#[derive(Error, Debug)]
pub enum TokenizerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("Malformed merges file at line {line}: {text:?}")]
    BadMerge { line: usize, text: String },

    #[error("Special token not in vocabulary: {0}")]
    MissingSpecialToken(String),

    #[error("Token not found: {0}")]
    TokenNotFound(String),
}

pub type Result<T> = std::result::Result<T, TokenizerError>;
