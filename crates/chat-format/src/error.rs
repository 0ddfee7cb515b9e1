use thiserror::Error;

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid JSON on line {line}: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("example {example}: missing field `messages`")]
    MissingMessages { example: usize },

    #[error("example {example}, turn {turn}: missing field `{field}`")]
    MissingField {
        example: usize,
        turn: usize,
        field: &'static str,
    },

    #[error("example {example}, turn {turn}: unrecognized role `{role}`")]
    UnrecognizedRole {
        example: usize,
        turn: usize,
        role: String,
    },

    #[error("malformed batch: {0}")]
    MalformedBatch(String),
}

pub type Result<T> = std::result::Result<T, FormatError>;
