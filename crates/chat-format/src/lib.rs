//! ChatML rendering of role-tagged conversations for causal LM fine-tuning.
//!
//! Training records are JSON objects with a `messages` list of turns. Each turn
//! is wrapped in `<|im_start|>{role}\n ... <|im_end|>\n` and the turns of one
//! record are concatenated in order into a single `text` string.

pub mod error;
pub mod format;
pub mod jsonl;
pub mod message;

pub use error::{FormatError, Result};
pub use format::{format_batch, format_batch_json, format_example, FormattedBatch, Formatter, RolePolicy};
pub use jsonl::{load_jsonl, read_jsonl};
pub use message::{Example, Role, Turn};

pub const IM_START: &str = "<|im_start|>";
pub const IM_END: &str = "<|im_end|>";
