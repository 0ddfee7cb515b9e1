use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::{FormatError, Result};
use crate::message::Example;

/// Read a JSON-lines dataset fully into memory, one example per non-blank line.
pub fn load_jsonl<P: AsRef<Path>>(path: P) -> Result<Vec<Example>> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let examples = read_jsonl(BufReader::new(file))?;
    log::debug!("Read {} examples from {:?}", examples.len(), path);
    Ok(examples)
}

pub fn read_jsonl<R: BufRead>(reader: R) -> Result<Vec<Example>> {
    let mut examples = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let example: Example =
            serde_json::from_str(&line).map_err(|source| FormatError::Json { line: i + 1, source })?;
        examples.push(example);
    }
    Ok(examples)
}
