use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FormatError, Result};
use crate::message::{value_text, Example, Role, Turn};
use crate::{IM_END, IM_START};

/// What to do with a turn whose role is not system/user/assistant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RolePolicy {
    /// Skip the turn; it contributes no text.
    #[default]
    Lenient,
    /// Fail the whole batch.
    Strict,
}

/// Output of a batch call. `text[i]` belongs to input example `i`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormattedBatch {
    pub text: Vec<String>,
}

impl FormattedBatch {
    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Stateless ChatML renderer. Cheap to copy and safe to share across threads.
#[derive(Debug, Clone, Copy, Default)]
pub struct Formatter {
    policy: RolePolicy,
}

impl Formatter {
    pub fn new(policy: RolePolicy) -> Self {
        Self { policy }
    }

    pub fn strict() -> Self {
        Self::new(RolePolicy::Strict)
    }

    /// Render one example. `index` is only used in error reports.
    pub fn format_example(&self, index: usize, example: &Example) -> Result<String> {
        let turns = example
            .messages
            .as_ref()
            .ok_or(FormatError::MissingMessages { example: index })?;

        let mut text = String::new();
        for (t, turn) in turns.iter().enumerate() {
            let Turn { role, content } = turn;
            let role = role.as_deref().ok_or(FormatError::MissingField {
                example: index,
                turn: t,
                field: "role",
            })?;
            let content = content.as_deref().ok_or(FormatError::MissingField {
                example: index,
                turn: t,
                field: "content",
            })?;
            self.push_turn(&mut text, index, t, role, content)?;
        }
        Ok(text)
    }

    pub fn format_batch(&self, examples: &[Example]) -> Result<FormattedBatch> {
        let text = examples
            .iter()
            .enumerate()
            .map(|(i, ex)| self.format_example(i, ex))
            .collect::<Result<Vec<_>>>()?;
        Ok(FormattedBatch { text })
    }

    /// Render a column-shaped batch, `{"messages": [[turn, ...], ...]}`.
    ///
    /// Values are converted exactly as when loading a typed [`Turn`]: a
    /// non-string `role` (including `null`) can never match a known role and
    /// is handled by the policy, a non-string `content` is rendered as its
    /// JSON text. Only an absent key is missing.
    pub fn format_batch_json(&self, batch: &Value) -> Result<FormattedBatch> {
        let column = batch
            .get("messages")
            .ok_or_else(|| FormatError::MalformedBatch("missing `messages` column".to_string()))?
            .as_array()
            .ok_or_else(|| FormatError::MalformedBatch("`messages` is not a list".to_string()))?;

        let mut out = Vec::with_capacity(column.len());
        for (i, example) in column.iter().enumerate() {
            let turns = example.as_array().ok_or_else(|| {
                FormatError::MalformedBatch(format!("example {} is not a list of turns", i))
            })?;

            let mut text = String::new();
            for (t, turn) in turns.iter().enumerate() {
                let role = turn.get("role").ok_or(FormatError::MissingField {
                    example: i,
                    turn: t,
                    field: "role",
                })?;
                let content = turn.get("content").ok_or(FormatError::MissingField {
                    example: i,
                    turn: t,
                    field: "content",
                })?;

                self.push_turn(&mut text, i, t, &value_text(role), &value_text(content))?;
            }
            out.push(text);
        }
        Ok(FormattedBatch { text: out })
    }

    fn push_turn(&self, text: &mut String, example: usize, turn: usize, role: &str, content: &str) -> Result<()> {
        match Role::parse(role) {
            Some(role) => {
                text.push_str(IM_START);
                text.push_str(role.as_str());
                text.push('\n');
                text.push_str(content);
                text.push_str(IM_END);
                text.push('\n');
                Ok(())
            }
            None => match self.policy {
                RolePolicy::Lenient => {
                    log::trace!("example {}, turn {}: dropping role {:?}", example, turn, role);
                    Ok(())
                }
                RolePolicy::Strict => Err(FormatError::UnrecognizedRole {
                    example,
                    turn,
                    role: role.to_string(),
                }),
            },
        }
    }
}

/// Render one example with the lenient policy.
pub fn format_example(example: &Example) -> Result<String> {
    Formatter::default().format_example(0, example)
}

/// Render a batch with the lenient policy.
pub fn format_batch(examples: &[Example]) -> Result<FormattedBatch> {
    Formatter::default().format_batch(examples)
}

/// Render a column-shaped JSON batch with the lenient policy.
pub fn format_batch_json(batch: &Value) -> Result<FormattedBatch> {
    Formatter::default().format_batch_json(batch)
}
