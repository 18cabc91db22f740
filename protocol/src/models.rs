//! Message history model rewritten by the history-processor pipeline and
//! persisted verbatim into checkpoints.

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message in a conversation history. Tool returns travel inside
/// user-role messages; tool calls inside assistant-role messages.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
    },
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        args: serde_json::Value,
    },
    ToolReturn {
        tool_call_id: String,
        tool_name: String,
        content: String,
    },
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            parts: vec![Part::Text { text: text.into() }],
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![Part::Text { text: text.into() }],
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            parts: vec![Part::Text { text: text.into() }],
        }
    }

    /// Concatenated text content used for token estimation and compaction
    /// previews. Tool-call arguments are not counted; tool returns are.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            let chunk = match part {
                Part::Text { text } => text.as_str(),
                Part::ToolReturn { content, .. } => content.as_str(),
                Part::ToolCall { .. } => continue,
            };
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(chunk);
        }
        out
    }

    /// True when the message starts with `marker` in its first text part.
    pub fn starts_with_marker(&self, marker: &str) -> bool {
        matches!(
            self.parts.first(),
            Some(Part::Text { text }) if text.starts_with(marker)
        )
    }
}

/// Serialize a history to the JSON form used by checkpoints and
/// `WorkItemOutput.message_history_json`.
pub fn history_to_json(messages: &[Message]) -> serde_json::Result<String> {
    serde_json::to_string(messages)
}

/// Inverse of [`history_to_json`]. `None` or empty input yields an empty
/// history.
pub fn history_from_json(history_json: Option<&str>) -> serde_json::Result<Vec<Message>> {
    match history_json {
        None => Ok(Vec::new()),
        Some(raw) if raw.trim().is_empty() => Ok(Vec::new()),
        Some(raw) => serde_json::from_str(raw),
    }
}
