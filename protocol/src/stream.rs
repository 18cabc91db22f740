//! Streaming event payloads forwarded to attached observers.
//!
//! Each event carries an `op` tag and a `data` object so clients can
//! dispatch on the tag and tolerate unknown ops.

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "op", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Incremental model output text.
    Token { content: String },

    /// A tool call has started.
    ToolCall {
        tool_call_id: String,
        name: String,
        #[serde(default)]
        details: Option<String>,
    },

    /// A tool call has finished.
    ToolResult {
        tool_call_id: String,
        status: String,
        #[serde(default)]
        details: Option<String>,
    },

    ThinkingStart {},

    /// Incremental reasoning text.
    Thinking { content: String },

    ThinkingDone {},

    /// Streaming is complete for this turn.
    Done {},
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn token_event_carries_op_tag() {
        let ev = StreamEvent::Token {
            content: "hi".to_string(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["op"], "token");
        assert_eq!(json["data"]["content"], "hi");
    }

    #[test]
    fn done_round_trips() {
        let json = serde_json::to_string(&StreamEvent::Done {}).unwrap();
        let back: StreamEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, StreamEvent::Done {});
    }
}
