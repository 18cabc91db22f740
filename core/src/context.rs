//! Token estimation and sliding-window compaction.
//!
//! Estimation is a deliberate order-of-magnitude approximation: a character
//! ratio of ~4 chars/token for prose and ~3.5 for code-heavy text, picked by
//! the fraction of non-alphanumeric, non-space characters. The generous
//! thresholds (0.80 warn / 0.90 compact) absorb the imprecision.

use autopoiesis_protocol::Message;
use autopoiesis_protocol::Role;
use tracing::info;
use tracing::warn;

use crate::config::ContextConfig;

pub const CHARS_PER_TOKEN: f64 = 4.0;
pub const CHARS_PER_TOKEN_CODE: f64 = 3.5;

/// Non-alphanumeric density above which text is treated as code.
const CODE_DENSITY_THRESHOLD: f64 = 0.25;

const PREVIEW_CHARS: usize = 120;

/// Estimate the token count of `text`, always at least 1.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 1;
    }
    let total = text.chars().count();
    let non_alnum = text
        .chars()
        .filter(|c| !c.is_alphanumeric() && !c.is_whitespace())
        .count();
    let ratio = if (non_alnum as f64) / (total as f64) > CODE_DENSITY_THRESHOLD {
        CHARS_PER_TOKEN_CODE
    } else {
        CHARS_PER_TOKEN
    };
    (((total as f64) / ratio) as usize).max(1)
}

fn estimate_messages_tokens(messages: &[Message]) -> usize {
    messages.iter().map(|m| estimate_tokens(&m.text())).sum()
}

/// Fraction of the context window consumed by `messages`, warning at the
/// configured threshold.
pub fn check_context_usage(messages: &[Message], config: &ContextConfig) -> f64 {
    let total_tokens = estimate_messages_tokens(messages);
    let fraction = total_tokens as f64 / config.context_window_tokens as f64;
    if fraction >= config.warning_threshold {
        warn!(
            "Context window is {:.1}% full ({} / {} estimated tokens). \
             Compaction may be triggered soon.",
            fraction * 100.0,
            total_tokens,
            config.context_window_tokens,
        );
    }
    fraction
}

/// Replace all but the last `keep_recent` messages with a single synthetic
/// summary once estimated usage exceeds the compaction threshold. A warning
/// is logged from the warning threshold onward, so warning always precedes
/// compaction.
pub fn compact_history(
    messages: Vec<Message>,
    config: &ContextConfig,
    keep_recent: usize,
) -> Vec<Message> {
    let total_tokens = estimate_messages_tokens(&messages);
    let fraction = total_tokens as f64 / config.context_window_tokens as f64;

    if fraction >= config.warning_threshold {
        warn!(
            "Context window is {:.1}% full ({} / {} estimated tokens).",
            fraction * 100.0,
            total_tokens,
            config.context_window_tokens,
        );
    }

    if fraction <= config.compaction_threshold {
        return messages;
    }
    if messages.len() <= keep_recent {
        return messages;
    }

    let split = messages.len() - keep_recent;
    let older = &messages[..split];
    let summary = summarize_older(older);
    info!(
        "Compacting {} older messages (context at {:.1}% of {} tokens).",
        older.len(),
        fraction * 100.0,
        config.context_window_tokens,
    );

    let mut compacted = Vec::with_capacity(keep_recent + 1);
    compacted.push(Message::user(summary));
    compacted.extend_from_slice(&messages[split..]);
    compacted
}

fn summarize_older(messages: &[Message]) -> String {
    let mut lines = Vec::new();
    for msg in messages {
        let text = msg.text();
        if text.is_empty() {
            continue;
        }
        let preview: String = text.chars().take(PREVIEW_CHARS).collect();
        let preview = preview.replace('\n', " ");
        let role = if msg.role == Role::Assistant {
            "assistant"
        } else {
            "user"
        };
        lines.push(format!("[{role}] {preview}"));
    }
    if lines.is_empty() {
        return "[Earlier conversation was compacted to save context space.]".to_string();
    }
    format!(
        "[Compacted {} earlier messages]\n{}",
        messages.len(),
        lines.join("\n")
    )
}
