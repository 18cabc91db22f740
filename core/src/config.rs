//! Environment-driven configuration and per-work-item loop guards.

use std::time::Duration;

use env_flags::env_flags;

use crate::error::AutopoiesisErr;
use crate::error::EnvVarError;
use crate::error::Result;

env_flags! {
    /// Model slug sent to the chat-completions endpoint.
    pub AUTOPOIESIS_MODEL: &str = "gpt-4.1-mini";
    pub AUTOPOIESIS_API_BASE: &str = "https://api.openai.com/v1";

    /// Bearer token for the model provider; requests are sent without
    /// authentication when unset (local providers).
    pub AUTOPOIESIS_API_KEY: Option<&str> = None;
    pub AUTOPOIESIS_REQUEST_MAX_RETRIES: u64 = 4;

    pub AUTOPOIESIS_STREAM_IDLE_TIMEOUT_MS: Duration = Duration::from_millis(300_000), |value| {
        value.parse().map(Duration::from_millis)
    };
}

pub const DEFAULT_CONTEXT_WINDOW_TOKENS: usize = 100_000;
pub const DEFAULT_WARNING_THRESHOLD: f64 = 0.80;

/// Must stay strictly below 1.0 so compaction fires before the window
/// overflows, and above the warning threshold so a warning always precedes
/// compaction.
pub const DEFAULT_COMPACTION_THRESHOLD: f64 = 0.90;

const WARNING_RATIO: f64 = 0.8;

/// Fixed per-work-item budgets enforced by the turn executor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopGuards {
    /// Maximum tool calls in a single turn.
    pub tool_loop_max_iterations: u64,
    /// Cumulative prompt + completion tokens per work item.
    pub work_item_token_budget: u64,
    /// Wall-clock budget measured from turn start.
    pub work_item_timeout: Duration,
    /// Maximum approval round trips the batch submitter will drive.
    pub deferred_max_rounds: u64,
}

impl Default for LoopGuards {
    fn default() -> Self {
        Self {
            tool_loop_max_iterations: 40,
            work_item_token_budget: 120_000,
            work_item_timeout: Duration::from_secs(300),
            deferred_max_rounds: 10,
        }
    }
}

/// 80% warning threshold for an integer limit, never below 1.
pub fn warning_threshold(limit: u64) -> u64 {
    (((limit as f64) * WARNING_RATIO).ceil() as u64).max(1)
}

/// 80% warning threshold for a wall-clock budget.
pub fn warning_timeout(limit: Duration) -> Duration {
    limit.mul_f64(WARNING_RATIO)
}

/// Context-window sizing used by the compaction processor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextConfig {
    pub context_window_tokens: usize,
    pub warning_threshold: f64,
    pub compaction_threshold: f64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            context_window_tokens: DEFAULT_CONTEXT_WINDOW_TOKENS,
            warning_threshold: DEFAULT_WARNING_THRESHOLD,
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
        }
    }
}

impl ContextConfig {
    /// Read `CONTEXT_WINDOW_TOKENS`, `CONTEXT_WARNING_THRESHOLD` and
    /// `COMPACTION_THRESHOLD`. Malformed values are hard errors naming the
    /// variable rather than silent fallbacks.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(raw) = non_empty_env("CONTEXT_WINDOW_TOKENS") {
            let value: usize = raw
                .parse()
                .map_err(|_| env_err("CONTEXT_WINDOW_TOKENS", "must be a positive integer"))?;
            if value == 0 {
                return Err(env_err("CONTEXT_WINDOW_TOKENS", "must be a positive integer"));
            }
            config.context_window_tokens = value;
        }
        if let Some(raw) = non_empty_env("CONTEXT_WARNING_THRESHOLD") {
            config.warning_threshold = parse_fraction("CONTEXT_WARNING_THRESHOLD", &raw)?;
        }
        if let Some(raw) = non_empty_env("COMPACTION_THRESHOLD") {
            config.compaction_threshold = parse_fraction("COMPACTION_THRESHOLD", &raw)?;
        }
        Ok(config)
    }
}

fn non_empty_env(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

fn parse_fraction(var: &str, raw: &str) -> Result<f64> {
    let value: f64 = raw
        .parse()
        .map_err(|_| env_err(var, "must be a float strictly between 0 and 1"))?;
    if !(0.0 < value && value < 1.0) {
        return Err(env_err(var, "must be a float strictly between 0 and 1"));
    }
    Ok(value)
}

fn env_err(var: &str, instructions: &str) -> AutopoiesisErr {
    AutopoiesisErr::EnvVar(EnvVarError {
        var: var.to_string(),
        instructions: Some(instructions.to_string()),
    })
}
