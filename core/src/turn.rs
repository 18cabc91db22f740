//! Bounded turn execution: one pass through the model under iteration,
//! token and wall-clock guards, surfacing deferred-tool requests instead of
//! executing privileged calls.

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use autopoiesis_protocol::Message;
use autopoiesis_protocol::Part;
use autopoiesis_protocol::Role;
use autopoiesis_protocol::ToolCallRequest;
use futures::StreamExt;
use tracing::warn;

use crate::approval::flow::DeferredToolRequests;
use crate::approval::flow::DeferredToolResults;
use crate::approval::flow::ToolApproval;
use crate::checkpoint::checkpoint_processor;
use crate::client_common::Prompt;
use crate::client_common::ResponseEvent;
use crate::client_common::TokenUsage;
use crate::config::LoopGuards;
use crate::config::warning_threshold;
use crate::config::warning_timeout;
use crate::context::estimate_tokens;
use crate::error::AutopoiesisErr;
use crate::error::Result;
use crate::runtime::Runtime;
use crate::stream::NullStreamHandle;
use crate::stream::StreamHandle;
use crate::tools::ToolDispatch;
use crate::tools::dispatch_tool_call;
use crate::tools::run_approved_call;
use crate::tools::tool_definitions;
use crate::turn::guard::GuardState;

/// Tagged turn outcome; downstream plumbing dispatches on the tag, never on
/// field presence.
#[derive(Debug)]
pub enum TurnOutput {
    Text(String),
    Deferred(DeferredToolRequests),
}

#[derive(Debug)]
pub struct TurnExecution {
    pub output: TurnOutput,
    /// Complete history through this turn.
    pub messages: Vec<Message>,
}

pub struct TurnParams {
    pub work_item_id: String,
    pub prompt: Option<String>,
    pub history: Vec<Message>,
    /// Verified approval decisions when resuming a deferred turn.
    pub deferred_results: Option<DeferredToolResults>,
    pub stream: Option<Arc<dyn StreamHandle>>,
}

/// Execute one turn. The stream handle (when attached) is finalised on
/// every exit path, success or failure.
pub async fn run_turn(rt: &Runtime, params: TurnParams) -> Result<TurnExecution> {
    let handle: Arc<dyn StreamHandle> = params
        .stream
        .clone()
        .unwrap_or_else(|| Arc::new(NullStreamHandle));
    let result = run_turn_inner(rt, params, Arc::clone(&handle)).await;
    handle.close();
    result
}

async fn run_turn_inner(
    rt: &Runtime,
    params: TurnParams,
    handle: Arc<dyn StreamHandle>,
) -> Result<TurnExecution> {
    let mut guard = GuardState::new(rt.loop_guards, params.work_item_id.clone());
    let mut messages = params.history;

    if let Some(prompt) = &params.prompt {
        messages.push(Message::user(prompt.clone()));
    }
    if let Some(results) = &params.deferred_results {
        resume_deferred_calls(rt, &mut messages, results, &handle, &mut guard).await?;
    }

    loop {
        guard.check_timeout()?;
        messages = rt.pipeline().process(messages);

        let prompt = Prompt {
            instructions: rt.instructions.clone(),
            input: messages.clone(),
            tools: tool_definitions(),
        };
        let mut stream = rt
            .client
            .stream(&prompt)
            .await
            .map_err(wrap_provider_err)?;

        let mut turn_text = String::new();
        let mut tool_calls: Vec<ToolCallRequest> = Vec::new();
        let mut thinking_open = false;
        let mut reported_usage: Option<TokenUsage> = None;
        while let Some(event) = stream.next().await {
            guard.check_timeout()?;
            match event.map_err(wrap_provider_err)? {
                ResponseEvent::OutputTextDelta(delta) => {
                    handle.write(&delta);
                    turn_text.push_str(&delta);
                }
                ResponseEvent::ReasoningDelta(delta) => {
                    if !thinking_open {
                        handle.start_thinking();
                        thinking_open = true;
                    }
                    handle.update_thinking(&delta);
                }
                ResponseEvent::ToolCall(call) => tool_calls.push(call),
                ResponseEvent::Completed { token_usage } => {
                    reported_usage = token_usage;
                    break;
                }
            }
        }
        if thinking_open {
            handle.finish_thinking();
        }

        let usage = reported_usage
            .unwrap_or_else(|| estimate_turn_usage(&messages, &turn_text));
        guard.note_usage(usage)?;

        // Record the model's output before dispatching anything, so a
        // checkpoint taken mid-dispatch can reconstruct the pending calls.
        let mut assistant_parts = Vec::new();
        if !turn_text.is_empty() {
            assistant_parts.push(Part::Text {
                text: turn_text.clone(),
            });
        }
        for call in &tool_calls {
            assistant_parts.push(Part::ToolCall {
                tool_call_id: call.tool_call_id.clone(),
                tool_name: call.tool_name.clone(),
                args: call.args.clone(),
            });
        }
        if !assistant_parts.is_empty() {
            messages.push(Message {
                role: Role::Assistant,
                parts: assistant_parts,
            });
        }

        if tool_calls.is_empty() {
            let messages = checkpoint_processor(messages);
            return Ok(TurnExecution {
                output: TurnOutput::Text(turn_text),
                messages,
            });
        }

        let mut deferred: Vec<ToolCallRequest> = Vec::new();
        let mut returns: Vec<Part> = Vec::new();
        for call in tool_calls {
            guard.note_tool_call()?;
            match dispatch_tool_call(rt, &call).await? {
                ToolDispatch::Deferred => deferred.push(call),
                ToolDispatch::Completed { content, status } => {
                    handle.start_tool_call(&call.tool_call_id, &call.tool_name, None);
                    handle.finish_tool_call(&call.tool_call_id, &status, Some(&content));
                    returns.push(Part::ToolReturn {
                        tool_call_id: call.tool_call_id,
                        tool_name: call.tool_name,
                        content,
                    });
                }
            }
        }
        if !returns.is_empty() {
            messages.push(Message {
                role: Role::User,
                parts: returns,
            });
        }

        if !deferred.is_empty() {
            let messages = checkpoint_processor(messages);
            return Ok(TurnExecution {
                output: TurnOutput::Deferred(DeferredToolRequests { calls: deferred }),
                messages,
            });
        }
    }
}

/// Apply verified decisions to the calls the prior turn deferred: approved
/// calls execute now, denied ones become denial returns. The resulting tool
/// returns are appended as one user message.
async fn resume_deferred_calls(
    rt: &Runtime,
    messages: &mut Vec<Message>,
    results: &DeferredToolResults,
    handle: &Arc<dyn StreamHandle>,
    guard: &mut GuardState,
) -> Result<()> {
    let pending = pending_tool_calls(messages);
    let mut returns = Vec::new();
    for call in pending {
        guard.note_tool_call()?;
        handle.start_tool_call(&call.tool_call_id, &call.tool_name, None);
        let (content, status) = match results.get(&call.tool_call_id) {
            Some(ToolApproval::Approved) => {
                (run_approved_call(rt, &call).await?, "completed".to_string())
            }
            Some(ToolApproval::Denied(message)) => (message.clone(), "denied".to_string()),
            None => (
                "User denied this action.".to_string(),
                "denied".to_string(),
            ),
        };
        handle.finish_tool_call(&call.tool_call_id, &status, Some(&content));
        returns.push(Part::ToolReturn {
            tool_call_id: call.tool_call_id,
            tool_name: call.tool_name,
            content,
        });
    }
    if !returns.is_empty() {
        messages.push(Message {
            role: Role::User,
            parts: returns,
        });
    }
    Ok(())
}

/// Tool calls recorded in history that have no matching tool return yet,
/// in model order.
fn pending_tool_calls(messages: &[Message]) -> Vec<ToolCallRequest> {
    let mut answered = std::collections::HashSet::new();
    for msg in messages {
        for part in &msg.parts {
            if let Part::ToolReturn { tool_call_id, .. } = part {
                answered.insert(tool_call_id.clone());
            }
        }
    }
    let mut pending = Vec::new();
    for msg in messages {
        for part in &msg.parts {
            if let Part::ToolCall {
                tool_call_id,
                tool_name,
                args,
            } = part
                && !answered.contains(tool_call_id)
            {
                pending.push(ToolCallRequest {
                    tool_call_id: tool_call_id.clone(),
                    tool_name: tool_name.clone(),
                    args: args.clone(),
                });
            }
        }
    }
    pending
}

/// Fallback when the provider reports no usage: estimate prompt tokens from
/// the sent history and completion tokens from the streamed text.
fn estimate_turn_usage(messages: &[Message], turn_text: &str) -> TokenUsage {
    let prompt_tokens: usize = messages.iter().map(|m| estimate_tokens(&m.text())).sum();
    TokenUsage {
        prompt_tokens: prompt_tokens as u64,
        completion_tokens: estimate_tokens(turn_text) as u64,
    }
}

/// Map transport and schema failures from the model client onto the
/// provider error shape that survives the queue boundary.
fn wrap_provider_err(err: AutopoiesisErr) -> AutopoiesisErr {
    match err {
        AutopoiesisErr::Reqwest(e) => AutopoiesisErr::provider("reqwest::Error", e.to_string()),
        AutopoiesisErr::Json(e) => AutopoiesisErr::provider("serde_json::Error", e.to_string()),
        AutopoiesisErr::Stream(message, _) => {
            AutopoiesisErr::provider("StreamError", message)
        }
        AutopoiesisErr::UnexpectedStatus(status, body) => {
            AutopoiesisErr::provider("HttpStatusError", format!("{status}: {body}"))
        }
        AutopoiesisErr::RetryLimit(status) => {
            AutopoiesisErr::provider("RetryLimitError", status.to_string())
        }
        other => other,
    }
}

mod guard {
    use super::*;

    /// Tracks the three simultaneous guards for one work item and emits
    /// each 80% warning exactly once.
    pub(super) struct GuardState {
        guards: LoopGuards,
        work_item_id: String,
        started: Instant,
        iterations: u64,
        tokens_used: u64,
        warned_iterations: bool,
        warned_tokens: bool,
        warned_timeout: bool,
    }

    impl GuardState {
        pub(super) fn new(guards: LoopGuards, work_item_id: String) -> Self {
            Self {
                guards,
                work_item_id,
                started: Instant::now(),
                iterations: 0,
                tokens_used: 0,
                warned_iterations: false,
                warned_tokens: false,
                warned_timeout: false,
            }
        }

        /// Wall-clock guard, checked before each model invocation and each
        /// streamed chunk. Exactly at the limit does not fire.
        pub(super) fn check_timeout(&mut self) -> Result<()> {
            let elapsed = self.started.elapsed();
            self.check_timeout_elapsed(elapsed)
        }

        fn check_timeout_elapsed(&mut self, elapsed: Duration) -> Result<()> {
            if !self.warned_timeout && elapsed >= warning_timeout(self.guards.work_item_timeout) {
                warn!(
                    "Work item {} reached 80% of wall-clock timeout ({:.1}s/{:.1}s).",
                    self.work_item_id,
                    elapsed.as_secs_f64(),
                    self.guards.work_item_timeout.as_secs_f64(),
                );
                self.warned_timeout = true;
            }
            if elapsed > self.guards.work_item_timeout {
                return Err(AutopoiesisErr::TimeoutExceeded);
            }
            Ok(())
        }

        /// Iteration guard: counts one tool call. Exactly at the cap does
        /// not fire; strictly exceeding does.
        pub(super) fn note_tool_call(&mut self) -> Result<()> {
            self.iterations += 1;
            let limit = self.guards.tool_loop_max_iterations;
            if !self.warned_iterations && self.iterations >= warning_threshold(limit) {
                warn!(
                    "Work item {} reached 80% of tool limit ({}/{} calls).",
                    self.work_item_id, self.iterations, limit,
                );
                self.warned_iterations = true;
            }
            if self.iterations > limit {
                return Err(AutopoiesisErr::ToolLoopExceeded);
            }
            Ok(())
        }

        /// Token guard over cumulative prompt + completion tokens.
        pub(super) fn note_usage(&mut self, usage: TokenUsage) -> Result<()> {
            self.tokens_used += usage.total();
            let budget = self.guards.work_item_token_budget;
            if !self.warned_tokens && self.tokens_used >= warning_threshold(budget) {
                warn!(
                    "Work item {} reached 80% of token limit ({}/{} tokens).",
                    self.work_item_id, self.tokens_used, budget,
                );
                self.warned_tokens = true;
            }
            if self.tokens_used > budget {
                return Err(AutopoiesisErr::TokenBudgetExceeded);
            }
            Ok(())
        }

        #[cfg(test)]
        pub(super) fn check_timeout_at(&mut self, elapsed: Duration) -> Result<()> {
            self.check_timeout_elapsed(elapsed)
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn guards(iterations: u64, tokens: u64, timeout_secs: u64) -> LoopGuards {
        LoopGuards {
            tool_loop_max_iterations: iterations,
            work_item_token_budget: tokens,
            work_item_timeout: Duration::from_secs(timeout_secs),
            deferred_max_rounds: 10,
        }
    }

    #[test]
    fn iteration_guard_fires_only_past_the_cap() {
        let mut guard = GuardState::new(guards(3, 1_000, 300), "w".to_string());
        assert!(guard.note_tool_call().is_ok());
        assert!(guard.note_tool_call().is_ok());
        // Exactly at the cap: no breach.
        assert!(guard.note_tool_call().is_ok());
        // Strictly exceeding: breach.
        assert!(matches!(
            guard.note_tool_call(),
            Err(AutopoiesisErr::ToolLoopExceeded)
        ));
    }

    #[test]
    fn token_guard_fires_only_past_the_budget() {
        let mut guard = GuardState::new(guards(40, 100, 300), "w".to_string());
        let usage = |n| TokenUsage {
            prompt_tokens: n,
            completion_tokens: 0,
        };
        assert!(guard.note_usage(usage(100)).is_ok());
        assert!(matches!(
            guard.note_usage(usage(1)),
            Err(AutopoiesisErr::TokenBudgetExceeded)
        ));
    }

    #[test]
    fn timeout_guard_fires_only_past_the_limit() {
        let mut guard = GuardState::new(guards(40, 1_000, 10), "w".to_string());
        assert!(guard.check_timeout_at(Duration::from_secs(10)).is_ok());
        assert!(matches!(
            guard.check_timeout_at(Duration::from_secs(11)),
            Err(AutopoiesisErr::TimeoutExceeded)
        ));
    }

    #[test]
    fn pending_calls_exclude_answered_ones() {
        let messages = vec![
            Message {
                role: Role::Assistant,
                parts: vec![
                    Part::ToolCall {
                        tool_call_id: "c1".to_string(),
                        tool_name: "shell".to_string(),
                        args: serde_json::json!({"command": "ls"}),
                    },
                    Part::ToolCall {
                        tool_call_id: "c2".to_string(),
                        tool_name: "shell".to_string(),
                        args: serde_json::json!({"command": "rm x"}),
                    },
                ],
            },
            Message {
                role: Role::User,
                parts: vec![Part::ToolReturn {
                    tool_call_id: "c1".to_string(),
                    tool_name: "shell".to_string(),
                    content: "done".to_string(),
                }],
            },
        ];
        let pending = pending_tool_calls(&messages);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].tool_call_id, "c2");
    }

    #[test]
    fn provider_errors_flatten_to_class_and_message() {
        let wrapped = wrap_provider_err(AutopoiesisErr::Stream("boom".to_string(), None));
        assert!(matches!(
            wrapped,
            AutopoiesisErr::Provider { ref class, .. } if class == "StreamError"
        ));
        // Limit breaches pass through untouched.
        assert!(matches!(
            wrap_provider_err(AutopoiesisErr::ToolLoopExceeded),
            AutopoiesisErr::ToolLoopExceeded
        ));
    }
}
